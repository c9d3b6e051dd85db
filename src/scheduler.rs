//! Learning-rate schedules stepped on the validation metric.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    config::DistillError,
    engine::StateDict,
    manifest::{ComponentSpec, Kwargs},
};

pub const REDUCE_ON_PLATEAU_TYPE: &str = "rf_distill.ReduceOnPlateau";

/// Metric-driven learning-rate schedule.
///
/// Stepped once per validation pass with the metric and the optimizer's
/// current learning rate; returns the new rate when it should change.
pub trait LrScheduler {
    fn step(&mut self, metric: f64, current_lr: f64) -> Option<f64>;

    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), DistillError>;

    fn spec(&self) -> Result<ComponentSpec, DistillError>;
}

/// Halve (or scale by `factor`) the learning rate once the metric has not
/// improved for `patience` validation passes.
#[derive(Debug, Clone)]
pub struct ReduceOnPlateau {
    factor: f64,
    patience: usize,
    min_lr: f64,
    best: f64,
    num_bad_epochs: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct PlateauState {
    #[serde(with = "crate::checkpoint::finite_f64")]
    best: f64,
    num_bad_epochs: usize,
}

impl ReduceOnPlateau {
    pub fn new(factor: f64, patience: usize, min_lr: f64) -> Result<Self, DistillError> {
        let mut errors = Vec::new();
        if !(factor > 0.0 && factor < 1.0) {
            errors.push("scheduler factor must be in (0, 1)".to_string());
        }
        if min_lr < 0.0 {
            errors.push("scheduler min_lr must not be negative".to_string());
        }
        if !errors.is_empty() {
            return Err(DistillError::validation(errors));
        }
        Ok(Self {
            factor,
            patience,
            min_lr,
            best: f64::INFINITY,
            num_bad_epochs: 0,
        })
    }

    pub fn from_kwargs(kwargs: &Kwargs) -> Result<Self, DistillError> {
        let factor = kwargs
            .get("factor")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.5);
        let patience = kwargs
            .get("patience")
            .and_then(|v| v.as_u64())
            .unwrap_or(10) as usize;
        let min_lr = kwargs
            .get("min_lr")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        Self::new(factor, patience, min_lr)
    }
}

impl LrScheduler for ReduceOnPlateau {
    fn step(&mut self, metric: f64, current_lr: f64) -> Option<f64> {
        if metric < self.best {
            self.best = metric;
            self.num_bad_epochs = 0;
            return None;
        }
        self.num_bad_epochs += 1;
        if self.num_bad_epochs <= self.patience {
            return None;
        }
        self.num_bad_epochs = 0;
        let next = (current_lr * self.factor).max(self.min_lr);
        (next < current_lr).then_some(next)
    }

    fn state_dict(&self) -> StateDict {
        serde_json::to_value(PlateauState {
            best: self.best,
            num_bad_epochs: self.num_bad_epochs,
        })
        .unwrap_or(StateDict::Null)
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), DistillError> {
        let state: PlateauState = serde_json::from_value(state.clone())
            .map_err(|err| DistillError::corrupt(format!("scheduler state: {}", err)))?;
        self.best = state.best;
        self.num_bad_epochs = state.num_bad_epochs;
        Ok(())
    }

    fn spec(&self) -> Result<ComponentSpec, DistillError> {
        Ok(ComponentSpec::new(REDUCE_ON_PLATEAU_TYPE)
            .with_kwarg("factor", json!(self.factor))
            .with_kwarg("patience", json!(self.patience))
            .with_kwarg("min_lr", json!(self.min_lr)))
    }
}
