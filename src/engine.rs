//! Collaborator traits for the opaque compute engine.
//!
//! The harness never does tensor math itself. Models, optimizers, losses and
//! metrics are external collaborators implementing these traits; the trainer
//! only drives their lifecycle. Every collaborator is self-describing via
//! [`spec`](Model::spec): it reports the type path and constructor kwargs that
//! rebuild an equivalent instance through the
//! [`ComponentRegistry`](crate::manifest::ComponentRegistry).

use std::{any::Any, fmt, str::FromStr};

use ndarray::ArrayD;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{config::DistillError, manifest::ComponentSpec};

/// Opaque numeric state blob, produced and consumed by the compute engine.
pub type StateDict = serde_json::Value;

/// Compute device a model and its numeric state live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{}", index),
        }
    }
}

impl FromStr for Device {
    type Err = DistillError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value == "cpu" {
            return Ok(Device::Cpu);
        }
        if let Some(index) = value.strip_prefix("cuda:") {
            let index = index
                .parse::<usize>()
                .map_err(|_| DistillError::config(format!("invalid device '{}'", value)))?;
            return Ok(Device::Cuda(index));
        }
        if value == "cuda" {
            return Ok(Device::Cuda(0));
        }
        Err(DistillError::config(format!("invalid device '{}'", value)))
    }
}

impl Serialize for Device {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Device {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(de::Error::custom)
    }
}

/// The deep model under training (the "enhancer" network).
///
/// Forward/backward delegate to the differentiable-programming framework;
/// the trainer treats both as opaque. `as_any_mut` is the downcast seam for
/// optimizers that need access to their concrete model.
pub trait Model {
    fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, DistillError>;

    /// Backpropagate the (possibly scaled) loss through the engine.
    fn backward(&mut self, loss: f64) -> Result<(), DistillError>;

    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), DistillError>;

    fn to_device(&mut self, device: Device) -> Result<(), DistillError>;

    fn set_train(&mut self, train: bool);

    fn spec(&self) -> Result<ComponentSpec, DistillError>;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Parameter-update collaborator. Receives the live model on every step so
/// the harness never stores parameter references of its own.
pub trait Optimizer {
    /// Apply one update. `grad_scale` multiplies gradients before the update;
    /// it is `1.0` in full precision and the inverse loss scale in mixed
    /// precision, so gradients are unscaled exactly once.
    fn step(&mut self, model: &mut dyn Model, grad_scale: f64) -> Result<(), DistillError>;

    fn zero_grad(&mut self, model: &mut dyn Model);

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), DistillError>;

    fn spec(&self) -> Result<ComponentSpec, DistillError>;
}

pub trait Loss {
    fn compute(&self, prediction: &ArrayD<f32>, target: &ArrayD<f32>)
        -> Result<f64, DistillError>;

    fn spec(&self) -> Result<ComponentSpec, DistillError>;
}

impl std::fmt::Debug for dyn Loss + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Loss")
    }
}

/// Validation metric; lower is better.
pub trait Metric {
    fn evaluate(
        &self,
        prediction: &ArrayD<f32>,
        target: &ArrayD<f32>,
    ) -> Result<f64, DistillError>;

    fn spec(&self) -> Result<ComponentSpec, DistillError>;
}

/// Sample source wrapped by a [`BatchLoader`](crate::data::BatchLoader).
///
/// Datasets must be able to snapshot their own construction metadata; a
/// dataset that cannot is rejected when the reconstruction manifest is built,
/// not silently skipped.
pub trait Dataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sample(&self, index: usize) -> Result<(ArrayD<f32>, ArrayD<f32>), DistillError>;

    fn spec(&self) -> Result<ComponentSpec, DistillError>;
}
