//! Toy components shared by the integration tests: a linear model whose
//! gradient bookkeeping is simple enough to verify by hand, an SGD optimizer,
//! MSE loss, MAE metric and a deterministic synthetic dataset.

use std::{
    any::Any,
    sync::{Arc, Mutex},
};

use ndarray::{ArrayD, IxDyn};
use serde_json::json;

use rf_distill::{
    ComponentRegistry, ComponentSpec, Dataset, Device, DistillError, Kwargs, LogSamples, Loss,
    Metric, Model, Optimizer, StateDict, TrainLogger,
};

pub const TOY_DATASET_TYPE: &str = "tests.ToyDataset";
pub const TOY_MODEL_TYPE: &str = "tests.ToyModel";
pub const TOY_SGD_TYPE: &str = "tests.ToySgd";
pub const MSE_LOSS_TYPE: &str = "tests.MseLoss";
pub const MAE_METRIC_TYPE: &str = "tests.MaeMetric";

/// Deterministic regression dataset: target is exactly twice the input.
pub struct ToyDataset {
    len: usize,
    seed: u64,
}

impl ToyDataset {
    pub fn new(len: usize, seed: u64) -> Self {
        Self { len, seed }
    }
}

impl Dataset for ToyDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn sample(&self, index: usize) -> Result<(ArrayD<f32>, ArrayD<f32>), DistillError> {
        let x = ((index as u64 * 31 + self.seed) % 97) as f32 / 97.0;
        let input = ArrayD::from_elem(IxDyn(&[1]), x);
        let target = ArrayD::from_elem(IxDyn(&[1]), 2.0 * x);
        Ok((input, target))
    }

    fn spec(&self) -> Result<ComponentSpec, DistillError> {
        Ok(ComponentSpec::new(TOY_DATASET_TYPE)
            .with_kwarg("len", self.len as u64)
            .with_kwarg("seed", self.seed))
    }
}

/// `y = w * x` with a scalar weight. The "gradient" recorded by `backward`
/// is just the received loss value, so the SGD update becomes
/// `w -= lr * loss * grad_scale`; with dynamic loss scaling the scale factor
/// cancels exactly, which keeps mixed and full precision runs identical.
pub struct ToyModel {
    weight: f64,
    initial_weight: f64,
    pub pending_grad: f64,
    pub train_mode: bool,
    pub device: Device,
}

impl ToyModel {
    pub fn new(initial_weight: f64) -> Self {
        Self {
            weight: initial_weight,
            initial_weight,
            pending_grad: 0.0,
            train_mode: true,
            device: Device::Cpu,
        }
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn apply_update(&mut self, delta: f64) {
        self.weight -= delta;
    }
}

impl Model for ToyModel {
    fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, DistillError> {
        Ok(input.mapv(|x| x * self.weight as f32))
    }

    fn backward(&mut self, loss: f64) -> Result<(), DistillError> {
        self.pending_grad = loss;
        Ok(())
    }

    fn state_dict(&self) -> StateDict {
        json!({ "weight": self.weight })
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), DistillError> {
        self.weight = state
            .get("weight")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| DistillError::corrupt("toy model state has no weight"))?;
        Ok(())
    }

    fn to_device(&mut self, device: Device) -> Result<(), DistillError> {
        self.device = device;
        Ok(())
    }

    fn set_train(&mut self, train: bool) {
        self.train_mode = train;
    }

    fn spec(&self) -> Result<ComponentSpec, DistillError> {
        Ok(ComponentSpec::new(TOY_MODEL_TYPE).with_kwarg("initial_weight", self.initial_weight))
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct ToySgd {
    lr: f64,
}

impl ToySgd {
    pub fn new(lr: f64) -> Self {
        Self { lr }
    }
}

impl Optimizer for ToySgd {
    fn step(&mut self, model: &mut dyn Model, grad_scale: f64) -> Result<(), DistillError> {
        let model = model
            .as_any_mut()
            .downcast_mut::<ToyModel>()
            .ok_or_else(|| DistillError::computation("toy sgd expects a toy model"))?;
        let delta = self.lr * model.pending_grad * grad_scale;
        model.apply_update(delta);
        Ok(())
    }

    fn zero_grad(&mut self, model: &mut dyn Model) {
        if let Some(model) = model.as_any_mut().downcast_mut::<ToyModel>() {
            model.pending_grad = 0.0;
        }
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn state_dict(&self) -> StateDict {
        json!({ "lr": self.lr })
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), DistillError> {
        self.lr = state
            .get("lr")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| DistillError::corrupt("toy sgd state has no lr"))?;
        Ok(())
    }

    fn spec(&self) -> Result<ComponentSpec, DistillError> {
        Ok(ComponentSpec::new(TOY_SGD_TYPE).with_kwarg("lr", self.lr))
    }
}

pub struct MseLoss;

impl Loss for MseLoss {
    fn compute(
        &self,
        prediction: &ArrayD<f32>,
        target: &ArrayD<f32>,
    ) -> Result<f64, DistillError> {
        let n = prediction.len().max(1) as f64;
        Ok(prediction
            .iter()
            .zip(target.iter())
            .map(|(p, t)| ((p - t) as f64).powi(2))
            .sum::<f64>()
            / n)
    }

    fn spec(&self) -> Result<ComponentSpec, DistillError> {
        Ok(ComponentSpec::new(MSE_LOSS_TYPE))
    }
}

pub struct MaeMetric;

impl Metric for MaeMetric {
    fn evaluate(
        &self,
        prediction: &ArrayD<f32>,
        target: &ArrayD<f32>,
    ) -> Result<f64, DistillError> {
        let n = prediction.len().max(1) as f64;
        Ok(prediction
            .iter()
            .zip(target.iter())
            .map(|(p, t)| (p - t).abs() as f64)
            .sum::<f64>()
            / n)
    }

    fn spec(&self) -> Result<ComponentSpec, DistillError> {
        Ok(ComponentSpec::new(MAE_METRIC_TYPE))
    }
}

/// Records every training iteration and validation metric it is handed.
pub struct RecordingLogger {
    pub train_iterations: Arc<Mutex<Vec<usize>>>,
    pub validation_metrics: Arc<Mutex<Vec<f64>>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self {
            train_iterations: Arc::new(Mutex::new(Vec::new())),
            validation_metrics: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn handles(&self) -> (Arc<Mutex<Vec<usize>>>, Arc<Mutex<Vec<f64>>>) {
        (
            Arc::clone(&self.train_iterations),
            Arc::clone(&self.validation_metrics),
        )
    }
}

impl TrainLogger for RecordingLogger {
    fn log_train(
        &mut self,
        iteration: usize,
        _loss: f64,
        _learning_rate: f64,
        _samples: Option<LogSamples<'_>>,
    ) {
        self.train_iterations.lock().unwrap().push(iteration);
    }

    fn log_validation(
        &mut self,
        _iteration: usize,
        metric: f64,
        _loss: f64,
        _samples: Option<LogSamples<'_>>,
    ) {
        self.validation_metrics.lock().unwrap().push(metric);
    }

    fn spec(&self) -> Result<ComponentSpec, DistillError> {
        Ok(ComponentSpec::new("tests.RecordingLogger"))
    }
}

fn kwarg_f64(kwargs: &Kwargs, key: &str, default: f64) -> f64 {
    kwargs.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
}

fn kwarg_u64(kwargs: &Kwargs, key: &str, default: u64) -> u64 {
    kwargs.get(key).and_then(|v| v.as_u64()).unwrap_or(default)
}

/// Registry with every toy factory registered, for checkpoint reconstruction.
pub fn toy_registry() -> ComponentRegistry {
    let mut registry = ComponentRegistry::with_defaults();
    registry.register_model(TOY_MODEL_TYPE, |kwargs, _device| {
        Ok(Box::new(ToyModel::new(kwarg_f64(kwargs, "initial_weight", 1.0))) as Box<dyn Model>)
    });
    registry.register_optimizer(TOY_SGD_TYPE, |kwargs, _model| {
        Ok(Box::new(ToySgd::new(kwarg_f64(kwargs, "lr", 0.01))) as Box<dyn Optimizer>)
    });
    registry.register_loss(MSE_LOSS_TYPE, |_| Ok(Box::new(MseLoss) as Box<dyn Loss>));
    registry.register_metric(MAE_METRIC_TYPE, |_| {
        Ok(Box::new(MaeMetric) as Box<dyn Metric>)
    });
    registry.register_dataset(TOY_DATASET_TYPE, |kwargs| {
        Ok(Box::new(ToyDataset::new(
            kwarg_u64(kwargs, "len", 16) as usize,
            kwarg_u64(kwargs, "seed", 0),
        )) as Box<dyn Dataset>)
    });
    registry
}
