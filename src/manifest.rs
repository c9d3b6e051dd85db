//! Construction metadata and the component registry.
//!
//! A checkpoint must be loadable without the code path that originally wired
//! the trainer together. To that end every component records a
//! [`ComponentSpec`]: a stable type path plus the constructor kwargs that
//! rebuild an equivalent instance. Resolution goes through an explicit
//! [`ComponentRegistry`] of factories keyed by type path, so a checkpoint can
//! only name types the host application has deliberately registered.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::DistillError,
    data::LoaderConfig,
    engine::{Dataset, Device, Loss, Metric, Model, Optimizer},
    logging::TrainLogger,
    scheduler::LrScheduler,
};

pub type Kwargs = serde_json::Map<String, Value>;

/// Reconstruction metadata for one component: type path + constructor kwargs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub type_path: String,
    #[serde(default)]
    pub kwargs: Kwargs,
}

impl ComponentSpec {
    pub fn new(type_path: impl Into<String>) -> Self {
        Self {
            type_path: type_path.into(),
            kwargs: Kwargs::new(),
        }
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }
}

/// One entry of the reconstruction manifest.
///
/// Literals are stored values returned as-is on reconstruction; constructed
/// entries resolve through the registry; loader entries pair the dataset's
/// own spec with the loader's scalar configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ManifestEntry {
    Literal { value: Value },
    Constructed { spec: ComponentSpec },
    Loader { dataset: ComponentSpec, loader: LoaderConfig },
}

/// Ordered component-name -> entry mapping persisted in every checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionManifest {
    entries: BTreeMap<String, ManifestEntry>,
}

impl ReconstructionManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_literal(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.entries
            .insert(name.into(), ManifestEntry::Literal { value: value.into() });
    }

    pub fn insert_constructed(&mut self, name: impl Into<String>, spec: ComponentSpec) {
        self.entries
            .insert(name.into(), ManifestEntry::Constructed { spec });
    }

    pub fn insert_loader(
        &mut self,
        name: impl Into<String>,
        dataset: ComponentSpec,
        loader: LoaderConfig,
    ) {
        self.entries
            .insert(name.into(), ManifestEntry::Loader { dataset, loader });
    }

    pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ManifestEntry)> {
        self.entries.iter()
    }

    pub fn literal(&self, name: &str) -> Option<&Value> {
        match self.entries.get(name) {
            Some(ManifestEntry::Literal { value }) => Some(value),
            _ => None,
        }
    }

    pub fn constructed(&self, name: &str) -> Option<&ComponentSpec> {
        match self.entries.get(name) {
            Some(ManifestEntry::Constructed { spec }) => Some(spec),
            _ => None,
        }
    }

    pub fn loader(&self, name: &str) -> Option<(&ComponentSpec, &LoaderConfig)> {
        match self.entries.get(name) {
            Some(ManifestEntry::Loader { dataset, loader }) => Some((dataset, loader)),
            _ => None,
        }
    }
}

pub type ModelFactory =
    Box<dyn Fn(&Kwargs, Device) -> Result<Box<dyn Model>, DistillError> + Send + Sync>;
pub type OptimizerFactory =
    Box<dyn Fn(&Kwargs, &mut dyn Model) -> Result<Box<dyn Optimizer>, DistillError> + Send + Sync>;
pub type LossFactory = Box<dyn Fn(&Kwargs) -> Result<Box<dyn Loss>, DistillError> + Send + Sync>;
pub type MetricFactory =
    Box<dyn Fn(&Kwargs) -> Result<Box<dyn Metric>, DistillError> + Send + Sync>;
pub type SchedulerFactory =
    Box<dyn Fn(&Kwargs) -> Result<Box<dyn LrScheduler>, DistillError> + Send + Sync>;
pub type DatasetFactory =
    Box<dyn Fn(&Kwargs) -> Result<Box<dyn Dataset>, DistillError> + Send + Sync>;
pub type LoggerFactory =
    Box<dyn Fn(&Kwargs) -> Result<Box<dyn TrainLogger>, DistillError> + Send + Sync>;

/// Explicit type-path -> factory mapping used to resolve manifest entries.
///
/// One map per component kind keeps resolution type-safe: a checkpoint that
/// names a model type where an optimizer is expected fails loudly instead of
/// instantiating the wrong thing.
#[derive(Default)]
pub struct ComponentRegistry {
    models: HashMap<String, ModelFactory>,
    optimizers: HashMap<String, OptimizerFactory>,
    losses: HashMap<String, LossFactory>,
    metrics: HashMap<String, MetricFactory>,
    schedulers: HashMap<String, SchedulerFactory>,
    datasets: HashMap<String, DatasetFactory>,
    loggers: HashMap<String, LoggerFactory>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the factories this crate ships itself.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_scheduler(crate::scheduler::REDUCE_ON_PLATEAU_TYPE, |kwargs| {
            crate::scheduler::ReduceOnPlateau::from_kwargs(kwargs)
                .map(|s| Box::new(s) as Box<dyn LrScheduler>)
        });
        registry.register_logger(crate::logging::STDOUT_LOGGER_TYPE, |kwargs| {
            crate::logging::StdoutLogger::from_kwargs(kwargs)
                .map(|l| Box::new(l) as Box<dyn TrainLogger>)
        });
        registry
    }

    pub fn register_model<F>(&mut self, type_path: impl Into<String>, factory: F)
    where
        F: Fn(&Kwargs, Device) -> Result<Box<dyn Model>, DistillError> + Send + Sync + 'static,
    {
        self.models.insert(type_path.into(), Box::new(factory));
    }

    pub fn register_optimizer<F>(&mut self, type_path: impl Into<String>, factory: F)
    where
        F: Fn(&Kwargs, &mut dyn Model) -> Result<Box<dyn Optimizer>, DistillError>
            + Send
            + Sync
            + 'static,
    {
        self.optimizers.insert(type_path.into(), Box::new(factory));
    }

    pub fn register_loss<F>(&mut self, type_path: impl Into<String>, factory: F)
    where
        F: Fn(&Kwargs) -> Result<Box<dyn Loss>, DistillError> + Send + Sync + 'static,
    {
        self.losses.insert(type_path.into(), Box::new(factory));
    }

    pub fn register_metric<F>(&mut self, type_path: impl Into<String>, factory: F)
    where
        F: Fn(&Kwargs) -> Result<Box<dyn Metric>, DistillError> + Send + Sync + 'static,
    {
        self.metrics.insert(type_path.into(), Box::new(factory));
    }

    pub fn register_scheduler<F>(&mut self, type_path: impl Into<String>, factory: F)
    where
        F: Fn(&Kwargs) -> Result<Box<dyn LrScheduler>, DistillError> + Send + Sync + 'static,
    {
        self.schedulers.insert(type_path.into(), Box::new(factory));
    }

    pub fn register_dataset<F>(&mut self, type_path: impl Into<String>, factory: F)
    where
        F: Fn(&Kwargs) -> Result<Box<dyn Dataset>, DistillError> + Send + Sync + 'static,
    {
        self.datasets.insert(type_path.into(), Box::new(factory));
    }

    pub fn register_logger<F>(&mut self, type_path: impl Into<String>, factory: F)
    where
        F: Fn(&Kwargs) -> Result<Box<dyn TrainLogger>, DistillError> + Send + Sync + 'static,
    {
        self.loggers.insert(type_path.into(), Box::new(factory));
    }

    pub fn build_model(
        &self,
        spec: &ComponentSpec,
        device: Device,
    ) -> Result<Box<dyn Model>, DistillError> {
        let factory = self
            .models
            .get(&spec.type_path)
            .ok_or_else(|| unregistered("model", &spec.type_path))?;
        factory(&spec.kwargs, device)
    }

    /// The optimizer factory receives the live model: parameter references
    /// are injected at reconstruction time, never stored in the manifest.
    pub fn build_optimizer(
        &self,
        spec: &ComponentSpec,
        model: &mut dyn Model,
    ) -> Result<Box<dyn Optimizer>, DistillError> {
        let factory = self
            .optimizers
            .get(&spec.type_path)
            .ok_or_else(|| unregistered("optimizer", &spec.type_path))?;
        factory(&spec.kwargs, model)
    }

    pub fn build_loss(&self, spec: &ComponentSpec) -> Result<Box<dyn Loss>, DistillError> {
        let factory = self
            .losses
            .get(&spec.type_path)
            .ok_or_else(|| unregistered("loss", &spec.type_path))?;
        factory(&spec.kwargs)
    }

    pub fn build_metric(&self, spec: &ComponentSpec) -> Result<Box<dyn Metric>, DistillError> {
        let factory = self
            .metrics
            .get(&spec.type_path)
            .ok_or_else(|| unregistered("metric", &spec.type_path))?;
        factory(&spec.kwargs)
    }

    pub fn build_scheduler(
        &self,
        spec: &ComponentSpec,
    ) -> Result<Box<dyn LrScheduler>, DistillError> {
        let factory = self
            .schedulers
            .get(&spec.type_path)
            .ok_or_else(|| unregistered("scheduler", &spec.type_path))?;
        factory(&spec.kwargs)
    }

    pub fn build_dataset(&self, spec: &ComponentSpec) -> Result<Box<dyn Dataset>, DistillError> {
        let factory = self
            .datasets
            .get(&spec.type_path)
            .ok_or_else(|| unregistered("dataset", &spec.type_path))?;
        factory(&spec.kwargs)
    }

    pub fn build_logger(
        &self,
        spec: &ComponentSpec,
    ) -> Result<Box<dyn TrainLogger>, DistillError> {
        let factory = self
            .loggers
            .get(&spec.type_path)
            .ok_or_else(|| unregistered("logger", &spec.type_path))?;
        factory(&spec.kwargs)
    }
}

fn unregistered(kind: &str, type_path: &str) -> DistillError {
    DistillError::config(format!(
        "no {} factory registered for type path '{}'",
        kind, type_path
    ))
}
