//! The training loop controller.
//!
//! A [`Trainer`] owns the live components (model, optimizer, loaders, loss,
//! metric, optional scheduler and logger) and drives the epoch/iteration
//! state machine: train one pass, validate one pass, step the scheduler,
//! persist the `latest` and `best` checkpoint slots, and stop on an exhausted
//! iteration budget or early stopping. All persistence goes through the
//! reconstruction manifest built once at construction, so a saved run can be
//! resumed by [`Trainer::from_checkpoint`] without the code that originally
//! wired it together.

use std::time::Instant;

use crate::{
    checkpoint::{self, CheckpointRecord, TrainerState},
    config::{DistillError, RunConfig},
    data::{Batch, BatchLoader},
    engine::{Device, Loss, Metric, Model, Optimizer},
    logging::{LogSamples, TrainLogger},
    manifest::{ComponentRegistry, ReconstructionManifest},
    scaler::GradScaler,
    scheduler::LrScheduler,
};

/// Lifecycle phase of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerPhase {
    Uninitialized,
    Initialized,
    TrainEpoch,
    Validate,
    Stopped,
}

/// Why a [`Trainer::fit`] call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    IterationBudgetExhausted,
    EarlyStopping,
}

pub struct Trainer {
    config: RunConfig,
    state: TrainerState,
    phase: TrainerPhase,
    manifest: ReconstructionManifest,
    model: Box<dyn Model>,
    optimizer: Box<dyn Optimizer>,
    loss: Box<dyn Loss>,
    metric: Box<dyn Metric>,
    train_loader: BatchLoader,
    val_loader: BatchLoader,
    scheduler: Option<Box<dyn LrScheduler>>,
    logger: Option<Box<dyn TrainLogger>>,
    scaler: GradScaler,
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl Trainer {
    pub fn builder() -> TrainerBuilder {
        TrainerBuilder::default()
    }

    /// Rebuild a trainer from a checkpoint slot, with no access to the code
    /// that originally constructed it. Every component is re-instantiated
    /// from the persisted manifest through `registry`, then its numeric
    /// state is re-applied.
    pub fn from_checkpoint(
        config: RunConfig,
        slot: &str,
        device: Option<Device>,
        registry: &ComponentRegistry,
    ) -> Result<Self, DistillError> {
        config.validate()?;
        let record = checkpoint::load_checkpoint(&config.checkpoint_folder(), slot)?;
        let components = checkpoint::reconstruct(&record, registry, device)?;

        let mut config = config;
        config.device = components.device;
        config.mixed_precision = components.mixed_precision;
        config.early_stopping = components.early_stopping;
        config.log_image_interval = components.log_image_interval;

        let mut scaler = GradScaler::new(config.mixed_precision);
        if let Some(state) = record.scaler_state.clone() {
            scaler.load_state(state);
        }

        Ok(Self {
            config,
            state: record.state.clone(),
            phase: TrainerPhase::Initialized,
            manifest: record.manifest.clone(),
            model: components.model,
            optimizer: components.optimizer,
            loss: components.loss,
            metric: components.metric,
            train_loader: components.train_loader,
            val_loader: components.val_loader,
            scheduler: components.scheduler,
            logger: components.logger,
            scaler,
        })
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Apply the numeric state of an existing checkpoint slot to this live
    /// trainer. Fails with `NotFound` when the slot is absent.
    pub fn load_checkpoint(&mut self, slot: &str) -> Result<(), DistillError> {
        let record = checkpoint::load_checkpoint(&self.config.checkpoint_folder(), slot)?;
        self.apply_record(&record)
    }

    /// Resume-if-present: apply the slot when it exists, warn and keep the
    /// fresh state when it does not. Returns whether a checkpoint was found.
    pub fn load_checkpoint_if_present(&mut self, slot: &str) -> Result<bool, DistillError> {
        match checkpoint::load_checkpoint(&self.config.checkpoint_folder(), slot) {
            Ok(record) => {
                self.apply_record(&record)?;
                Ok(true)
            }
            Err(DistillError::NotFound(message)) => {
                eprintln!("warning: {}; starting from scratch", message);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    fn apply_record(&mut self, record: &CheckpointRecord) -> Result<(), DistillError> {
        self.model.to_device(self.config.device)?;
        self.model.load_state_dict(&record.model_state)?;
        self.optimizer.load_state_dict(&record.optimizer_state)?;
        if let Some(state) = record.scaler_state.clone() {
            self.scaler.load_state(state);
        }
        if let (Some(scheduler), Some(state)) = (&mut self.scheduler, &record.scheduler_state) {
            scheduler.load_state_dict(state)?;
        }
        self.state = record.state.clone();
        Ok(())
    }

    fn save_checkpoint(&mut self, slot: &str) -> Result<(), DistillError> {
        let record = CheckpointRecord {
            state: self.state.clone(),
            manifest: self.manifest.clone(),
            model_state: self.model.state_dict(),
            optimizer_state: self.optimizer.state_dict(),
            scaler_state: self.scaler.state(),
            scheduler_state: self.scheduler.as_ref().map(|s| s.state_dict()),
            device: self.config.device,
        };
        checkpoint::save_checkpoint(&self.config.checkpoint_folder(), slot, &record)?;
        Ok(())
    }

    /// Train for `iterations` more steps. The epoch budget is the ceiling of
    /// the iteration budget over the batches per training epoch, so the final
    /// epoch may break out of its batch loop early; its validation pass and
    /// checkpointing still run.
    pub fn fit(&mut self, iterations: usize) -> Result<StopReason, DistillError> {
        if self.phase == TrainerPhase::Uninitialized {
            return Err(DistillError::config(
                "trainer must be initialized before fit",
            ));
        }
        if iterations == 0 {
            return Err(DistillError::config(
                "iteration budget must be greater than 0",
            ));
        }

        let batches_per_epoch = self.train_loader.num_batches();
        self.state.max_iteration = self.state.iteration + iterations;
        self.state.max_epoch =
            self.state.epoch + (iterations + batches_per_epoch - 1) / batches_per_epoch;

        let mut reason = StopReason::IterationBudgetExhausted;
        while self.state.epoch < self.state.max_epoch
            && self.state.iteration < self.state.max_iteration
        {
            self.phase = TrainerPhase::TrainEpoch;
            let seconds_per_iteration = self.train_epoch()?;

            self.phase = TrainerPhase::Validate;
            let current_metric = self.validate()?;

            if let Some(scheduler) = &mut self.scheduler {
                if let Some(lr) = scheduler.step(current_metric, self.optimizer.learning_rate()) {
                    self.optimizer.set_learning_rate(lr);
                }
            }

            if current_metric < self.state.best_metric {
                self.state.best_metric = current_metric;
                self.state.best_epoch = self.state.epoch;
                self.save_checkpoint("best")?;
            }
            self.save_checkpoint("latest")?;

            println!(
                "epoch {}: {:.4} s/it, current metric {:.6}, best metric {:.6} (epoch {})",
                self.state.epoch,
                seconds_per_iteration,
                current_metric,
                self.state.best_metric,
                self.state.best_epoch
            );

            if let Some(patience) = self.config.early_stopping {
                if self.state.epoch - self.state.best_epoch > patience {
                    println!(
                        "stopping early: no improvement for more than {} epochs",
                        patience
                    );
                    reason = StopReason::EarlyStopping;
                    break;
                }
            }
            self.state.epoch += 1;
        }

        self.phase = TrainerPhase::Stopped;
        if let Some(logger) = &mut self.logger {
            logger.flush()?;
        }
        Ok(reason)
    }

    /// One pass over the training data; returns seconds per iteration.
    fn train_epoch(&mut self) -> Result<f64, DistillError> {
        self.model.set_train(true);
        let started = Instant::now();
        let mut steps = 0usize;

        for batch in self.train_loader.epoch(self.state.epoch) {
            let batch = batch?;
            self.optimizer.zero_grad(self.model.as_mut());

            let prediction = self.model.forward(&batch.input)?;
            let loss = self.loss.compute(&prediction, &batch.target)?;

            // With dynamic loss scaling a non-finite loss backs off the scale
            // and skips the step instead of poisoning the parameters.
            let found_inf = self.scaler.is_enabled() && !loss.is_finite();
            if !found_inf {
                self.model.backward(self.scaler.scale(loss))?;
                self.optimizer
                    .step(self.model.as_mut(), self.scaler.grad_scale())?;
            }
            self.scaler.update(found_inf);

            self.state.iteration += 1;
            steps += 1;

            if let Some(logger) = &mut self.logger {
                let samples = (self.state.iteration % self.config.log_image_interval == 0)
                    .then_some(LogSamples {
                        input: &batch.input,
                        target: &batch.target,
                        prediction: &prediction,
                    });
                logger.log_train(
                    self.state.iteration,
                    loss,
                    self.optimizer.learning_rate(),
                    samples,
                );
            }

            if self.state.iteration >= self.state.max_iteration {
                break;
            }
        }

        let elapsed = started.elapsed().as_secs_f64();
        Ok(if steps == 0 { 0.0 } else { elapsed / steps as f64 })
    }

    /// One pass over the validation data; returns the mean metric.
    ///
    /// Sample logging intentionally uses the last batch of the pass, not an
    /// aggregate, mirroring how training-step samples are point-in-time.
    fn validate(&mut self) -> Result<f64, DistillError> {
        self.model.set_train(false);

        let mut loss_sum = 0.0;
        let mut metric_sum = 0.0;
        let mut batches = 0usize;
        let mut last: Option<(Batch, ndarray::ArrayD<f32>)> = None;

        for batch in self.val_loader.epoch(self.state.epoch) {
            let batch = batch?;
            let prediction = self.model.forward(&batch.input)?;
            loss_sum += self.loss.compute(&prediction, &batch.target)?;
            metric_sum += self.metric.evaluate(&prediction, &batch.target)?;
            batches += 1;
            last = Some((batch, prediction));
        }
        self.model.set_train(true);

        if batches == 0 {
            return Err(DistillError::config("validation loader yielded no batches"));
        }
        let metric = metric_sum / batches as f64;
        let loss = loss_sum / batches as f64;

        if let Some(logger) = &mut self.logger {
            let samples = last.as_ref().map(|(batch, prediction)| LogSamples {
                input: &batch.input,
                target: &batch.target,
                prediction,
            });
            logger.log_validation(self.state.iteration, metric, loss, samples);
        }
        Ok(metric)
    }
}

/// Assembles a [`Trainer`], collecting every missing required component into
/// one validation error instead of failing on the first.
#[derive(Default)]
pub struct TrainerBuilder {
    config: Option<RunConfig>,
    model: Option<Box<dyn Model>>,
    optimizer: Option<Box<dyn Optimizer>>,
    loss: Option<Box<dyn Loss>>,
    metric: Option<Box<dyn Metric>>,
    train_loader: Option<BatchLoader>,
    val_loader: Option<BatchLoader>,
    scheduler: Option<Box<dyn LrScheduler>>,
    logger: Option<Box<dyn TrainLogger>>,
}

impl TrainerBuilder {
    pub fn config(mut self, config: RunConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn model(mut self, model: Box<dyn Model>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn optimizer(mut self, optimizer: Box<dyn Optimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn loss(mut self, loss: Box<dyn Loss>) -> Self {
        self.loss = Some(loss);
        self
    }

    pub fn metric(mut self, metric: Box<dyn Metric>) -> Self {
        self.metric = Some(metric);
        self
    }

    pub fn train_loader(mut self, loader: BatchLoader) -> Self {
        self.train_loader = Some(loader);
        self
    }

    pub fn val_loader(mut self, loader: BatchLoader) -> Self {
        self.val_loader = Some(loader);
        self
    }

    pub fn scheduler(mut self, scheduler: Box<dyn LrScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn logger(mut self, logger: Box<dyn TrainLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> Result<Trainer, DistillError> {
        let mut errors = Vec::new();
        if self.config.is_none() {
            errors.push("run config is not set".to_string());
        }
        if self.model.is_none() {
            errors.push("model is not set".to_string());
        }
        if self.optimizer.is_none() {
            errors.push("optimizer is not set".to_string());
        }
        if self.loss.is_none() {
            errors.push("loss is not set".to_string());
        }
        if self.metric.is_none() {
            errors.push("metric is not set".to_string());
        }
        if self.train_loader.is_none() {
            errors.push("train loader is not set".to_string());
        }
        if self.val_loader.is_none() {
            errors.push("validation loader is not set".to_string());
        }
        if !errors.is_empty() {
            return Err(DistillError::validation(errors));
        }

        let config = self.config.unwrap();
        config.validate()?;
        let mut model = self.model.unwrap();
        model.to_device(config.device)?;

        let trainer = Trainer {
            manifest: build_manifest(
                &config,
                model.as_ref(),
                self.optimizer.as_deref().unwrap(),
                self.loss.as_deref().unwrap(),
                self.metric.as_deref().unwrap(),
                self.train_loader.as_ref().unwrap(),
                self.val_loader.as_ref().unwrap(),
                self.scheduler.as_deref(),
                self.logger.as_deref(),
            )?,
            scaler: GradScaler::new(config.mixed_precision),
            state: TrainerState::default(),
            phase: TrainerPhase::Initialized,
            model,
            optimizer: self.optimizer.unwrap(),
            loss: self.loss.unwrap(),
            metric: self.metric.unwrap(),
            train_loader: self.train_loader.unwrap(),
            val_loader: self.val_loader.unwrap(),
            scheduler: self.scheduler,
            logger: self.logger,
            config,
        };
        Ok(trainer)
    }
}

/// Snapshot every component's construction metadata. A component that cannot
/// describe itself fails the build here, not at some later save.
#[allow(clippy::too_many_arguments)]
fn build_manifest(
    config: &RunConfig,
    model: &dyn Model,
    optimizer: &dyn Optimizer,
    loss: &dyn Loss,
    metric: &dyn Metric,
    train_loader: &BatchLoader,
    val_loader: &BatchLoader,
    scheduler: Option<&dyn LrScheduler>,
    logger: Option<&dyn TrainLogger>,
) -> Result<ReconstructionManifest, DistillError> {
    let mut manifest = ReconstructionManifest::new();
    manifest.insert_constructed("model", model.spec()?);
    manifest.insert_constructed("optimizer", optimizer.spec()?);
    manifest.insert_constructed("loss", loss.spec()?);
    manifest.insert_constructed("metric", metric.spec()?);
    manifest.insert_loader(
        "train_loader",
        train_loader.dataset_spec()?,
        train_loader.config().clone(),
    );
    manifest.insert_loader(
        "val_loader",
        val_loader.dataset_spec()?,
        val_loader.config().clone(),
    );
    if let Some(scheduler) = scheduler {
        manifest.insert_constructed("lr_scheduler", scheduler.spec()?);
    }
    if let Some(logger) = logger {
        manifest.insert_constructed("logger", logger.spec()?);
    }
    manifest.insert_literal("device", config.device.to_string());
    manifest.insert_literal("mixed_precision", config.mixed_precision);
    if let Some(patience) = config.early_stopping {
        manifest.insert_literal("early_stopping", patience as u64);
    }
    manifest.insert_literal("log_image_interval", config.log_image_interval as u64);
    Ok(manifest)
}
