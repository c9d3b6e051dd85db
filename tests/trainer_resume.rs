//! End-to-end trainer lifecycle: checkpoint round-trips, resume, early
//! stopping and the iteration budget.

mod common;

use common::{
    toy_registry, MaeMetric, MseLoss, RecordingLogger, ToyDataset, ToyModel, ToySgd,
    TOY_MODEL_TYPE,
};
use rf_distill::{
    load_checkpoint, BatchLoader, DistillError, LoaderConfig, RunConfig, StopReason, Trainer,
    TrainerPhase,
};
use std::path::Path;

fn run_config(dir: &Path, name: &str) -> RunConfig {
    let mut config = RunConfig::new(name);
    config.checkpoint_root = dir.to_path_buf();
    config
}

fn toy_trainer(config: RunConfig, dataset_len: usize, batch_size: usize, lr: f64) -> Trainer {
    let train_loader = BatchLoader::new(
        Box::new(ToyDataset::new(dataset_len, 0)),
        LoaderConfig::new(batch_size).shuffled(7),
    )
    .unwrap();
    let val_loader = BatchLoader::new(
        Box::new(ToyDataset::new(dataset_len / 4, 1)),
        LoaderConfig::new(batch_size),
    )
    .unwrap();

    Trainer::builder()
        .config(config)
        .model(Box::new(ToyModel::new(4.0)))
        .optimizer(Box::new(ToySgd::new(lr)))
        .loss(Box::new(MseLoss))
        .metric(Box::new(MaeMetric))
        .train_loader(train_loader)
        .val_loader(val_loader)
        .build()
        .unwrap()
}

#[test]
fn builder_collects_all_missing_components() {
    let err = Trainer::builder().build().unwrap_err();
    match err {
        DistillError::Validation(messages) => {
            for needle in ["model", "optimizer", "loss", "metric", "train", "validation"] {
                assert!(
                    messages.iter().any(|m| m.contains(needle)),
                    "no message about {}: {:?}",
                    needle,
                    messages
                );
            }
        }
        other => panic!("expected validation error, got {other}"),
    }
}

#[test]
fn iteration_budget_runs_ceil_epochs_and_stops_exactly() {
    let dir = tempfile::tempdir().unwrap();
    // 10 samples, batch 4: 3 batches per epoch, so 7 iterations span 3 epochs
    // with the last epoch cut short after a single batch.
    let mut trainer = toy_trainer(run_config(dir.path(), "budget"), 10, 4, 0.01);
    let reason = trainer.fit(7).unwrap();

    assert_eq!(reason, StopReason::IterationBudgetExhausted);
    assert_eq!(trainer.state().iteration, 7);
    assert_eq!(trainer.state().epoch, 3);
    assert_eq!(trainer.state().max_iteration, 7);
    assert_eq!(trainer.phase(), TrainerPhase::Stopped);
}

#[test]
fn resume_continues_without_rerunning_finished_epochs() {
    let dir = tempfile::tempdir().unwrap();
    let config = run_config(dir.path(), "resume");

    // 100 samples, batch 4: 25 batches per epoch, 50 iterations = 2 epochs.
    let mut trainer = toy_trainer(config.clone(), 100, 4, 0.001);
    trainer.fit(50).unwrap();
    assert_eq!(trainer.state().iteration, 50);
    assert_eq!(trainer.state().epoch, 2);
    drop(trainer);

    let registry = toy_registry();
    let mut resumed = Trainer::from_checkpoint(config.clone(), "latest", None, &registry).unwrap();
    assert_eq!(resumed.state().iteration, 50);
    assert_eq!(resumed.state().epoch, 2);

    resumed.fit(10).unwrap();
    assert_eq!(resumed.state().iteration, 60);
    assert_eq!(resumed.state().epoch, 3);

    // The resumed latest slot reflects the continued run.
    let record = load_checkpoint(&config.checkpoint_folder(), "latest").unwrap();
    assert_eq!(record.state.iteration, 60);
}

#[test]
fn checkpoint_manifest_reconstructs_component_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let config = run_config(dir.path(), "manifest");
    let mut trainer = toy_trainer(config.clone(), 20, 5, 0.01);
    trainer.fit(4).unwrap();

    let record = load_checkpoint(&config.checkpoint_folder(), "latest").unwrap();
    let model_spec = record.manifest.constructed("model").unwrap();
    assert_eq!(model_spec.type_path, TOY_MODEL_TYPE);
    assert_eq!(
        model_spec.kwarg("initial_weight").and_then(|v| v.as_f64()),
        Some(4.0)
    );

    let (dataset, loader) = record.manifest.loader("train_loader").unwrap();
    assert_eq!(dataset.kwarg("len").and_then(|v| v.as_u64()), Some(20));
    assert!(loader.shuffle);
    assert_eq!(loader.batch_size, 5);
    assert_eq!(
        record.manifest.literal("mixed_precision"),
        Some(&serde_json::json!(true))
    );
}

#[test]
fn best_slot_tracks_minimum_validation_metric() {
    let dir = tempfile::tempdir().unwrap();
    let config = run_config(dir.path(), "best");

    let logger = RecordingLogger::new();
    let (_, metrics) = logger.handles();

    let train_loader = BatchLoader::new(
        Box::new(ToyDataset::new(40, 0)),
        LoaderConfig::new(4).shuffled(3),
    )
    .unwrap();
    let val_loader =
        BatchLoader::new(Box::new(ToyDataset::new(12, 1)), LoaderConfig::new(4)).unwrap();
    let mut trainer = Trainer::builder()
        .config(config.clone())
        .model(Box::new(ToyModel::new(4.0)))
        .optimizer(Box::new(ToySgd::new(0.05)))
        .loss(Box::new(MseLoss))
        .metric(Box::new(MaeMetric))
        .train_loader(train_loader)
        .val_loader(val_loader)
        .logger(Box::new(logger))
        .build()
        .unwrap();

    trainer.fit(50).unwrap();

    let observed = metrics.lock().unwrap().clone();
    assert!(!observed.is_empty());
    let minimum = observed.iter().cloned().fold(f64::INFINITY, f64::min);

    let best = load_checkpoint(&config.checkpoint_folder(), "best").unwrap();
    assert!((best.state.best_metric - minimum).abs() < 1e-12);
    assert!(best.state.best_epoch <= trainer.state().epoch);
}

#[test]
fn early_stopping_fires_at_exact_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = run_config(dir.path(), "early");
    config.early_stopping = Some(2);

    // Zero learning rate: the metric never improves after the first epoch
    // turns the infinite initial best into a finite one.
    let mut trainer = toy_trainer(config, 20, 5, 0.0);
    let reason = trainer.fit(1000).unwrap();

    assert_eq!(reason, StopReason::EarlyStopping);
    assert_eq!(trainer.state().best_epoch, 0);
    assert_eq!(trainer.state().epoch, 3);
    assert!(trainer.state().iteration < 1000);
}

#[test]
fn explicit_load_of_missing_slot_fails_but_implicit_resume_warns() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = toy_trainer(run_config(dir.path(), "missing"), 10, 5, 0.01);

    let err = trainer.load_checkpoint("best").unwrap_err();
    assert!(matches!(err, DistillError::NotFound(_)));

    let found = trainer.load_checkpoint_if_present("latest").unwrap();
    assert!(!found);
    assert_eq!(trainer.state().iteration, 0);
}

#[test]
fn mixed_precision_matches_full_precision_on_toy_model() {
    let dir = tempfile::tempdir().unwrap();

    let mut full = run_config(dir.path(), "full");
    full.mixed_precision = false;
    let mut mixed = run_config(dir.path(), "mixed");
    mixed.mixed_precision = true;

    let mut full_trainer = toy_trainer(full.clone(), 20, 4, 0.01);
    let mut mixed_trainer = toy_trainer(mixed.clone(), 20, 4, 0.01);
    full_trainer.fit(20).unwrap();
    mixed_trainer.fit(20).unwrap();

    // Loss scaling is undone by the inverse gradient scale at every step, so
    // both runs land on identical weights.
    let full_record = load_checkpoint(&full.checkpoint_folder(), "latest").unwrap();
    let mixed_record = load_checkpoint(&mixed.checkpoint_folder(), "latest").unwrap();
    let weight = |record: &rf_distill::CheckpointRecord| {
        record.model_state.get("weight").unwrap().as_f64().unwrap()
    };
    assert!((weight(&full_record) - weight(&mixed_record)).abs() < 1e-9);
    assert!(mixed_record.scaler_state.is_some());
    assert!(full_record.scaler_state.is_none());
}
