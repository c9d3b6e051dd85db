//! Training and evaluation harness for distilling pretrained
//! pixel-classification random forests into neural enhancer models.
//!
//! Two halves:
//! - a resumable training loop with checkpointing, mixed-precision loss
//!   scaling and fully-reconstructive serialization of its component set
//!   from recorded construction metadata;
//! - an evaluation pipeline scoring every forest/enhancer combination over
//!   2D or 3D data, with filesystem-backed prediction caching and optional
//!   per-slice decomposition of volumes.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod engine;
pub mod eval;
pub mod logging;
pub mod manifest;
pub mod scaler;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{
    load_checkpoint, reconstruct, save_checkpoint, CheckpointRecord, ReconstructedComponents,
    TrainerState, CHECKPOINT_VERSION,
};
pub use config::{DistillError, RunConfig};
pub use data::{Batch, BatchLoader, LoaderConfig};
pub use engine::{Dataset, Device, Loss, Metric, Model, Optimizer, StateDict};
pub use eval::{
    cache::{load_predictions, PredictionCache},
    evaluate_enhancers, predict_forests, Enhancer, EnhancerAdapter, EvalOptions, ForestPredictor,
    ScoreRow, ScoreTable, FOREST_BASELINE_ROW,
};
pub use logging::{JsonlLogger, LogSamples, StdoutLogger, TrainLogger};
pub use manifest::{ComponentRegistry, ComponentSpec, Kwargs, ManifestEntry, ReconstructionManifest};
pub use scaler::{GradScaler, LossScaleConfig, ScalerState};
pub use scheduler::{LrScheduler, ReduceOnPlateau};
pub use trainer::{StopReason, Trainer, TrainerBuilder, TrainerPhase};
