//! Checkpoint persistence and reconstruction.
//!
//! A checkpoint is a single self-contained JSON file per slot
//! (`latest.json`, `best.json`, ...). The payload record carries the trainer
//! counters, the reconstruction manifest and every component's numeric state;
//! an outer envelope adds a format version and a sha256 over the serialized
//! record so truncated or edited files fail loudly on load. Writes go through
//! a temp file and an atomic rename, so a crash mid-save never clobbers the
//! previous slot contents.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    config::DistillError,
    data::BatchLoader,
    engine::{Device, Loss, Metric, Model, Optimizer, StateDict},
    logging::TrainLogger,
    manifest::{ComponentRegistry, ManifestEntry, ReconstructionManifest},
    scaler::ScalerState,
    scheduler::LrScheduler,
};

pub const CHECKPOINT_VERSION: u32 = 1;

/// Serde helper for `f64` counters that may legitimately be infinite.
///
/// JSON has no encoding for non-finite floats, so non-finite values are
/// written as `null` and read back as positive infinity (the initial value of
/// a best-metric that has never been beaten).
pub mod finite_f64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        let value = Option::<f64>::deserialize(deserializer)?;
        Ok(value.unwrap_or(f64::INFINITY))
    }
}

/// Progress counters of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub iteration: usize,
    pub epoch: usize,
    pub best_epoch: usize,
    #[serde(with = "finite_f64")]
    pub best_metric: f64,
    pub max_iteration: usize,
    pub max_epoch: usize,
}

impl Default for TrainerState {
    fn default() -> Self {
        Self {
            iteration: 0,
            epoch: 0,
            best_epoch: 0,
            best_metric: f64::INFINITY,
            max_iteration: 0,
            max_epoch: 0,
        }
    }
}

/// Everything a checkpoint slot persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub state: TrainerState,
    pub manifest: ReconstructionManifest,
    pub model_state: StateDict,
    pub optimizer_state: StateDict,
    pub scaler_state: Option<ScalerState>,
    pub scheduler_state: Option<StateDict>,
    pub device: Device,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    sha256: String,
    record: CheckpointRecord,
}

fn slot_path(folder: &Path, slot: &str) -> Result<PathBuf, DistillError> {
    if slot.is_empty() || slot.contains('/') || slot.contains("..") {
        return Err(DistillError::config(format!(
            "invalid checkpoint slot '{}'",
            slot
        )));
    }
    Ok(folder.join(format!("{}.json", slot)))
}

fn record_digest(record: &CheckpointRecord) -> Result<String, DistillError> {
    let bytes = serde_json::to_vec(record)
        .map_err(|err| DistillError::runtime(format!("failed to serialize checkpoint: {}", err)))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Write `record` to `folder/<slot>.json`, replacing any previous contents
/// atomically.
pub fn save_checkpoint(
    folder: &Path,
    slot: &str,
    record: &CheckpointRecord,
) -> Result<PathBuf, DistillError> {
    let path = slot_path(folder, slot)?;
    fs::create_dir_all(folder)?;

    let envelope = Envelope {
        version: CHECKPOINT_VERSION,
        sha256: record_digest(record)?,
        record: record.clone(),
    };
    let payload = serde_json::to_vec_pretty(&envelope)
        .map_err(|err| DistillError::runtime(format!("failed to serialize checkpoint: {}", err)))?;

    let tmp = folder.join(format!(".{}.json.tmp", slot));
    fs::write(&tmp, &payload)?;
    fs::rename(&tmp, &path)?;
    Ok(path)
}

/// Read and verify `folder/<slot>.json`.
///
/// A missing slot is `NotFound`; a slot that exists but fails parsing, the
/// version check or the checksum is `CorruptState`.
pub fn load_checkpoint(folder: &Path, slot: &str) -> Result<CheckpointRecord, DistillError> {
    let path = slot_path(folder, slot)?;
    let payload = match fs::read(&path) {
        Ok(payload) => payload,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(DistillError::not_found(format!(
                "checkpoint slot '{}' in {}",
                slot,
                folder.display()
            )));
        }
        Err(err) => return Err(err.into()),
    };

    let envelope: Envelope = serde_json::from_slice(&payload).map_err(|err| {
        DistillError::corrupt(format!("checkpoint {}: {}", path.display(), err))
    })?;
    if envelope.version != CHECKPOINT_VERSION {
        return Err(DistillError::corrupt(format!(
            "checkpoint {}: version {} is not supported (expected {})",
            path.display(),
            envelope.version,
            CHECKPOINT_VERSION
        )));
    }
    let digest = record_digest(&envelope.record)?;
    if digest != envelope.sha256 {
        return Err(DistillError::corrupt(format!(
            "checkpoint {}: checksum mismatch",
            path.display()
        )));
    }
    Ok(envelope.record)
}

/// Live components rebuilt from a checkpoint record.
pub struct ReconstructedComponents {
    pub model: Box<dyn Model>,
    pub optimizer: Box<dyn Optimizer>,
    pub loss: Box<dyn Loss>,
    pub metric: Box<dyn Metric>,
    pub train_loader: BatchLoader,
    pub val_loader: BatchLoader,
    pub scheduler: Option<Box<dyn LrScheduler>>,
    pub logger: Option<Box<dyn TrainLogger>>,
    pub device: Device,
    pub mixed_precision: bool,
    pub early_stopping: Option<usize>,
    pub log_image_interval: usize,
}

fn required_constructed<'a>(
    manifest: &'a ReconstructionManifest,
    name: &str,
) -> Result<&'a crate::manifest::ComponentSpec, DistillError> {
    manifest.constructed(name).ok_or_else(|| {
        DistillError::corrupt(format!("manifest has no constructed entry '{}'", name))
    })
}

fn required_loader(
    manifest: &ReconstructionManifest,
    name: &str,
    registry: &ComponentRegistry,
) -> Result<BatchLoader, DistillError> {
    let (dataset_spec, loader_config) = match manifest.get(name) {
        Some(ManifestEntry::Loader { dataset, loader }) => (dataset, loader),
        _ => {
            return Err(DistillError::corrupt(format!(
                "manifest has no loader entry '{}'",
                name
            )));
        }
    };
    let dataset = registry.build_dataset(dataset_spec)?;
    BatchLoader::new(dataset, loader_config.clone())
}

/// Rebuild every live component named by the manifest and re-apply the
/// persisted numeric state. The model is built and moved onto the target
/// device before its weights land, and before the optimizer sees it.
pub fn reconstruct(
    record: &CheckpointRecord,
    registry: &ComponentRegistry,
    device_override: Option<Device>,
) -> Result<ReconstructedComponents, DistillError> {
    let manifest = &record.manifest;
    let device = device_override.unwrap_or(record.device);

    let mut model = registry.build_model(required_constructed(manifest, "model")?, device)?;
    model.to_device(device)?;
    model.load_state_dict(&record.model_state)?;

    let mut optimizer =
        registry.build_optimizer(required_constructed(manifest, "optimizer")?, model.as_mut())?;
    optimizer.load_state_dict(&record.optimizer_state)?;

    let loss = registry.build_loss(required_constructed(manifest, "loss")?)?;
    let metric = registry.build_metric(required_constructed(manifest, "metric")?)?;

    let train_loader = required_loader(manifest, "train_loader", registry)?;
    let val_loader = required_loader(manifest, "val_loader", registry)?;

    let scheduler = match manifest.constructed("lr_scheduler") {
        Some(spec) => {
            let mut scheduler = registry.build_scheduler(spec)?;
            if let Some(state) = &record.scheduler_state {
                scheduler.load_state_dict(state)?;
            }
            Some(scheduler)
        }
        None => None,
    };

    let logger = match manifest.constructed("logger") {
        Some(spec) => Some(registry.build_logger(spec)?),
        None => None,
    };

    let mixed_precision = manifest
        .literal("mixed_precision")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let early_stopping = manifest
        .literal("early_stopping")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize);
    let log_image_interval = manifest
        .literal("log_image_interval")
        .and_then(|v| v.as_u64())
        .unwrap_or(100) as usize;

    Ok(ReconstructedComponents {
        model,
        optimizer,
        loss,
        metric,
        train_loader,
        val_loader,
        scheduler,
        logger,
        device,
        mixed_precision,
        early_stopping,
        log_image_interval,
    })
}
