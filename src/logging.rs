//! Training progress logging.
//!
//! Loggers are optional collaborators; the trainer calls them at every
//! training step and after every validation pass. Image-like sample payloads
//! are forwarded at a configurable interval so a backend can render them
//! without the trainer knowing how.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use ndarray::ArrayD;
use serde_json::json;

use crate::{
    config::DistillError,
    manifest::{ComponentSpec, Kwargs},
};

pub const STDOUT_LOGGER_TYPE: &str = "rf_distill.StdoutLogger";

/// Borrowed views of the batch a log call belongs to.
pub struct LogSamples<'a> {
    pub input: &'a ArrayD<f32>,
    pub target: &'a ArrayD<f32>,
    pub prediction: &'a ArrayD<f32>,
}

pub trait TrainLogger {
    fn log_train(
        &mut self,
        iteration: usize,
        loss: f64,
        learning_rate: f64,
        samples: Option<LogSamples<'_>>,
    );

    fn log_validation(
        &mut self,
        iteration: usize,
        metric: f64,
        loss: f64,
        samples: Option<LogSamples<'_>>,
    );

    fn flush(&mut self) -> Result<(), DistillError> {
        Ok(())
    }

    fn spec(&self) -> Result<ComponentSpec, DistillError>;
}

/// Prints scalar progress to stdout every `interval` training steps.
#[derive(Debug, Clone)]
pub struct StdoutLogger {
    interval: usize,
}

impl StdoutLogger {
    pub fn new(interval: usize) -> Self {
        Self {
            interval: interval.max(1),
        }
    }

    pub fn from_kwargs(kwargs: &Kwargs) -> Result<Self, DistillError> {
        let interval = kwargs
            .get("interval")
            .and_then(|v| v.as_u64())
            .unwrap_or(100) as usize;
        Ok(Self::new(interval))
    }
}

impl TrainLogger for StdoutLogger {
    fn log_train(
        &mut self,
        iteration: usize,
        loss: f64,
        learning_rate: f64,
        _samples: Option<LogSamples<'_>>,
    ) {
        if iteration % self.interval == 0 {
            println!(
                "iteration {:>8}  loss {:.6}  lr {:.2e}",
                iteration, loss, learning_rate
            );
        }
    }

    fn log_validation(
        &mut self,
        iteration: usize,
        metric: f64,
        loss: f64,
        _samples: Option<LogSamples<'_>>,
    ) {
        println!(
            "iteration {:>8}  validation metric {:.6}  loss {:.6}",
            iteration, metric, loss
        );
    }

    fn spec(&self) -> Result<ComponentSpec, DistillError> {
        Ok(ComponentSpec::new(STDOUT_LOGGER_TYPE).with_kwarg("interval", self.interval as u64))
    }
}

pub const JSONL_LOGGER_TYPE: &str = "rf_distill.JsonlLogger";

/// Appends one JSON object per event to a log file.
///
/// Sample payloads are summarized to their shapes rather than dumped; the
/// point of this backend is a grep-able scalar history, not tensor storage.
pub struct JsonlLogger {
    path: String,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl JsonlLogger {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, DistillError> {
        Self::with_flush_every(path, 32)
    }

    pub fn with_flush_every(
        path: impl AsRef<Path>,
        flush_every: usize,
    ) -> Result<Self, DistillError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::options().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.display().to_string(),
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_event(&mut self, event: serde_json::Value) {
        // Logging must never abort training; drop the event on write failure.
        if writeln!(self.writer, "{}", event).is_ok() {
            self.pending += 1;
            if self.pending >= self.flush_every {
                let _ = self.writer.flush();
                self.pending = 0;
            }
        }
    }

    fn shapes(samples: &LogSamples<'_>) -> serde_json::Value {
        json!({
            "input": samples.input.shape(),
            "target": samples.target.shape(),
            "prediction": samples.prediction.shape(),
        })
    }
}

impl TrainLogger for JsonlLogger {
    fn log_train(
        &mut self,
        iteration: usize,
        loss: f64,
        learning_rate: f64,
        samples: Option<LogSamples<'_>>,
    ) {
        let mut event = json!({
            "event": "train",
            "iteration": iteration,
            "loss": loss,
            "lr": learning_rate,
        });
        if let Some(samples) = &samples {
            event["samples"] = Self::shapes(samples);
        }
        self.write_event(event);
    }

    fn log_validation(
        &mut self,
        iteration: usize,
        metric: f64,
        loss: f64,
        samples: Option<LogSamples<'_>>,
    ) {
        let mut event = json!({
            "event": "validation",
            "iteration": iteration,
            "metric": metric,
            "loss": loss,
        });
        if let Some(samples) = &samples {
            event["samples"] = Self::shapes(samples);
        }
        self.write_event(event);
    }

    fn flush(&mut self) -> Result<(), DistillError> {
        self.pending = 0;
        self.writer.flush().map_err(DistillError::from)
    }

    fn spec(&self) -> Result<ComponentSpec, DistillError> {
        Ok(ComponentSpec::new(JSONL_LOGGER_TYPE)
            .with_kwarg("path", self.path.clone())
            .with_kwarg("flush_every", self.flush_every as u64))
    }
}

impl Drop for JsonlLogger {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn jsonl_writes_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        {
            let mut logger = JsonlLogger::with_flush_every(&path, 1).unwrap();
            logger.log_train(1, 0.5, 1e-3, None);
            let x = ArrayD::<f32>::zeros(IxDyn(&[1, 1, 8, 8]));
            logger.log_validation(
                25,
                0.25,
                0.4,
                Some(LogSamples {
                    input: &x,
                    target: &x,
                    prediction: &x,
                }),
            );
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "train");
        assert_eq!(first["iteration"], 1);

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event"], "validation");
        assert_eq!(second["samples"]["input"], json!([1, 1, 8, 8]));
    }

    #[test]
    fn jsonl_appends_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        {
            let mut logger = JsonlLogger::create(&path).unwrap();
            logger.log_train(1, 0.5, 1e-3, None);
        }
        {
            let mut logger = JsonlLogger::create(&path).unwrap();
            logger.log_train(2, 0.4, 1e-3, None);
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn stdout_logger_spec_roundtrips_interval() {
        let logger = StdoutLogger::new(50);
        let spec = logger.spec().unwrap();
        assert_eq!(spec.type_path, STDOUT_LOGGER_TYPE);
        let rebuilt = StdoutLogger::from_kwargs(&spec.kwargs).unwrap();
        assert_eq!(rebuilt.interval, 50);
    }
}
