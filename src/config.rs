use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use crate::engine::Device;

/// Scalar run settings for a training run.
///
/// Everything that is not a live component (model, loaders, ...) lives here:
/// the run name, the checkpoint root, precision and early-stopping policy.
/// Loaded from TOML or JSON by file extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub name: String,
    #[serde(default = "default_checkpoint_root")]
    pub checkpoint_root: PathBuf,
    #[serde(default)]
    pub device: Device,
    #[serde(default = "default_mixed_precision")]
    pub mixed_precision: bool,
    #[serde(default)]
    pub early_stopping: Option<usize>,
    #[serde(default = "default_log_image_interval")]
    pub log_image_interval: usize,
}

impl RunConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            checkpoint_root: default_checkpoint_root(),
            device: Device::default(),
            mixed_precision: default_mixed_precision(),
            early_stopping: None,
            log_image_interval: default_log_image_interval(),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DistillError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: RunConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .map_err(|err| DistillError::ConfigFormat(err.to_string()))?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(DistillError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DistillError> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }

        if self.name.contains('/') || self.name.contains("..") {
            errors.push("name must not contain path separators".to_string());
        }

        if self.checkpoint_root.as_os_str().is_empty() {
            errors.push("checkpoint_root must not be empty".to_string());
        }

        if self.log_image_interval == 0 {
            errors.push("log_image_interval must be greater than 0".to_string());
        }

        if let Some(0) = self.early_stopping {
            errors.push("early_stopping must be greater than 0 when set".to_string());
        }

        if !errors.is_empty() {
            return Err(DistillError::validation(errors));
        }

        Ok(())
    }

    /// Directory holding the checkpoint slots of this run.
    pub fn checkpoint_folder(&self) -> PathBuf {
        self.checkpoint_root.join(&self.name)
    }
}

fn default_checkpoint_root() -> PathBuf {
    PathBuf::from("./checkpoints")
}

fn default_mixed_precision() -> bool {
    true
}

fn default_log_image_interval() -> usize {
    100
}

#[derive(Debug)]
pub enum DistillError {
    Io(std::io::Error),
    ConfigFormat(String),
    /// Missing or inconsistent configuration, detected before any work runs.
    Validation(Vec<String>),
    /// A requested checkpoint slot or cache entry does not exist.
    NotFound(String),
    /// A checkpoint or cache file is present but unreadable or incomplete.
    CorruptState(String),
    /// Failure inside the compute engine; surfaced to the caller, never retried.
    Computation(String),
    Runtime(String),
}

impl DistillError {
    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Validation(vec![message.into()])
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptState(message.into())
    }

    pub fn computation(message: impl Into<String>) -> Self {
        Self::Computation(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }
}

impl fmt::Display for DistillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistillError::Io(err) => write!(f, "i/o failure: {}", err),
            DistillError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            DistillError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            DistillError::NotFound(msg) => write!(f, "not found: {}", msg),
            DistillError::CorruptState(msg) => write!(f, "corrupt state: {}", msg),
            DistillError::Computation(msg) => write!(f, "compute engine failure: {}", msg),
            DistillError::Runtime(msg) => write!(f, "runtime failure: {}", msg),
        }
    }
}

impl std::error::Error for DistillError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DistillError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DistillError {
    fn from(value: std::io::Error) -> Self {
        DistillError::Io(value)
    }
}

impl From<toml::de::Error> for DistillError {
    fn from(value: toml::de::Error) -> Self {
        DistillError::ConfigFormat(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_name() {
        let config = RunConfig::new("");
        let err = config.validate().unwrap_err();
        match err {
            DistillError::Validation(messages) => {
                assert!(messages.iter().any(|m| m.contains("name")));
            }
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn rejects_zero_early_stopping() {
        let mut config = RunConfig::new("run");
        config.early_stopping = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(
            &path,
            "name = \"membranes\"\nmixed_precision = false\nearly_stopping = 5\n",
        )
        .unwrap();
        let config = RunConfig::from_path(&path).unwrap();
        assert_eq!(config.name, "membranes");
        assert!(!config.mixed_precision);
        assert_eq!(config.early_stopping, Some(5));
        assert_eq!(config.log_image_interval, 100);
    }
}
