//! Hierarchical prediction cache backed by the filesystem.
//!
//! Keys are slash-separated paths such as `enh-v1/forest-a/0003`; each key
//! maps to one gzip-compressed binary file under the cache root. An entry is
//! immutable once written: every later lookup with the same key returns the
//! stored array, never a recomputation.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use ndarray::{ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};

use crate::config::DistillError;

const ENTRY_EXTENSION: &str = ".bin.gz";

/// On-disk layout of one cache entry.
#[derive(Serialize, Deserialize)]
struct StoredArray {
    shape: Vec<usize>,
    data: Vec<f32>,
}

pub struct PredictionCache {
    root: PathBuf,
}

impl PredictionCache {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, DistillError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf, DistillError> {
        validate_key(key)?;
        Ok(self.root.join(format!("{}{}", key, ENTRY_EXTENSION)))
    }

    pub fn contains(&self, key: &str) -> Result<bool, DistillError> {
        Ok(self.entry_path(key)?.exists())
    }

    pub fn read(&self, key: &str) -> Result<ArrayD<f32>, DistillError> {
        let path = self.entry_path(key)?;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(DistillError::not_found(format!("cache entry '{}'", key)));
            }
            Err(err) => return Err(err.into()),
        };

        let mut payload = Vec::new();
        GzDecoder::new(file).read_to_end(&mut payload)?;
        let stored: StoredArray = bincode::deserialize(&payload)
            .map_err(|err| DistillError::corrupt(format!("cache entry '{}': {}", key, err)))?;
        let expected: usize = stored.shape.iter().product();
        if stored.data.len() != expected {
            return Err(DistillError::corrupt(format!(
                "cache entry '{}': shape/data length mismatch",
                key
            )));
        }
        ArrayD::from_shape_vec(IxDyn(&stored.shape), stored.data)
            .map_err(|err| DistillError::corrupt(format!("cache entry '{}': {}", key, err)))
    }

    /// Persist an array under `key`. Writing a key that already exists is an
    /// error: entries are immutable.
    pub fn write(&self, key: &str, array: &ArrayD<f32>) -> Result<(), DistillError> {
        let path = self.entry_path(key)?;
        if path.exists() {
            return Err(DistillError::runtime(format!(
                "cache entry '{}' already exists",
                key
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let stored = StoredArray {
            shape: array.shape().to_vec(),
            data: array.iter().copied().collect(),
        };
        let payload = bincode::serialize(&stored)
            .map_err(|err| DistillError::runtime(format!("cache entry '{}': {}", key, err)))?;

        let tmp = path.with_extension("tmp");
        {
            let mut encoder = GzEncoder::new(File::create(&tmp)?, Compression::default());
            encoder.write_all(&payload)?;
            encoder.finish()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Return the entry under `key`, computing and persisting it first if it
    /// is absent. The compute closure runs at most once per key over the
    /// lifetime of the cache directory.
    pub fn get_or_compute<F>(&self, key: &str, compute: F) -> Result<ArrayD<f32>, DistillError>
    where
        F: FnOnce() -> Result<ArrayD<f32>, DistillError>,
    {
        if self.contains(key)? {
            return self.read(key);
        }
        let array = compute()?;
        self.write(key, &array)?;
        Ok(array)
    }
}

fn validate_key(key: &str) -> Result<(), DistillError> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && key.split('/').all(|segment| {
            !segment.is_empty() && segment != ".." && segment != "." && !segment.contains('\\')
        });
    if !valid {
        return Err(DistillError::config(format!("invalid cache key '{}'", key)));
    }
    Ok(())
}

/// Read every entry under `root` back into a key -> array mapping.
///
/// Keys whose last segment is a zero-padded numeric slice index are
/// re-assembled: all slices of a common prefix are stacked along a new
/// leading axis, ordered by increasing slice index, and returned under the
/// prefix key.
pub fn load_predictions(root: impl AsRef<Path>) -> Result<BTreeMap<String, ArrayD<f32>>, DistillError> {
    let cache = PredictionCache::open(root.as_ref())?;

    let mut keys = Vec::new();
    collect_keys(root.as_ref(), root.as_ref(), &mut keys)?;
    keys.sort();

    let mut whole = BTreeMap::new();
    let mut sliced: BTreeMap<String, Vec<(usize, ArrayD<f32>)>> = BTreeMap::new();
    for key in keys {
        let array = cache.read(&key)?;
        match split_slice_key(&key) {
            Some((prefix, index)) => {
                sliced.entry(prefix.to_string()).or_default().push((index, array));
            }
            None => {
                whole.insert(key, array);
            }
        }
    }

    for (prefix, mut slices) in sliced {
        slices.sort_by_key(|(index, _)| *index);
        let views: Vec<_> = slices.iter().map(|(_, array)| array.view()).collect();
        let stacked = ndarray::stack(Axis(0), &views).map_err(|err| {
            DistillError::corrupt(format!("cache slices under '{}': {}", prefix, err))
        })?;
        whole.insert(prefix, stacked);
    }
    Ok(whole)
}

fn collect_keys(root: &Path, dir: &Path, keys: &mut Vec<String>) -> Result<(), DistillError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_keys(root, &path, keys)?;
        } else if let Some(name) = path.to_str() {
            if let Some(stripped) = name.strip_suffix(ENTRY_EXTENSION) {
                let root_str = root.to_str().unwrap_or_default();
                let key = stripped
                    .strip_prefix(root_str)
                    .unwrap_or(stripped)
                    .trim_start_matches('/');
                keys.push(key.to_string());
            }
        }
    }
    Ok(())
}

/// `enh/forest/0003` -> `("enh/forest", 3)`; plain keys return `None`.
fn split_slice_key(key: &str) -> Option<(&str, usize)> {
    let (prefix, last) = key.rsplit_once('/')?;
    if last.len() == 4 && last.bytes().all(|b| b.is_ascii_digit()) {
        last.parse().ok().map(|index| (prefix, index))
    } else {
        None
    }
}
