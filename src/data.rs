//! Batch loading over a [`Dataset`].
//!
//! The loader is a plain wrapper owning its scalar configuration, including
//! an explicit `shuffle` flag; nothing is injected onto the dataset after
//! construction. Shuffling draws a fresh permutation per epoch from a seeded
//! generator, so a resumed run that replays an epoch sees the same order.

use ndarray::{ArrayD, Axis};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{config::DistillError, engine::Dataset, manifest::ComponentSpec};

/// Scalar configuration of a [`BatchLoader`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    #[serde(default)]
    pub seed: u64,
}

impl LoaderConfig {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            shuffle: false,
            seed: 0,
        }
    }

    pub fn shuffled(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }
}

/// One stacked batch; leading axis is the batch axis.
#[derive(Debug, Clone)]
pub struct Batch {
    pub input: ArrayD<f32>,
    pub target: ArrayD<f32>,
}

pub struct BatchLoader {
    dataset: Box<dyn Dataset>,
    config: LoaderConfig,
}

impl BatchLoader {
    pub fn new(dataset: Box<dyn Dataset>, config: LoaderConfig) -> Result<Self, DistillError> {
        let mut errors = Vec::new();
        if config.batch_size == 0 {
            errors.push("loader batch_size must be greater than 0".to_string());
        }
        if dataset.is_empty() {
            errors.push("loader dataset must not be empty".to_string());
        }
        if !errors.is_empty() {
            return Err(DistillError::validation(errors));
        }
        Ok(Self { dataset, config })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn dataset_spec(&self) -> Result<ComponentSpec, DistillError> {
        self.dataset.spec()
    }

    /// Batches per full pass; the last batch may be smaller.
    pub fn num_batches(&self) -> usize {
        let len = self.dataset.len();
        (len + self.config.batch_size - 1) / self.config.batch_size
    }

    /// Iterate one full pass. The epoch index feeds the shuffle seed so each
    /// epoch gets its own, reproducible permutation.
    pub fn epoch(&self, epoch: usize) -> EpochIter<'_> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(self.config.seed ^ (epoch as u64).wrapping_mul(0x9e37_79b9));
            order.shuffle(&mut rng);
        }
        EpochIter {
            loader: self,
            order,
            cursor: 0,
        }
    }

    fn stack_batch(&self, indices: &[usize]) -> Result<Batch, DistillError> {
        let mut inputs = Vec::with_capacity(indices.len());
        let mut targets = Vec::with_capacity(indices.len());
        for &index in indices {
            let (input, target) = self.dataset.sample(index)?;
            inputs.push(input);
            targets.push(target);
        }
        let input_views: Vec<_> = inputs.iter().map(|a| a.view()).collect();
        let target_views: Vec<_> = targets.iter().map(|a| a.view()).collect();
        let input = ndarray::stack(Axis(0), &input_views)
            .map_err(|err| DistillError::runtime(format!("failed to stack batch: {}", err)))?;
        let target = ndarray::stack(Axis(0), &target_views)
            .map_err(|err| DistillError::runtime(format!("failed to stack batch: {}", err)))?;
        Ok(Batch { input, target })
    }
}

pub struct EpochIter<'a> {
    loader: &'a BatchLoader,
    order: Vec<usize>,
    cursor: usize,
}

impl Iterator for EpochIter<'_> {
    type Item = Result<Batch, DistillError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.loader.config.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;
        Some(self.loader.stack_batch(indices))
    }
}
