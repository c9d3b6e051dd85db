//! Forest-to-enhancer evaluation.
//!
//! Given raw data, ground truth, a set of named forest predictors and a set
//! of named enhancers, score every forest/enhancer combination against the
//! ground truth and report the results as a table, with the raw forest
//! prediction scored directly as a baseline row. 3D volumes can be processed
//! whole or decomposed into independently scored 2D slices whose scores are
//! averaged.

pub mod cache;

use std::{collections::BTreeMap, fmt, path::PathBuf};

use ndarray::{ArrayD, Axis};
use rayon::prelude::*;

use crate::config::DistillError;
use cache::PredictionCache;

/// Baseline row: the forest prediction scored directly against ground truth.
pub const FOREST_BASELINE_ROW: &str = "rf-score";

/// A pretrained pixel-classification forest, consumed as an opaque
/// prediction callable.
pub trait ForestPredictor {
    fn predict(&mut self, raw: &ArrayD<f32>) -> Result<ArrayD<f32>, DistillError>;
}

/// A trained enhancer network, consumed as an opaque inference callable.
pub trait Enhancer {
    fn infer(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, DistillError>;
}

impl<F> ForestPredictor for F
where
    F: FnMut(&ArrayD<f32>) -> Result<ArrayD<f32>, DistillError>,
{
    fn predict(&mut self, raw: &ArrayD<f32>) -> Result<ArrayD<f32>, DistillError> {
        self(raw)
    }
}

/// Overrides how an enhancer is invoked, for pipelines that expect something
/// other than the forest prediction passed through directly.
pub type EnhancerAdapter =
    Box<dyn Fn(&mut dyn Enhancer, &ArrayD<f32>) -> Result<ArrayD<f32>, DistillError>>;

/// Scoring callable; lower is better.
pub type MetricFn = dyn Fn(&ArrayD<f32>, &ArrayD<f32>) -> f64;

#[derive(Default)]
pub struct EvalOptions {
    /// Split 3D volumes along the leading axis and average slice scores.
    pub per_slice: bool,
    /// Cache directory; `None` disables memoization entirely.
    pub cache_path: Option<PathBuf>,
    pub adapter: Option<EnhancerAdapter>,
}

/// One row of scores: an enhancer (or the baseline), one score per forest.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRow {
    pub name: String,
    pub scores: Vec<f64>,
}

/// Rows are enhancers plus the baseline; columns are forest names.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreTable {
    pub columns: Vec<String>,
    pub rows: Vec<ScoreRow>,
}

impl ScoreTable {
    pub fn get(&self, row: &str, column: &str) -> Option<f64> {
        let col = self.columns.iter().position(|c| c == column)?;
        self.rows
            .iter()
            .find(|r| r.name == row)
            .and_then(|r| r.scores.get(col).copied())
    }

    /// Element-wise arithmetic mean across tables with identical layout.
    fn mean(tables: &[ScoreTable]) -> Result<ScoreTable, DistillError> {
        let first = tables
            .first()
            .ok_or_else(|| DistillError::runtime("cannot average zero score tables"))?;
        let mut mean = first.clone();
        for table in &tables[1..] {
            if table.columns != first.columns || table.rows.len() != first.rows.len() {
                return Err(DistillError::runtime(
                    "per-slice score tables have mismatched layout",
                ));
            }
            for (acc, row) in mean.rows.iter_mut().zip(&table.rows) {
                for (sum, score) in acc.scores.iter_mut().zip(&row.scores) {
                    *sum += score;
                }
            }
        }
        let count = tables.len() as f64;
        for row in &mut mean.rows {
            for score in &mut row.scores {
                *score /= count;
            }
        }
        Ok(mean)
    }
}

impl fmt::Display for ScoreTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<24}", "enhancer")?;
        for column in &self.columns {
            write!(f, " {:>16}", column)?;
        }
        writeln!(f)?;
        for row in &self.rows {
            write!(f, "{:<24}", row.name)?;
            for score in &row.scores {
                write!(f, " {:>16.6}", score)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Score every enhancer against every forest's prediction of `data`.
///
/// `data` and `labels` must have the same shape and be 2D or 3D. With
/// `per_slice` set on a 3D volume, each leading-axis slice is scored
/// independently and the per-slice tables are averaged.
pub fn evaluate_enhancers(
    data: &ArrayD<f32>,
    labels: &ArrayD<f32>,
    enhancers: &mut BTreeMap<String, Box<dyn Enhancer>>,
    forests: &mut BTreeMap<String, Box<dyn ForestPredictor>>,
    metric: &MetricFn,
    options: &EvalOptions,
) -> Result<ScoreTable, DistillError> {
    if data.shape() != labels.shape() {
        return Err(DistillError::config(format!(
            "data shape {:?} does not match label shape {:?}",
            data.shape(),
            labels.shape()
        )));
    }
    let ndim = data.ndim();
    if ndim != 2 && ndim != 3 {
        return Err(DistillError::config(format!(
            "evaluation expects 2d or 3d data, got {}d",
            ndim
        )));
    }

    if ndim == 3 && options.per_slice {
        let mut tables = Vec::with_capacity(data.shape()[0]);
        for z in 0..data.shape()[0] {
            let slice = data.index_axis(Axis(0), z).to_owned().into_dyn();
            let slice_labels = labels.index_axis(Axis(0), z).to_owned().into_dyn();
            tables.push(process_chunk(
                &slice,
                &slice_labels,
                enhancers,
                forests,
                metric,
                options,
                Some(z),
            )?);
        }
        ScoreTable::mean(&tables)
    } else {
        process_chunk(data, labels, enhancers, forests, metric, options, None)
    }
}

/// One scoring pass over a single 2D image or whole 3D volume.
fn process_chunk(
    data: &ArrayD<f32>,
    labels: &ArrayD<f32>,
    enhancers: &mut BTreeMap<String, Box<dyn Enhancer>>,
    forests: &mut BTreeMap<String, Box<dyn ForestPredictor>>,
    metric: &MetricFn,
    options: &EvalOptions,
    slice_index: Option<usize>,
) -> Result<ScoreTable, DistillError> {
    let columns: Vec<String> = forests.keys().cloned().collect();
    let mut rows: Vec<ScoreRow> = enhancers
        .keys()
        .cloned()
        .chain(std::iter::once(FOREST_BASELINE_ROW.to_string()))
        .map(|name| ScoreRow {
            name,
            scores: Vec::with_capacity(columns.len()),
        })
        .collect();

    for (forest_name, forest) in forests.iter_mut() {
        let forest_prediction =
            require_forest_prediction(forest.as_mut(), data, forest_name, options, slice_index)?;

        // Forest predictions reach an enhancer with batch and channel axes
        // on top of the spatial axes; missing leading axes are inserted.
        let enhancer_input = pad_to_ndim(forest_prediction.clone(), labels.ndim() + 2);

        for (enhancer_name, enhancer) in enhancers.iter_mut() {
            let prediction = require_enhancer_prediction(
                enhancer.as_mut(),
                &enhancer_input,
                enhancer_name,
                forest_name,
                options,
                slice_index,
            )?;
            let score = metric(&squeeze_to_ndim(prediction, labels.ndim()), labels);
            row_mut(&mut rows, enhancer_name).scores.push(score);
        }

        let baseline = metric(&squeeze_to_ndim(forest_prediction, labels.ndim()), labels);
        row_mut(&mut rows, FOREST_BASELINE_ROW).scores.push(baseline);
    }

    Ok(ScoreTable { columns, rows })
}

fn row_mut<'a>(rows: &'a mut [ScoreRow], name: &str) -> &'a mut ScoreRow {
    rows.iter_mut()
        .find(|row| row.name == name)
        .unwrap_or_else(|| unreachable!("score rows are pre-populated"))
}

fn cache_key(segments: &[&str], slice_index: Option<usize>) -> String {
    let mut key = segments.join("/");
    if let Some(index) = slice_index {
        key.push_str(&format!("/{:04}", index));
    }
    key
}

/// Obtain a forest's prediction, from the cache when one is configured.
/// Cached entries are stored normalized to `spatial + 2` dimensions; without
/// a cache the raw prediction is returned as computed.
fn require_forest_prediction(
    forest: &mut dyn ForestPredictor,
    data: &ArrayD<f32>,
    forest_name: &str,
    options: &EvalOptions,
    slice_index: Option<usize>,
) -> Result<ArrayD<f32>, DistillError> {
    match &options.cache_path {
        Some(path) => {
            let target_ndim = data.ndim() + 2;
            // The store is opened per lookup so a failure mid-evaluation
            // never leaves it held open.
            let cache = PredictionCache::open(path)?;
            cache.get_or_compute(&cache_key(&[forest_name], slice_index), || {
                Ok(pad_to_ndim(forest.predict(data)?, target_ndim))
            })
        }
        None => forest.predict(data),
    }
}

/// Obtain an enhancer's output for a forest prediction, from the cache when
/// one is configured. The leading batch axis is dropped before the result is
/// stored or returned.
fn require_enhancer_prediction(
    enhancer: &mut dyn Enhancer,
    input: &ArrayD<f32>,
    enhancer_name: &str,
    forest_name: &str,
    options: &EvalOptions,
    slice_index: Option<usize>,
) -> Result<ArrayD<f32>, DistillError> {
    let infer = |enhancer: &mut dyn Enhancer| -> Result<ArrayD<f32>, DistillError> {
        let output = match &options.adapter {
            Some(adapter) => adapter(enhancer, input)?,
            None => enhancer.infer(input)?,
        };
        Ok(drop_batch_axis(output, input.ndim()))
    };

    match &options.cache_path {
        Some(path) => {
            let cache = PredictionCache::open(path)?;
            cache.get_or_compute(
                &cache_key(&[enhancer_name, forest_name], slice_index),
                || infer(enhancer),
            )
        }
        None => infer(enhancer),
    }
}

/// Insert leading length-1 axes until the array has `ndim` dimensions.
fn pad_to_ndim(mut array: ArrayD<f32>, ndim: usize) -> ArrayD<f32> {
    while array.ndim() < ndim {
        array = array.insert_axis(Axis(0));
    }
    array
}

/// Remove leading length-1 axes down to `ndim` dimensions; axes of other
/// lengths are kept, so a genuinely multi-channel prediction is left intact.
fn squeeze_to_ndim(mut array: ArrayD<f32>, ndim: usize) -> ArrayD<f32> {
    while array.ndim() > ndim && array.shape()[0] == 1 {
        array = array.remove_axis(Axis(0));
    }
    array
}

/// Drop the batch axis from an enhancer output when one is present.
fn drop_batch_axis(array: ArrayD<f32>, input_ndim: usize) -> ArrayD<f32> {
    if array.ndim() == input_ndim {
        array.index_axis_move(Axis(0), 0)
    } else {
        array
    }
}

/// Fan independent forest predictions over precomputed features across the
/// CPU pool; the returned order matches the input order. A diagnostic
/// utility for inspecting pretrained forests, not part of the scoring loop.
pub fn predict_forests<F>(
    forests: &[(String, F)],
    features: &ArrayD<f32>,
) -> Result<Vec<(String, ArrayD<f32>)>, DistillError>
where
    F: Fn(&ArrayD<f32>) -> Result<ArrayD<f32>, DistillError> + Sync,
{
    forests
        .par_iter()
        .map(|(name, predict)| Ok((name.clone(), predict(features)?)))
        .collect()
}
