//! Dynamic loss scaling for mixed-precision training.
//!
//! The scale grows after a run of stable steps and backs off when a
//! non-finite loss shows up; its state is persisted in every checkpoint so a
//! resumed run continues with the scale it had reached.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f64,
    pub growth_factor: f64,
    pub backoff_factor: f64,
    pub growth_interval: usize,
    pub min_scale: f64,
    pub max_scale: f64,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f64.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 200,
            min_scale: 1.0,
            max_scale: 2f64.powi(24),
        }
    }
}

/// Serialized scaler state, stored in the checkpoint record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub loss_scale: f64,
    pub stable_steps: usize,
}

#[derive(Debug, Clone)]
pub struct GradScaler {
    state: State,
}

#[derive(Debug, Clone)]
enum State {
    Disabled,
    Enabled(EnabledState),
}

#[derive(Debug, Clone)]
struct EnabledState {
    loss_scale: f64,
    stable_steps: usize,
    config: LossScaleConfig,
}

impl GradScaler {
    pub fn new(mixed_precision: bool) -> Self {
        Self::with_config(LossScaleConfig::default(), mixed_precision)
    }

    pub fn with_config(config: LossScaleConfig, enabled: bool) -> Self {
        if !enabled {
            return Self {
                state: State::Disabled,
            };
        }
        let config = sanitize_config(config);
        Self {
            state: State::Enabled(EnabledState {
                loss_scale: config.initial_scale,
                stable_steps: 0,
                config,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, State::Enabled(_))
    }

    pub fn loss_scale(&self) -> f64 {
        match &self.state {
            State::Disabled => 1.0,
            State::Enabled(state) => state.loss_scale,
        }
    }

    /// Scale a loss before backprop.
    pub fn scale(&self, loss: f64) -> f64 {
        loss * self.loss_scale()
    }

    /// Gradient multiplier handed to the optimizer step; inverse of the loss
    /// scale, so gradients are unscaled exactly once before the update.
    pub fn grad_scale(&self) -> f64 {
        1.0 / self.loss_scale()
    }

    pub fn update(&mut self, found_inf: bool) {
        if let State::Enabled(state) = &mut self.state {
            if found_inf {
                state.loss_scale =
                    (state.loss_scale * state.config.backoff_factor).max(state.config.min_scale);
                state.stable_steps = 0;
            } else {
                state.stable_steps += 1;
                if state.stable_steps >= state.config.growth_interval {
                    state.loss_scale = (state.loss_scale * state.config.growth_factor)
                        .min(state.config.max_scale);
                    state.stable_steps = 0;
                }
            }
        }
    }

    /// Snapshot for checkpointing; `None` when scaling is disabled.
    pub fn state(&self) -> Option<ScalerState> {
        match &self.state {
            State::Disabled => None,
            State::Enabled(state) => Some(ScalerState {
                loss_scale: state.loss_scale,
                stable_steps: state.stable_steps,
            }),
        }
    }

    pub fn load_state(&mut self, snapshot: ScalerState) {
        if let State::Enabled(state) = &mut self.state {
            state.loss_scale = snapshot
                .loss_scale
                .clamp(state.config.min_scale, state.config.max_scale);
            state.stable_steps = snapshot.stable_steps;
        }
    }
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    config.initial_scale = config
        .initial_scale
        .clamp(config.min_scale, config.max_scale);
    config
}
