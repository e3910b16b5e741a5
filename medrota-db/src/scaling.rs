//! Dynamic Scaling Controller
//!
//! Periodically samples pool pressure and moves the pool ceiling between a
//! floor and a hard ceiling. Growth is eager (any waiter triggers it);
//! shrinking only happens when the pool is quiet, and excess connections are
//! reclaimed as they are released rather than closed forcibly.
//!
//! At least `min_scale_interval` elapses between two applied changes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::ScalingConfig;
use crate::constants::WAIT_TIME_WINDOW;
use crate::error::DbResult;
use crate::telemetry::metrics::with_metrics;

/// Pool pressure observed at one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolSample {
    /// `active / total`
    pub utilization: f64,
    pub waiting: usize,
    pub active: usize,
    pub total: usize,
    pub current_max: usize,
    /// Mean acquire wait over the pool's recent window
    pub avg_wait: Duration,
}

/// What the controller needs from a pool.
pub trait ScalablePool: Send + Sync {
    fn sample(&self) -> PoolSample;

    /// Returns the ceiling actually applied, which may differ from `max`
    /// when the pool enforces its own bounds.
    fn set_max_connections(&self, max: usize) -> DbResult<usize>;
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScalingDecision {
    /// No threshold crossed, or already at the bound
    Hold,
    /// Too soon after the previous change
    Cooldown,
    ScaleUp { from: usize, to: usize },
    ScaleDown { from: usize, to: usize },
}

impl ScalingDecision {
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            ScalingDecision::ScaleUp { .. } | ScalingDecision::ScaleDown { .. }
        )
    }
}

/// Controller bookkeeping, readable by metrics consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingState {
    pub current_max: usize,
    #[serde(skip)]
    pub last_scale_action: Option<Instant>,
    pub recent_wait_times: VecDeque<Duration>,
    pub evaluations: u64,
    pub scale_ups: u64,
    pub scale_downs: u64,
}

/// Pure transition function of the controller state machine.
pub fn decide(
    config: &ScalingConfig,
    current_max: usize,
    sample: &PoolSample,
    last_scale_action: Option<Instant>,
    now: Instant,
) -> ScalingDecision {
    if let Some(last) = last_scale_action {
        if now.saturating_duration_since(last) < config.min_scale_interval {
            return ScalingDecision::Cooldown;
        }
    }

    if sample.utilization >= config.scale_up_threshold || sample.waiting > 0 {
        let to = current_max
            .saturating_add(config.scale_up_increment)
            .min(config.max_connections);
        return if to > current_max {
            ScalingDecision::ScaleUp {
                from: current_max,
                to,
            }
        } else {
            ScalingDecision::Hold
        };
    }

    if sample.utilization <= config.scale_down_threshold && sample.waiting == 0 {
        let to = current_max
            .saturating_sub(config.scale_down_decrement)
            .max(config.min_connections);
        if to < current_max {
            return ScalingDecision::ScaleDown {
                from: current_max,
                to,
            };
        }
    }

    ScalingDecision::Hold
}

pub struct ScalingController {
    pool: Arc<dyn ScalablePool>,
    config: ScalingConfig,
    state: Mutex<ScalingState>,
}

impl std::fmt::Debug for ScalingController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalingController")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl ScalingController {
    /// The starting ceiling is the pool's current one, clamped into the
    /// configured bounds. The first evaluation may act immediately.
    pub fn new(pool: Arc<dyn ScalablePool>, config: ScalingConfig) -> Self {
        let current_max = pool
            .sample()
            .current_max
            .clamp(config.min_connections, config.max_connections.max(config.min_connections));
        Self {
            pool,
            config,
            state: Mutex::new(ScalingState {
                current_max,
                last_scale_action: None,
                recent_wait_times: VecDeque::with_capacity(WAIT_TIME_WINDOW),
                evaluations: 0,
                scale_ups: 0,
                scale_downs: 0,
            }),
        }
    }

    /// Treat `at` as the time of the most recent change.
    pub fn with_last_action(self, at: Instant) -> Self {
        self.lock_state().last_scale_action = Some(at);
        self
    }

    pub fn config(&self) -> &ScalingConfig {
        &self.config
    }

    pub fn state(&self) -> ScalingState {
        self.lock_state().clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ScalingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn evaluate(&self) -> DbResult<ScalingDecision> {
        self.evaluate_at(Instant::now())
    }

    /// Sample the pool and apply at most one change. The recorded ceiling is
    /// the one the pool reports applying; a change the pool refuses counts
    /// as `Hold` and does not start a cooldown. A resize error leaves the
    /// state untouched.
    pub fn evaluate_at(&self, now: Instant) -> DbResult<ScalingDecision> {
        let sample = self.pool.sample();
        let mut state = self.lock_state();
        state.evaluations += 1;
        if state.recent_wait_times.len() == WAIT_TIME_WINDOW {
            state.recent_wait_times.pop_front();
        }
        state.recent_wait_times.push_back(sample.avg_wait);

        let proposed = decide(
            &self.config,
            state.current_max,
            &sample,
            state.last_scale_action,
            now,
        );

        let decision = match proposed {
            ScalingDecision::ScaleUp { from, to } | ScalingDecision::ScaleDown { from, to } => {
                let applied = self.pool.set_max_connections(to)?;
                state.current_max = applied;
                if applied == from {
                    ScalingDecision::Hold
                } else if applied > from {
                    ScalingDecision::ScaleUp { from, to: applied }
                } else {
                    ScalingDecision::ScaleDown { from, to: applied }
                }
            }
            other => other,
        };

        match decision {
            ScalingDecision::ScaleUp { from, to } | ScalingDecision::ScaleDown { from, to } => {
                state.last_scale_action = Some(now);
                let direction = if to > from {
                    state.scale_ups += 1;
                    "up"
                } else {
                    state.scale_downs += 1;
                    "down"
                };
                with_metrics(|m| m.record_scaling_action(direction));
                tracing::info!(
                    direction,
                    from,
                    to,
                    requested = ?proposed,
                    utilization = sample.utilization,
                    waiting = sample.waiting,
                    "Scaled connection pool"
                );
            }
            ScalingDecision::Hold | ScalingDecision::Cooldown => {
                tracing::debug!(
                    ?decision,
                    current_max = state.current_max,
                    utilization = sample.utilization,
                    waiting = sample.waiting,
                    "Scaling evaluation"
                );
            }
        }
        Ok(decision)
    }
}
