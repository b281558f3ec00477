//! Execution rate limiter with cooldown-gated demotion.
//!
//! Fixed-window counting: the window restarts wholesale once more than
//! `window_ms` has passed since it opened. Bursts straddling a boundary are
//! split across two windows and may not reach the threshold in either.
//! State lives in the key-value store so it survives restarts.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::config::RateConfig;
use crate::observability::{log_demotion, log_milestone};
use crate::ports::{KeyValueStore, TimePort};

const KEY_WINDOW_START: &str = "rate.window_start";
const KEY_COUNT: &str = "rate.count";
const KEY_LAST_DEMOTION: &str = "rate.last_demotion";
const KEY_TOTAL: &str = "rate.total";
const KEY_MILESTONE_AT: &str = "rate.milestone_at";

/// What `mark_demoted` does to the window counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterOnDemotion {
    /// Leave the count alone; the cooldown alone prevents re-demotion.
    #[default]
    Keep,
    /// Zero the count so the threshold has to be reached again.
    Reset,
}

pub const DEFAULT_COUNTER_ON_DEMOTION: CounterOnDemotion = CounterOnDemotion::Keep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RateState {
    pub window_start: u64,
    pub count_in_window: u64,
    pub last_demotion_at: u64,
    pub total_executions: u64,
}

pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn TimePort>,
    cfg: RateConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn TimePort>, cfg: RateConfig) -> Self {
        Self { store, clock, cfg }
    }

    pub fn state(&self) -> RateState {
        RateState {
            window_start: self.read(KEY_WINDOW_START),
            count_in_window: self.read(KEY_COUNT),
            last_demotion_at: self.read(KEY_LAST_DEMOTION),
            total_executions: self.read(KEY_TOTAL),
        }
    }

    pub fn record_execution(&self) -> RateState {
        let now = self.clock.now_millis();
        let mut state = self.state();

        if now.saturating_sub(state.window_start) > self.cfg.window_ms {
            state.window_start = now;
            state.count_in_window = 1;
            self.write(KEY_WINDOW_START, state.window_start);
        } else {
            state.count_in_window += 1;
        }
        self.write(KEY_COUNT, state.count_in_window);

        state.total_executions += 1;
        self.write(KEY_TOTAL, state.total_executions);
        if self.cfg.milestone_every > 0 && state.total_executions % self.cfg.milestone_every == 0 {
            let last = self.read(KEY_MILESTONE_AT);
            let delta = if last == 0 { 0 } else { now.saturating_sub(last) };
            self.write(KEY_MILESTONE_AT, now);
            log_milestone(state.total_executions, delta);
        }
        state
    }

    pub fn should_demote(&self) -> bool {
        let now = self.clock.now_millis();
        let state = self.state();
        state.count_in_window >= self.cfg.threshold
            && now.saturating_sub(state.last_demotion_at) >= self.cfg.cooldown_ms
    }

    pub fn mark_demoted(&self) {
        let now = self.clock.now_millis();
        let count = self.read(KEY_COUNT);
        self.write(KEY_LAST_DEMOTION, now);
        if self.cfg.on_demotion == CounterOnDemotion::Reset {
            self.write(KEY_COUNT, 0);
        }
        log_demotion(count);
    }

    fn read(&self, key: &str) -> u64 {
        match self.store.get_u64(key) {
            Ok(v) => v.unwrap_or(0),
            Err(e) => {
                warn!(key = %key, error = %e, "Rate state read failed, using default");
                0
            }
        }
    }

    fn write(&self, key: &str, value: u64) {
        if let Err(e) = self.store.set(key, json!(value)) {
            warn!(key = %key, error = %e, "Rate state write failed");
        }
    }
}
