//! Settles noisy window-change notifications into foreground changes.
//!
//! A raw window id becomes the candidate; it is forwarded only if nothing
//! else replaced it for `stable_ms`. Blank ids and ids under an ignored
//! prefix (system chrome) never become candidates.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::StabilizerConfig;
use crate::engine::PolicyEngine;

/// Receiver of settled foreground changes.
pub trait ForegroundSink: Send + Sync {
    fn foreground_changed(&self, entity: &str);
}

impl ForegroundSink for PolicyEngine {
    fn foreground_changed(&self, entity: &str) {
        self.on_foreground_changed(entity);
    }
}

#[derive(Default)]
struct Pending {
    candidate: Option<String>,
    seq: u64,
    timer: Option<JoinHandle<()>>,
}

pub struct ForegroundStabilizer {
    sink: Arc<dyn ForegroundSink>,
    stable_for: Duration,
    ignore_prefixes: Vec<String>,
    runtime: Handle,
    pending: Arc<Mutex<Pending>>,
}

fn lock(m: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ForegroundStabilizer {
    /// # Panics
    /// Outside a Tokio runtime.
    pub fn new(sink: Arc<dyn ForegroundSink>, cfg: &StabilizerConfig) -> Self {
        Self {
            sink,
            stable_for: Duration::from_millis(cfg.stable_ms),
            ignore_prefixes: cfg.ignore_prefixes.clone(),
            runtime: Handle::current(),
            pending: Arc::new(Mutex::new(Pending::default())),
        }
    }

    pub fn on_window_changed(&self, window_id: &str) {
        let id = window_id.trim();
        if id.is_empty() || self.ignore_prefixes.iter().any(|p| id.starts_with(p.as_str())) {
            return;
        }

        let mut pending = lock(&self.pending);
        if pending.candidate.as_deref() == Some(id) {
            return;
        }
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        pending.seq += 1;
        pending.candidate = Some(id.to_string());

        let seq = pending.seq;
        let entity = id.to_string();
        let sink = Arc::clone(&self.sink);
        let shared = Arc::clone(&self.pending);
        let stable_for = self.stable_for;
        pending.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(stable_for).await;
            {
                let mut p = lock(&shared);
                if p.seq != seq {
                    return;
                }
                p.timer = None;
            }
            debug!(entity = %entity, "Foreground settled");
            sink.foreground_changed(&entity);
        }));
    }

    /// Drop the pending candidate without forwarding it.
    pub fn interrupt(&self) {
        let mut pending = lock(&self.pending);
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        pending.seq += 1;
        pending.candidate = None;
    }

    /// A candidate is waiting out its stable period.
    pub fn is_pending(&self) -> bool {
        lock(&self.pending).timer.is_some()
    }

    pub fn candidate(&self) -> Option<String> {
        lock(&self.pending).candidate.clone()
    }
}
