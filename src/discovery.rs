//! One-time discovery action, gated by a persisted flag.
//!
//! The flag is written once the action was launched, whatever its exit
//! status (a timeout counts as launched), so a failing action is not re-attempted on every start. A launch
//! that never started a process (binary not installed yet, spawn failure)
//! leaves it unset and the next request tries again.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::config::ActionSpec;
use crate::dispatch::Dispatcher;
use crate::layout::ExecutableRef;
use crate::ports::{ExecError, KeyValueStore, TimePort};

pub const KEY_DONE: &str = "discovery.done";
pub const KEY_AT: &str = "discovery.at";

pub struct DiscoveryGate {
    action: ActionSpec,
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn TimePort>,
    gate: Mutex<()>,
}

impl DiscoveryGate {
    pub fn new(
        action: ActionSpec,
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn TimePort>,
    ) -> Self {
        Self {
            action,
            dispatcher,
            store,
            clock,
            gate: Mutex::new(()),
        }
    }

    pub fn is_done(&self) -> bool {
        match self.store.get_bool(KEY_DONE) {
            Ok(done) => done.unwrap_or(false),
            Err(e) => {
                warn!(error = %e, "Discovery flag unreadable");
                false
            }
        }
    }

    /// Dispatch the discovery action synchronously unless it already ran.
    /// Returns whether this call launched the action.
    pub async fn run_once(&self, channel: Channel) -> bool {
        let _gate = self.gate.lock().await;
        if self.is_done() {
            debug!("Discovery already done");
            return false;
        }
        if !channel.is_privileged() {
            debug!("Discovery skipped, no privileged channel");
            return false;
        }

        let exe = ExecutableRef::new(self.action.binary.as_str());
        let outcome = self.dispatcher.run(channel, &exe, &self.action.args).await;
        if let Err(e @ (ExecError::Missing(_) | ExecError::Launch { .. } | ExecError::NoChannel)) =
            &outcome
        {
            warn!(channel = %channel, error = %e, "Discovery not launched");
            return false;
        }

        if let Err(e) = self.store.set(KEY_DONE, json!(true)) {
            warn!(error = %e, "Discovery flag write failed");
        }
        if let Err(e) = self.store.set(KEY_AT, json!(self.clock.now_millis())) {
            warn!(error = %e, "Discovery timestamp write failed");
        }
        info!(
            channel = %channel,
            success = matches!(&outcome, Ok(out) if out.success()),
            "Discovery dispatched"
        );
        true
    }
}
