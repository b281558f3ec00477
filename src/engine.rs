//! Policy engine: foreground changes in, privileged actions out.
//!
//! Calls to [`PolicyEngine::on_foreground_changed`] never block. They are
//! queued onto a single worker task that runs the decision pipeline one
//! event at a time, in arrival order. The worker is spawned lazily, shuts
//! itself down after `idle_timeout` without work and is respawned by the
//! next event. Spawning, queuing and teardown all happen under one lock, so
//! an event can never be queued onto a worker that is going away.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn, Instrument};

use crate::adapters::{StdEnvAdapter, StdTimeAdapter, TokioLauncher};
use crate::channel::Channel;
use crate::config::{ActionSpec, ConfigError, EngineConfig, PrivilegeRequestConfig};
use crate::discovery::DiscoveryGate;
use crate::dispatch::{CommandBuilder, DispatchMode, Dispatcher};
use crate::eligibility::EligibilityCache;
use crate::layout::ExecutableRef;
use crate::observability::EventContext;
use crate::ports::{EnvironmentPort, KeyValueStore, Launcher, TimePort};
use crate::rate::RateLimiter;
use crate::resolver::PrivilegeResolver;

pub const KEY_EXEC_AT: &str = "diag.exec_at";
pub const KEY_DEMOTE_AT: &str = "diag.demote_at";
/// Last time the memoized channel was dropped on request.
pub const KEY_INVALIDATED_AT: &str = "privilege.invalidated_at";

const ENTITY_PLACEHOLDER: &str = "{entity}";

/// Outcome of evaluating one foreground change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Same entity as the previous event.
    Debounced,
    Ineligible,
    NoChannel,
    /// Too soon after the previous dispatch.
    Throttled,
    Dispatched { channel: Channel, demoted: bool },
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Debounced => "debounced",
            Decision::Ineligible => "ineligible",
            Decision::NoChannel => "no_channel",
            Decision::Throttled => "throttled",
            Decision::Dispatched { demoted: false, .. } => "dispatched",
            Decision::Dispatched { demoted: true, .. } => "dispatched_demoted",
        }
    }
}

/// Result of [`PolicyEngine::request_privilege`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivilegeGrant {
    pub channel: Channel,
    /// The discovery action was launched as part of this request.
    pub discovered: bool,
}

impl PrivilegeGrant {
    fn denied() -> Self {
        Self {
            channel: Channel::None,
            discovered: false,
        }
    }
}

/// External collaborators the engine is wired to.
pub struct EngineDeps {
    pub launcher: Arc<dyn Launcher>,
    pub env: Arc<dyn EnvironmentPort>,
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn TimePort>,
}

impl EngineDeps {
    /// Real processes, real environment, wall clock.
    pub fn system(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            launcher: Arc::new(TokioLauncher),
            env: Arc::new(StdEnvAdapter),
            store,
            clock: Arc::new(StdTimeAdapter),
        }
    }
}

enum Task {
    Foreground(String),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct WorkerSlot {
    tx: Option<mpsc::UnboundedSender<Task>>,
    generation: u64,
}

#[derive(Default)]
struct DecisionState {
    last_entity: Option<String>,
    last_dispatch_at: Option<u64>,
}

/// Decision pipeline; only ever driven by the worker.
struct Core {
    resolver: Arc<PrivilegeResolver>,
    dispatcher: Arc<Dispatcher>,
    eligibility: Arc<EligibilityCache>,
    rate: Arc<RateLimiter>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn TimePort>,
    primary: ActionSpec,
    demote: ActionSpec,
    demote_mode: DispatchMode,
    min_interval_ms: u64,
    state: Mutex<DecisionState>,
}

pub struct PolicyEngine {
    core: Arc<Core>,
    discovery: Arc<DiscoveryGate>,
    runtime: Handle,
    slot: Arc<Mutex<WorkerSlot>>,
    idle_timeout: Duration,
    request: PrivilegeRequestConfig,
    last_request_at: Mutex<Option<u64>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PolicyEngine {
    /// Wire every component from `cfg`. Fails only on configuration errors
    /// (bad values, unsupported architecture).
    ///
    /// # Panics
    /// Outside a Tokio runtime.
    pub fn from_config(cfg: &EngineConfig, deps: EngineDeps) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let layout = cfg.layout()?;
        info!(
            bin_dir = %layout.bin_dir().display(),
            abi = %layout.abi(),
            "Binary layout selected"
        );

        let builder = Arc::new(CommandBuilder::new(
            layout,
            cfg.direct.clone(),
            cfg.mediated.clone(),
            deps.env,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&builder),
            Arc::clone(&deps.launcher),
            cfg.sync_timeout(),
        ));
        let resolver = Arc::new(PrivilegeResolver::new(
            builder,
            deps.launcher,
            cfg.probe_timeout(),
        ));
        let eligibility = Arc::new(EligibilityCache::new(
            &cfg.eligibility,
            cfg.sync_timeout(),
            Arc::clone(&resolver),
            Arc::clone(&dispatcher),
            Arc::clone(&deps.store),
        ));
        let rate = Arc::new(RateLimiter::new(
            Arc::clone(&deps.store),
            Arc::clone(&deps.clock),
            cfg.rate.clone(),
        ));
        let discovery = Arc::new(DiscoveryGate::new(
            cfg.actions.discovery.clone(),
            Arc::clone(&dispatcher),
            Arc::clone(&deps.store),
            Arc::clone(&deps.clock),
        ));

        let core = Arc::new(Core {
            resolver,
            dispatcher,
            eligibility,
            rate,
            store: deps.store,
            clock: deps.clock,
            primary: cfg.actions.primary.clone(),
            demote: cfg.actions.demote.clone(),
            demote_mode: cfg.engine.demote_mode,
            min_interval_ms: cfg.engine.min_interval_ms,
            state: Mutex::new(DecisionState::default()),
        });

        Ok(Self {
            core,
            discovery,
            runtime: Handle::current(),
            slot: Arc::new(Mutex::new(WorkerSlot::default())),
            idle_timeout: Duration::from_millis(cfg.engine.idle_timeout_ms),
            request: cfg.privilege_request.clone(),
            last_request_at: Mutex::new(None),
        })
    }

    /// Report a foreground change. Returns immediately; safe from any thread.
    pub fn on_foreground_changed(&self, entity: impl Into<String>) {
        self.enqueue(Task::Foreground(entity.into()));
    }

    /// Wait until everything queued before this call has been processed,
    /// including the background dispatches it produced.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Task::Flush(tx));
        let _ = rx.await;
        self.core.dispatcher.drain().await;
    }

    pub fn worker_active(&self) -> bool {
        lock(&self.slot).tx.is_some()
    }

    pub fn resolver(&self) -> &PrivilegeResolver {
        &self.core.resolver
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.core.rate
    }

    pub fn eligibility(&self) -> &EligibilityCache {
        &self.core.eligibility
    }

    pub fn discovery(&self) -> &DiscoveryGate {
        &self.discovery
    }

    /// Run the discovery gate on whatever channel currently resolves.
    pub async fn discover(&self) -> bool {
        let channel = self.core.resolver.resolve().await;
        self.discovery.run_once(channel).await
    }

    /// User-initiated privilege re-check.
    ///
    /// Drops the memoized channel and retries resolution until a privileged
    /// channel shows up or the retry budget is spent; on success the
    /// discovery gate runs. A request arriving within `min_interval_ms` of
    /// the previous one does not re-probe; it reports the current channel.
    pub async fn request_privilege(&self) -> PrivilegeGrant {
        let now = self.core.clock.now_millis();
        let too_soon = {
            let mut last = lock(&self.last_request_at);
            match *last {
                Some(prev) if now.saturating_sub(prev) < self.request.min_interval_ms => true,
                _ => {
                    *last = Some(now);
                    false
                }
            }
        };
        if too_soon {
            debug!("Privilege request ignored, too soon after the previous one");
            return PrivilegeGrant {
                channel: self.core.resolver.resolve().await,
                discovered: false,
            };
        }
        self.core.mark(KEY_INVALIDATED_AT, now);

        let delay = Duration::from_millis(self.request.retry_delay_ms);
        for attempt in 0..=self.request.retry_max {
            self.core.resolver.invalidate().await;
            let channel = self.core.resolver.resolve().await;
            if channel.is_privileged() {
                info!(channel = %channel, attempt = attempt, "Privilege granted");
                let discovered = self.discovery.run_once(channel).await;
                return PrivilegeGrant {
                    channel,
                    discovered,
                };
            }
            if attempt < self.request.retry_max {
                tokio::time::sleep(delay).await;
            }
        }
        warn!(attempts = self.request.retry_max + 1, "Privilege request gave up");
        PrivilegeGrant::denied()
    }

    fn enqueue(&self, task: Task) {
        let mut slot = lock(&self.slot);
        let task = match &slot.tx {
            Some(tx) => match tx.send(task) {
                Ok(()) => return,
                // worker vanished without clearing the slot (runtime shutdown)
                Err(mpsc::error::SendError(task)) => task,
            },
            None => task,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(task).is_err() {
            return;
        }
        slot.tx = Some(tx);
        slot.generation += 1;
        let generation = slot.generation;
        debug!(generation = generation, "Spawning policy worker");
        self.runtime.spawn(run_worker(
            Arc::clone(&self.core),
            rx,
            Arc::clone(&self.slot),
            generation,
            self.idle_timeout,
        ));
    }
}

async fn run_worker(
    core: Arc<Core>,
    mut rx: mpsc::UnboundedReceiver<Task>,
    slot: Arc<Mutex<WorkerSlot>>,
    generation: u64,
    idle_timeout: Duration,
) {
    loop {
        let task = match tokio::time::timeout(idle_timeout, rx.recv()).await {
            Ok(Some(task)) => task,
            Ok(None) => break,
            Err(_) => {
                // Idle. Anything already queued is drained first; otherwise
                // the slot is cleared under the same lock senders take.
                let pending = {
                    let mut s = lock(&slot);
                    match rx.try_recv() {
                        Ok(task) => Some(task),
                        Err(_) => {
                            if s.generation == generation {
                                s.tx = None;
                            }
                            None
                        }
                    }
                };
                match pending {
                    Some(task) => task,
                    None => {
                        debug!(generation = generation, "Policy worker idle, shutting down");
                        break;
                    }
                }
            }
        };
        core.process(task).await;
    }
}

impl Core {
    async fn process(&self, task: Task) {
        match task {
            Task::Foreground(entity) => {
                let ctx = EventContext::new(&entity);
                let run = AssertUnwindSafe(self.evaluate(&entity)).catch_unwind();
                match run.instrument(ctx.span()).await {
                    Ok(decision) => ctx.record_decision(decision.as_str()),
                    Err(_) => error!(entity = %entity, "Foreground evaluation panicked"),
                }
            }
            Task::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn evaluate(&self, entity: &str) -> Decision {
        {
            let mut st = lock(&self.state);
            if st.last_entity.as_deref() == Some(entity) {
                return Decision::Debounced;
            }
            st.last_entity = Some(entity.to_string());
        }

        if !self.eligibility.is_eligible(entity).await {
            return Decision::Ineligible;
        }

        let channel = self.resolver.resolve().await;
        if !channel.is_privileged() {
            return Decision::NoChannel;
        }

        let now = self.clock.now_millis();
        {
            let mut st = lock(&self.state);
            if let Some(last) = st.last_dispatch_at {
                if now.saturating_sub(last) < self.min_interval_ms {
                    return Decision::Throttled;
                }
            }
            st.last_dispatch_at = Some(now);
        }

        self.mark(KEY_EXEC_AT, now);
        self.rate.record_execution();
        self.dispatcher.submit(
            channel,
            &ExecutableRef::new(self.primary.binary.as_str()),
            &expand_args(&self.primary.args, entity),
        );

        let demoted = if self.rate.should_demote() {
            self.dispatcher
                .exec(
                    channel,
                    &ExecutableRef::new(self.demote.binary.as_str()),
                    &expand_args(&self.demote.args, entity),
                    self.demote_mode,
                )
                .await;
            self.mark(KEY_DEMOTE_AT, self.clock.now_millis());
            self.rate.mark_demoted();
            true
        } else {
            false
        };

        Decision::Dispatched { channel, demoted }
    }

    fn mark(&self, key: &str, at: u64) {
        if let Err(e) = self.store.set(key, json!(at)) {
            warn!(key = %key, error = %e, "Diagnostic mark failed");
        }
    }
}

/// Substitute `{entity}` in action arguments.
pub fn expand_args(args: &[String], entity: &str) -> Vec<String> {
    args.iter()
        .map(|a| a.replace(ENTITY_PLACEHOLDER, entity))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_entity_placeholder() {
        let args = vec!["boost".to_string(), "{entity}".to_string(), "x{entity}y".to_string()];
        assert_eq!(
            expand_args(&args, "com.example"),
            vec!["boost", "com.example", "xcom.exampley"]
        );
    }

    #[test]
    fn decision_labels() {
        assert_eq!(Decision::Debounced.as_str(), "debounced");
        assert_eq!(
            Decision::Dispatched {
                channel: Channel::Direct,
                demoted: true
            }
            .as_str(),
            "dispatched_demoted"
        );
    }
}
