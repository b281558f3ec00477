//! Privilege channel resolution.
//!
//! The first `resolve()` probes Direct, then Mediated, and memoizes the
//! answer (including `None`). Concurrent first callers queue on the cell's
//! mutex, so exactly one probe sequence runs and everyone sees its result.
//! Only `invalidate()` clears the memo.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use crate::channel::Channel;
use crate::dispatch::CommandBuilder;
use crate::observability::log_probe;
use crate::ports::Launcher;

pub struct PrivilegeResolver {
    builder: Arc<CommandBuilder>,
    launcher: Arc<dyn Launcher>,
    probe_timeout: Duration,
    cell: Mutex<Option<Channel>>,
    probe_runs: AtomicU64,
}

impl PrivilegeResolver {
    pub fn new(
        builder: Arc<CommandBuilder>,
        launcher: Arc<dyn Launcher>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            builder,
            launcher,
            probe_timeout,
            cell: Mutex::new(None),
            probe_runs: AtomicU64::new(0),
        }
    }

    pub async fn resolve(&self) -> Channel {
        let mut cell = self.cell.lock().await;
        if let Some(channel) = *cell {
            return channel;
        }
        let channel = self.probe_all().await;
        *cell = Some(channel);
        info!(channel = %channel, "Privilege resolved");
        channel
    }

    /// Forget the memoized channel; the next `resolve()` probes again.
    pub async fn invalidate(&self) {
        let mut cell = self.cell.lock().await;
        if cell.take().is_some() {
            info!("Privilege cache invalidated");
        }
    }

    /// Memoized value without probing or waiting. `None` while unresolved
    /// and whenever another caller holds the memo (a probe in flight, or a
    /// concurrent `resolve()`/`invalidate()`), so it is a snapshot for
    /// diagnostics; use `resolve()` for an authoritative answer.
    pub fn peek(&self) -> Option<Channel> {
        self.cell.try_lock().ok().and_then(|cell| *cell)
    }

    /// Number of probe sequences run so far.
    pub fn probe_runs(&self) -> u64 {
        self.probe_runs.load(Ordering::SeqCst)
    }

    async fn probe_all(&self) -> Channel {
        self.probe_runs.fetch_add(1, Ordering::SeqCst);
        if self.probe_direct().await {
            return Channel::Direct;
        }
        if self.probe_mediated().await {
            return Channel::Mediated;
        }
        Channel::None
    }

    async fn probe_direct(&self) -> bool {
        let Some(spec) = self.builder.build(Channel::Direct, &self.builder.direct().probe) else {
            return false;
        };
        match self.launcher.launch(&spec, Some(self.probe_timeout), false).await {
            Ok(out) => {
                log_probe(Channel::Direct, out.success(), &format!("exit={:?}", out.exit_code));
                out.success()
            }
            Err(e) => {
                log_probe(Channel::Direct, false, &e.to_string());
                false
            }
        }
    }

    async fn probe_mediated(&self) -> bool {
        let mediated = self.builder.mediated();
        let Some(spec) = self.builder.build(Channel::Mediated, &mediated.probe) else {
            return false;
        };
        let expect = mediated.expect_output.as_deref();
        match self
            .launcher
            .launch(&spec, Some(self.probe_timeout), expect.is_some())
            .await
        {
            Ok(out) => {
                let ok = out.success() && expect.map_or(true, |text| out.stdout.contains(text));
                log_probe(Channel::Mediated, ok, &format!("exit={:?}", out.exit_code));
                ok
            }
            Err(e) => {
                log_probe(Channel::Mediated, false, &e.to_string());
                false
            }
        }
    }
}
