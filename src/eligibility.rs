//! Which foreground entities qualify for policy actions.
//!
//! Static allow-list first, then the discovered set of ordinary (user
//! installed) entities. The discovered set is built at most once per
//! process: from the persisted snapshot when there is one, otherwise from
//! the privileged listing command. Failures leave it empty for the rest of
//! the process rather than retrying.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::EligibilityConfig;
use crate::dispatch::Dispatcher;
use crate::ports::KeyValueStore;
use crate::resolver::PrivilegeResolver;

pub const SNAPSHOT_KEY: &str = "eligibility.snapshot";

pub struct EligibilityCache {
    allow_list: HashSet<String>,
    list_command: Vec<String>,
    line_prefix: String,
    list_timeout: Option<Duration>,
    resolver: Arc<PrivilegeResolver>,
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn KeyValueStore>,
    discovered: OnceCell<HashSet<String>>,
    listing_runs: AtomicU64,
}

impl EligibilityCache {
    pub fn new(
        cfg: &EligibilityConfig,
        list_timeout: Option<Duration>,
        resolver: Arc<PrivilegeResolver>,
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            allow_list: cfg.allow_list.iter().cloned().collect(),
            list_command: cfg.list_command.clone(),
            line_prefix: cfg.line_prefix.clone(),
            list_timeout,
            resolver,
            dispatcher,
            store,
            discovered: OnceCell::new(),
            listing_runs: AtomicU64::new(0),
        }
    }

    pub async fn is_eligible(&self, entity: &str) -> bool {
        if self.allow_list.contains(entity) {
            return true;
        }
        self.discovered().await.contains(entity)
    }

    pub fn is_loaded(&self) -> bool {
        self.discovered.initialized()
    }

    /// Times the listing command was actually run by this process.
    pub fn listing_runs(&self) -> u64 {
        self.listing_runs.load(Ordering::SeqCst)
    }

    async fn discovered(&self) -> &HashSet<String> {
        self.discovered.get_or_init(|| self.load()).await
    }

    async fn load(&self) -> HashSet<String> {
        if let Some(set) = self.restore_snapshot() {
            info!(entries = set.len(), "Eligibility restored from snapshot");
            return set;
        }

        let channel = self.resolver.resolve().await;
        if !channel.is_privileged() {
            info!("No privileged channel, eligibility set stays empty");
            return HashSet::new();
        }

        self.listing_runs.fetch_add(1, Ordering::SeqCst);
        let set = match self
            .dispatcher
            .capture(channel, &self.list_command, self.list_timeout)
            .await
        {
            Ok(out) => {
                if !out.success() {
                    warn!(exit_code = ?out.exit_code, "Listing exited unsuccessfully, keeping partial output");
                }
                parse_listing(&out.stdout, &self.line_prefix)
            }
            Err(e) => {
                warn!(error = %e, "Listing failed, eligibility set stays empty");
                HashSet::new()
            }
        };

        info!(entries = set.len(), channel = %channel, "Eligibility set loaded");
        if !set.is_empty() {
            self.persist_snapshot(&set);
        }
        set
    }

    fn restore_snapshot(&self) -> Option<HashSet<String>> {
        match self.store.get(SNAPSHOT_KEY) {
            Ok(Some(Value::Array(items))) => Some(
                items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            Ok(Some(other)) => {
                warn!(value = %other, "Ignoring malformed eligibility snapshot");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Eligibility snapshot unreadable");
                None
            }
        }
    }

    fn persist_snapshot(&self, set: &HashSet<String>) {
        let sorted: BTreeSet<&String> = set.iter().collect();
        match serde_json::to_value(sorted) {
            Ok(value) => {
                if let Err(e) = self.store.set(SNAPSHOT_KEY, value) {
                    warn!(error = %e, "Eligibility snapshot write failed");
                } else {
                    debug!(entries = set.len(), "Eligibility snapshot written");
                }
            }
            Err(e) => warn!(error = %e, "Eligibility snapshot encoding failed"),
        }
    }
}

/// One entity id per line carrying `prefix`; everything else is ignored.
pub fn parse_listing(stdout: &str, prefix: &str) -> HashSet<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix(prefix))
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}
