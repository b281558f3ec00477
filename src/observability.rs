//! Observability for the policy engine
//! Structured logging plus metric lines that log aggregators can pick up

use std::fs::OpenOptions;
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, info, instrument, warn, Span};
use tracing_subscriber::EnvFilter;

use crate::channel::Channel;
use crate::config::LoggingConfig;
use crate::ports::{ExecError, ExecOutcome};

/// Initialize logging. `RUST_LOG` wins over `logging.level`; JSON when
/// `logging.json` (or `FGPOLICY_LOG_JSON=1`); lines go to `logging.file`
/// instead of stderr when set. Stdout is left to command output.
pub fn init_observability(
    cfg: &LoggingConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let default_level = cfg.level.as_deref().unwrap_or("info");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let is_json = cfg.json || std::env::var("FGPOLICY_LOG_JSON").ok() == Some("1".to_string());

    match (&cfg.file, is_json) {
        (Some(path), true) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(env_filter)
                .with_target(true)
                .with_current_span(true)
                .with_writer(Mutex::new(file))
                .try_init()?;
        }
        (Some(path), false) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()?;
        }
        (None, true) => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(env_filter)
                .with_target(true)
                .with_current_span(true)
                .with_writer(std::io::stderr)
                .try_init()?;
        }
        (None, false) => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .try_init()?;
        }
    }

    info!("Policy engine observability initialized");
    Ok(())
}

/// Per-event context; one span per foreground change.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub entity: String,
    pub start_time: Instant,
}

impl EventContext {
    pub fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            start_time: Instant::now(),
        }
    }

    pub fn span(&self) -> Span {
        tracing::info_span!("foreground", entity = %self.entity)
    }

    pub fn record_decision(&self, decision: &str) {
        let duration_ms = self.start_time.elapsed().as_millis() as u64;
        debug!(
            entity = %self.entity,
            decision = %decision,
            duration_ms = duration_ms,
            "Foreground event evaluated"
        );
        info!(
            metric_name = "fgpolicy_decisions_total",
            value = 1,
            decision = %decision,
            "metric"
        );
    }
}

/// Log one channel probe
#[instrument(level = "debug")]
pub fn log_probe(channel: Channel, success: bool, detail: &str) {
    if success {
        debug!(channel = %channel, detail = %detail, "Channel probe succeeded");
    } else {
        debug!(channel = %channel, detail = %detail, "Channel probe failed");
    }
    info!(
        metric_name = "fgpolicy_probes_total",
        value = 1,
        channel = %channel,
        success = success,
        "metric"
    );
}

/// Log a finished (or failed) dispatch
pub fn log_dispatch(action: &str, channel: Channel, result: &Result<ExecOutcome, ExecError>) {
    match result {
        Ok(out) if out.success() => {
            debug!(action = %action, channel = %channel, "Dispatch succeeded");
        }
        Ok(out) => {
            warn!(
                action = %action,
                channel = %channel,
                exit_code = ?out.exit_code,
                "Dispatch exited unsuccessfully"
            );
        }
        Err(e) => {
            warn!(action = %action, channel = %channel, error = %e, "Dispatch failed");
        }
    }
    info!(
        metric_name = "fgpolicy_dispatch_total",
        value = 1,
        action = %action,
        success = matches!(result, Ok(out) if out.success()),
        "metric"
    );
}

pub fn log_milestone(total: u64, delta_ms: u64) {
    info!(total = total, delta_ms = delta_ms, "Execution milestone reached");
    info!(
        metric_name = "fgpolicy_executions_total",
        value = total,
        "metric"
    );
}

pub fn log_demotion(count_in_window: u64) {
    info!(count_in_window = count_in_window, "Demotion dispatched");
    info!(
        metric_name = "fgpolicy_demotions_total",
        value = 1,
        "metric"
    );
}
