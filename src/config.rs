//! Engine configuration.
//!
//! Loaded from YAML; every field has a default so an empty document is a
//! valid configuration. A few environment variables override the file:
//!
//! - `FGPOLICY_BASE_DIR` – install root (binaries live in `<base>/bin`)
//! - `FGPOLICY_ABI` – force an ABI instead of detecting it
//! - `FGPOLICY_STORE` – path of the persisted state file
//! - `FGPOLICY_LOG_JSON=1` – JSON log lines

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::DispatchMode;
use crate::layout::{Abi, BinaryLayout, LayoutError};
use crate::ports::EnvironmentPort;
use crate::rate::CounterOnDemotion;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub base_dir: PathBuf,
    pub abi: Option<String>,
    pub store_path: Option<PathBuf>,
    pub probe_timeout_ms: u64,
    /// Upper bound on synchronous waits; unbounded when absent.
    pub sync_timeout_ms: Option<u64>,
    pub direct: DirectConfig,
    pub mediated: MediatedConfig,
    pub actions: ActionsConfig,
    pub rate: RateConfig,
    pub eligibility: EligibilityConfig,
    pub engine: WorkerConfig,
    pub stabilizer: StabilizerConfig,
    pub privilege_request: PrivilegeRequestConfig,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/data/local/tmp/fgpolicy"),
            abi: None,
            store_path: None,
            probe_timeout_ms: 500,
            sync_timeout_ms: None,
            direct: DirectConfig::default(),
            mediated: MediatedConfig::default(),
            actions: ActionsConfig::default(),
            rate: RateConfig::default(),
            eligibility: EligibilityConfig::default(),
            engine: WorkerConfig::default(),
            stabilizer: StabilizerConfig::default(),
            privilege_request: PrivilegeRequestConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Broker invoked as `<broker> <broker_args..> <command string>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectConfig {
    pub broker: String,
    pub broker_args: Vec<String>,
    pub probe: Vec<String>,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            broker: "su".into(),
            broker_args: vec!["-c".into()],
            probe: vec!["id".into()],
        }
    }
}

/// Helper binary in the bin dir, invoked as `<helper> -c <command string>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediatedConfig {
    pub helper: String,
    pub probe: Vec<String>,
    /// When set, the probe also has to print this text.
    pub expect_output: Option<String>,
}

impl Default for MediatedConfig {
    fn default() -> Self {
        Self {
            helper: "shell_helper".into(),
            probe: vec!["whoami".into()],
            expect_output: None,
        }
    }
}

/// One named executable plus its arguments. `{entity}` in an argument is
/// replaced by the foreground entity id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ActionSpec {
    pub fn new(binary: &str, args: &[&str]) -> Self {
        Self {
            binary: binary.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionsConfig {
    pub primary: ActionSpec,
    pub demote: ActionSpec,
    pub discovery: ActionSpec,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            primary: ActionSpec::new("policy_cli", &["boost", "{entity}"]),
            demote: ActionSpec::new("policy_cli", &["demote"]),
            discovery: ActionSpec::new("policy_cli", &["discovery"]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    pub window_ms: u64,
    pub threshold: u64,
    pub cooldown_ms: u64,
    pub on_demotion: CounterOnDemotion,
    /// Log a milestone every this many executions; 0 disables.
    pub milestone_every: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            window_ms: 5 * 60 * 1000,
            threshold: 10,
            cooldown_ms: 60 * 60 * 1000,
            on_demotion: CounterOnDemotion::Keep,
            milestone_every: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EligibilityConfig {
    pub allow_list: Vec<String>,
    /// Privileged listing command, one entity per output line.
    pub list_command: Vec<String>,
    pub line_prefix: String,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            allow_list: [
                "com.android.launcher3",
                "com.android.settings",
                "com.android.vending",
                "com.android.chrome",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            list_command: ["cmd", "package", "list", "packages", "-3"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            line_prefix: "package:".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub idle_timeout_ms: u64,
    pub min_interval_ms: u64,
    pub demote_mode: DispatchMode,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 2 * 60 * 1000,
            min_interval_ms: 1000,
            demote_mode: DispatchMode::Async,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizerConfig {
    pub stable_ms: u64,
    pub ignore_prefixes: Vec<String>,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            stable_ms: 5_000,
            ignore_prefixes: vec!["android".into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivilegeRequestConfig {
    pub retry_max: u32,
    pub retry_delay_ms: u64,
    pub min_interval_ms: u64,
}

impl Default for PrivilegeRequestConfig {
    fn default() -> Self {
        Self {
            retry_max: 20,
            retry_delay_ms: 300,
            min_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
    pub file: Option<PathBuf>,
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: Option<String>,
}

impl EngineConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        // An empty (or comment-only) document is null, not a mapping.
        let doc: serde_yaml::Value = serde_yaml::from_str(text)?;
        let cfg: EngineConfig = if doc.is_null() {
            EngineConfig::default()
        } else {
            serde_yaml::from_value(doc)?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        tracing::debug!(path = %path.display(), "Reading config");
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg = Self::from_yaml_str(&text)?;
        tracing::info!(path = %path.display(), "Loaded config");
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self, env: &dyn EnvironmentPort) {
        if let Ok(dir) = env.get_var("FGPOLICY_BASE_DIR") {
            self.base_dir = PathBuf::from(dir);
        }
        if let Ok(abi) = env.get_var("FGPOLICY_ABI") {
            self.abi = Some(abi);
        }
        if let Ok(store) = env.get_var("FGPOLICY_STORE") {
            self.store_path = Some(PathBuf::from(store));
        }
        if env.get_var("FGPOLICY_LOG_JSON").ok().as_deref() == Some("1") {
            self.logging.json = true;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate.threshold == 0 {
            return Err(ConfigError::Invalid("rate.threshold must be at least 1".into()));
        }
        if self.rate.window_ms == 0 {
            return Err(ConfigError::Invalid("rate.window_ms must be positive".into()));
        }
        if self.direct.broker.is_empty() {
            return Err(ConfigError::Invalid("direct.broker must not be empty".into()));
        }
        if self.mediated.helper.is_empty() || self.mediated.helper.contains('/') {
            return Err(ConfigError::Invalid(
                "mediated.helper must be a bare file name inside the bin dir".into(),
            ));
        }
        if self.eligibility.list_command.is_empty() {
            return Err(ConfigError::Invalid("eligibility.list_command must not be empty".into()));
        }
        Ok(())
    }

    /// Binary layout for the configured (or detected) ABI. An architecture
    /// without shipped binaries is fatal.
    pub fn layout(&self) -> Result<BinaryLayout, ConfigError> {
        let abi = match &self.abi {
            Some(name) => name.parse::<Abi>()?,
            None => Abi::detect()?,
        };
        Ok(BinaryLayout::new(&self.base_dir, abi))
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| self.base_dir.join("state.json"))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Option<Duration> {
        self.sync_timeout_ms.map(Duration::from_millis)
    }
}
