use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

/// How the child environment is derived from the parent's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvPlan {
    /// Inherit everything, overriding the listed variables.
    Inherit(BTreeMap<String, String>),
    /// Start from an empty environment and set exactly these variables.
    Replace(BTreeMap<String, String>),
}

/// A fully built process invocation. Arguments are passed as a vector;
/// nothing here is interpreted by a local shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: EnvPlan,
}

impl CommandSpec {
    /// Program and arguments joined for log lines.
    pub fn display_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutcome {
    /// `None` when the child was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Captured stdout; empty unless capture was requested.
    pub stdout: String,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {timeout_ms} ms")]
    Timeout { program: String, timeout_ms: u64 },
    #[error("I/O error while waiting for {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("executable not available: {0}")]
    Missing(String),
    #[error("no privileged channel available")]
    NoChannel,
}

/// Process launching seam.
///
/// `timeout` bounds the whole run; on expiry the implementation must kill
/// the child before returning [`ExecError::Timeout`].
#[async_trait::async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(
        &self,
        spec: &CommandSpec,
        timeout: Option<Duration>,
        capture_stdout: bool,
    ) -> Result<ExecOutcome, ExecError>;
}
