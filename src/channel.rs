use std::fmt;

use serde::{Deserialize, Serialize};

/// Privileged execution capability currently usable by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Broker command (e.g. `su`) wrapping the target.
    Direct,
    /// Local helper binary with a sanitized environment.
    Mediated,
    None,
}

impl Channel {
    pub fn is_privileged(&self) -> bool {
        !matches!(self, Channel::None)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Direct => "direct",
            Channel::Mediated => "mediated",
            Channel::None => "none",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
