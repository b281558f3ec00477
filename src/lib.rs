pub mod ports;

pub mod adapters;

pub mod channel;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod eligibility;
pub mod engine;
pub mod environment;
pub mod layout;
pub mod observability;
pub mod rate;
pub mod resolver;
pub mod stabilizer;

pub use channel::Channel;
pub use config::EngineConfig;
pub use engine::{Decision, EngineDeps, PolicyEngine, PrivilegeGrant};
pub use stabilizer::ForegroundStabilizer;
