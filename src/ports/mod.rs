pub mod env;
pub mod launcher;
pub mod store;
pub mod time;

pub use env::EnvironmentPort;
pub use launcher::{CommandSpec, EnvPlan, ExecError, ExecOutcome, Launcher};
pub use store::{KeyValueStore, StoreError};
pub use time::TimePort;
