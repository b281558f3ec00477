pub mod json_store;
pub mod memory;
pub mod process;
pub mod std_adapters;

pub use json_store::JsonFileStore;
pub use memory::{ManualClock, MemoryStore};
pub use process::TokioLauncher;
pub use std_adapters::{StdEnvAdapter, StdTimeAdapter};
