//! Shared fixtures for engine-level tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use foreground_policy::adapters::{ManualClock, MemoryStore};
use foreground_policy::config::EngineConfig;
use foreground_policy::ports::env::EnvError;
use foreground_policy::ports::{
    CommandSpec, EnvironmentPort, ExecError, ExecOutcome, KeyValueStore, Launcher,
};
use foreground_policy::EngineDeps;

pub const T0: u64 = 1_700_000_000_000;

pub const LISTING: &str = "package:com.example.a\npackage:com.example.b\npackage:com.example.c\n";

/// Launcher that never starts a process. Probes and listings are answered
/// from its switches; every other command succeeds.
pub struct FakeLauncher {
    pub direct_ok: AtomicBool,
    pub mediated_ok: AtomicBool,
    /// Direct probes fail while this is above zero, counting down.
    pub direct_fails_left: AtomicU64,
    pub listing: Mutex<String>,
    /// The next command containing this text panics instead of returning.
    pub panic_once_on: Mutex<Option<String>>,
    pub seen: Mutex<Vec<CommandSpec>>,
}

impl FakeLauncher {
    pub fn new(direct_ok: bool, mediated_ok: bool) -> Arc<Self> {
        Arc::new(Self {
            direct_ok: AtomicBool::new(direct_ok),
            mediated_ok: AtomicBool::new(mediated_ok),
            direct_fails_left: AtomicU64::new(0),
            listing: Mutex::new(LISTING.to_string()),
            panic_once_on: Mutex::new(None),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Command strings (the quoted argument handed to broker or helper).
    pub fn commands(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| s.args.last().cloned())
            .collect()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(needle)).count()
    }

    /// Poll until `count_containing(needle) >= n` (background lane).
    pub async fn wait_for(&self, needle: &str, n: usize) -> usize {
        for _ in 0..200 {
            let count = self.count_containing(needle);
            if count >= n {
                return count;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.count_containing(needle)
    }
}

fn status(ok: bool) -> ExecOutcome {
    ExecOutcome {
        exit_code: Some(if ok { 0 } else { 1 }),
        stdout: String::new(),
    }
}

#[async_trait::async_trait]
impl Launcher for FakeLauncher {
    async fn launch(
        &self,
        spec: &CommandSpec,
        _timeout: Option<Duration>,
        _capture_stdout: bool,
    ) -> Result<ExecOutcome, ExecError> {
        self.seen.lock().unwrap().push(spec.clone());
        let command = spec.args.last().cloned().unwrap_or_default();
        let direct = spec.program == "su";

        let armed = {
            let mut trigger = self.panic_once_on.lock().unwrap();
            match trigger.as_deref() {
                Some(needle) if command.contains(needle) => trigger.take(),
                _ => None,
            }
        };
        if let Some(needle) = armed {
            panic!("launcher blew up on {needle}");
        }

        if command == "'id'" || command == "'whoami'" {
            let ok = if direct {
                let left = self.direct_fails_left.load(Ordering::SeqCst);
                if left > 0 {
                    self.direct_fails_left.store(left - 1, Ordering::SeqCst);
                    false
                } else {
                    self.direct_ok.load(Ordering::SeqCst)
                }
            } else {
                self.mediated_ok.load(Ordering::SeqCst)
            };
            if !ok && direct {
                return Err(ExecError::Timeout {
                    program: spec.program.clone(),
                    timeout_ms: 500,
                });
            }
            return Ok(status(ok));
        }
        if command.contains("'list'") {
            return Ok(ExecOutcome {
                exit_code: Some(0),
                stdout: self.listing.lock().unwrap().clone(),
            });
        }
        Ok(status(true))
    }
}

pub struct NoEnv;

impl EnvironmentPort for NoEnv {
    fn get_var(&self, key: &str) -> Result<String, EnvError> {
        Err(EnvError::NotFound(key.to_string()))
    }
    fn vars(&self) -> Vec<(String, String)> {
        vec![("PATH".into(), "/usr/bin".into())]
    }
}

/// Config rooted at `base` with the default binaries installed.
pub fn config_in(base: &Path) -> EngineConfig {
    let cfg = EngineConfig {
        base_dir: base.to_path_buf(),
        abi: Some("arm64-v8a".into()),
        ..EngineConfig::default()
    };
    install(base, &["policy_cli", "shell_helper"]);
    cfg
}

pub fn install(base: &Path, names: &[&str]) {
    let bin = base.join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    for name in names {
        let path = bin.join(name);
        std::fs::write(&path, b"#!/bin/sh\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }
}

pub fn deps(
    launcher: Arc<FakeLauncher>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<ManualClock>,
) -> EngineDeps {
    EngineDeps {
        launcher,
        env: Arc::new(NoEnv),
        store,
        clock,
    }
}

pub fn memory() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(T0))
}
