//! Execution dispatcher.
//!
//! Turns "run this executable through that channel" into a [`CommandSpec`]
//! and runs it, either on the caller (sync) or on a single background lane
//! (fire-and-forget). The lane preserves submission order and never runs two
//! launches at once.

pub mod shell;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::channel::Channel;
use crate::config::{DirectConfig, MediatedConfig};
use crate::environment::{build_direct_env, build_mediated_env};
use crate::layout::{BinaryLayout, ExecutableRef};
use crate::observability::log_dispatch;
use crate::ports::{CommandSpec, EnvPlan, EnvironmentPort, ExecError, ExecOutcome, Launcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Queue on the background lane and return immediately.
    #[default]
    Async,
    /// Wait for the child to exit.
    Sync,
}

/// Builds channel-specific invocations.
pub struct CommandBuilder {
    layout: BinaryLayout,
    direct: DirectConfig,
    mediated: MediatedConfig,
    env: Arc<dyn EnvironmentPort>,
}

impl CommandBuilder {
    pub fn new(
        layout: BinaryLayout,
        direct: DirectConfig,
        mediated: MediatedConfig,
        env: Arc<dyn EnvironmentPort>,
    ) -> Self {
        Self {
            layout,
            direct,
            mediated,
            env,
        }
    }

    pub fn layout(&self) -> &BinaryLayout {
        &self.layout
    }

    pub fn direct(&self) -> &DirectConfig {
        &self.direct
    }

    pub fn mediated(&self) -> &MediatedConfig {
        &self.mediated
    }

    /// Wrap `words` (program first) for `channel`; `None` for
    /// [`Channel::None`].
    ///
    /// Direct: `<broker> <broker_args..> '<w0>' '<w1>' ..` as one argument,
    /// constrained `PATH`, rest inherited. Mediated: `<bin>/<helper> -c
    /// '<w0>' ..`, with the sanitized environment replacing the parent's.
    pub fn build(&self, channel: Channel, words: &[String]) -> Option<CommandSpec> {
        let command = shell::join(words);
        match channel {
            Channel::Direct => {
                let mut args = self.direct.broker_args.clone();
                args.push(command);
                Some(CommandSpec {
                    program: self.direct.broker.clone(),
                    args,
                    env: EnvPlan::Inherit(build_direct_env(&self.layout)),
                })
            }
            Channel::Mediated => {
                let helper = self
                    .layout
                    .path_of(&ExecutableRef::new(self.mediated.helper.as_str()));
                Some(CommandSpec {
                    program: helper.display().to_string(),
                    args: vec!["-c".to_string(), command],
                    env: EnvPlan::Replace(build_mediated_env(&self.layout, self.env.vars())),
                })
            }
            Channel::None => None,
        }
    }

    /// Invocation of an installed executable by absolute path.
    pub fn build_installed(
        &self,
        channel: Channel,
        exe: &ExecutableRef,
        args: &[String],
    ) -> Option<CommandSpec> {
        let mut words = Vec::with_capacity(args.len() + 1);
        words.push(self.layout.path_of(exe).display().to_string());
        words.extend(args.iter().cloned());
        self.build(channel, &words)
    }
}

pub struct Dispatcher {
    builder: Arc<CommandBuilder>,
    launcher: Arc<dyn Launcher>,
    lane: mpsc::UnboundedSender<LaneItem>,
    wait_timeout: Option<Duration>,
}

struct LaneJob {
    label: String,
    channel: Channel,
    spec: CommandSpec,
}

enum LaneItem {
    Job(LaneJob),
    Barrier(oneshot::Sender<()>),
}

impl Dispatcher {
    /// Spawns the background lane on the current Tokio runtime.
    ///
    /// # Panics
    /// Outside a Tokio runtime.
    pub fn new(
        builder: Arc<CommandBuilder>,
        launcher: Arc<dyn Launcher>,
        wait_timeout: Option<Duration>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LaneItem>();
        let lane_launcher = Arc::clone(&launcher);
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    LaneItem::Job(job) => {
                        let result = lane_launcher.launch(&job.spec, wait_timeout, false).await;
                        log_dispatch(&job.label, job.channel, &result);
                    }
                    LaneItem::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Dispatch lane closed");
        });
        Self {
            builder,
            launcher,
            lane: tx,
            wait_timeout,
        }
    }

    /// Run an installed executable and wait for it, reporting the outcome.
    pub async fn run(
        &self,
        channel: Channel,
        exe: &ExecutableRef,
        args: &[String],
    ) -> Result<ExecOutcome, ExecError> {
        let spec = self.prepare(channel, exe, args)?;
        let result = self.launcher.launch(&spec, self.wait_timeout, false).await;
        log_dispatch(exe.name(), channel, &result);
        result
    }

    /// Run an arbitrary command (program resolved by the privileged side)
    /// and capture its stdout.
    pub async fn capture(
        &self,
        channel: Channel,
        words: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecOutcome, ExecError> {
        let spec = self.builder.build(channel, words).ok_or(ExecError::NoChannel)?;
        self.launcher.launch(&spec, timeout, true).await
    }

    /// Queue an installed executable on the background lane. Returns once
    /// queued; the outcome is only logged.
    pub fn submit(&self, channel: Channel, exe: &ExecutableRef, args: &[String]) {
        let spec = match self.prepare(channel, exe, args) {
            Ok(spec) => spec,
            Err(e) => {
                log_dispatch(exe.name(), channel, &Err(e));
                return;
            }
        };
        let job = LaneJob {
            label: exe.name().to_string(),
            channel,
            spec,
        };
        if self.lane.send(LaneItem::Job(job)).is_err() {
            debug!(action = %exe, "Dispatch lane gone, dropping job");
        }
    }

    /// Wait until every job submitted before this call has finished.
    pub async fn drain(&self) {
        let (tx, rx) = oneshot::channel();
        if self.lane.send(LaneItem::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Best-effort execution: never fails, returns nothing.
    pub async fn exec(
        &self,
        channel: Channel,
        exe: &ExecutableRef,
        args: &[String],
        mode: DispatchMode,
    ) {
        match mode {
            DispatchMode::Async => self.submit(channel, exe, args),
            DispatchMode::Sync => {
                let _ = self.run(channel, exe, args).await;
            }
        }
    }

    fn prepare(
        &self,
        channel: Channel,
        exe: &ExecutableRef,
        args: &[String],
    ) -> Result<CommandSpec, ExecError> {
        if !channel.is_privileged() {
            return Err(ExecError::NoChannel);
        }
        if !self.builder.layout().is_runnable(exe) {
            return Err(ExecError::Missing(
                self.builder.layout().path_of(exe).display().to_string(),
            ));
        }
        self.builder
            .build_installed(channel, exe, args)
            .ok_or(ExecError::NoChannel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Abi;
    use crate::ports::env::EnvError;
    use std::sync::Mutex;

    struct FixedEnv;

    impl EnvironmentPort for FixedEnv {
        fn get_var(&self, key: &str) -> Result<String, EnvError> {
            Err(EnvError::NotFound(key.to_string()))
        }
        fn vars(&self) -> Vec<(String, String)> {
            vec![
                ("PATH".into(), "/usr/bin".into()),
                ("CLASSPATH".into(), "/x.apk".into()),
            ]
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<CommandSpec>>,
    }

    #[async_trait::async_trait]
    impl Launcher for Recorder {
        async fn launch(
            &self,
            spec: &CommandSpec,
            _timeout: Option<Duration>,
            _capture: bool,
        ) -> Result<ExecOutcome, ExecError> {
            self.seen.lock().unwrap().push(spec.clone());
            Ok(ExecOutcome {
                exit_code: Some(0),
                stdout: String::new(),
            })
        }
    }

    fn builder(base: &std::path::Path) -> Arc<CommandBuilder> {
        Arc::new(CommandBuilder::new(
            BinaryLayout::new(base, Abi::Arm64V8a),
            DirectConfig::default(),
            MediatedConfig::default(),
            Arc::new(FixedEnv),
        ))
    }

    fn words(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn direct_wraps_command_for_broker() {
        let b = builder(std::path::Path::new("/data/app"));
        let spec = b
            .build_installed(
                Channel::Direct,
                &ExecutableRef::new("policy_cli"),
                &words(&["boost", "com.example"]),
            )
            .unwrap();
        assert_eq!(spec.program, "su");
        assert_eq!(
            spec.args,
            words(&["-c", "'/data/app/bin/policy_cli' 'boost' 'com.example'"])
        );
        match spec.env {
            EnvPlan::Inherit(vars) => {
                assert_eq!(vars["PATH"], "/data/app/bin:/system/bin:/system/xbin")
            }
            other => panic!("unexpected env plan {other:?}"),
        }
    }

    #[test]
    fn mediated_uses_helper_and_sanitized_env() {
        let b = builder(std::path::Path::new("/data/app"));
        let spec = b.build(Channel::Mediated, &words(&["whoami"])).unwrap();
        assert_eq!(spec.program, "/data/app/bin/shell_helper");
        assert_eq!(spec.args, words(&["-c", "'whoami'"]));
        match spec.env {
            EnvPlan::Replace(vars) => {
                assert!(!vars.contains_key("CLASSPATH"));
                assert_eq!(vars["PATH"], "/data/app/bin:/usr/bin");
            }
            other => panic!("unexpected env plan {other:?}"),
        }
    }

    #[test]
    fn none_channel_builds_nothing() {
        let b = builder(std::path::Path::new("/data/app"));
        assert!(b.build(Channel::None, &words(&["id"])).is_none());
    }

    #[tokio::test]
    async fn run_refuses_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let rec = Arc::new(Recorder::default());
        let d = Dispatcher::new(builder(dir.path()), rec.clone(), None);
        let err = d
            .run(Channel::Direct, &ExecutableRef::new("absent"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Missing(_)));
        assert!(rec.seen.lock().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn submit_runs_on_lane_in_order() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let b = builder(dir.path());
        std::fs::create_dir_all(b.layout().bin_dir()).unwrap();
        let exe = ExecutableRef::new("policy_cli");
        let path = b.layout().path_of(&exe);
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let rec = Arc::new(Recorder::default());
        let d = Dispatcher::new(b, rec.clone(), None);
        d.submit(Channel::Direct, &exe, &words(&["one"]));
        d.exec(Channel::Direct, &exe, &words(&["two"]), DispatchMode::Async)
            .await;
        d.submit(Channel::None, &exe, &words(&["never"]));

        d.drain().await;
        let seen = rec.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].args[1].ends_with("'one'"));
        assert!(seen[1].args[1].ends_with("'two'"));
    }
}
