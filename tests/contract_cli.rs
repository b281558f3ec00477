//! Contract tests for the `fgpolicy` command-line interface.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

fn fgpolicy() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_fgpolicy"));
    cmd.env_remove("RUST_LOG")
        .env_remove("FGPOLICY_BASE_DIR")
        .env_remove("FGPOLICY_STORE")
        .env_remove("FGPOLICY_ABI");
    cmd
}

fn write_config(dir: &Path, broker: &str) -> std::path::PathBuf {
    let path = dir.join("fgpolicy.yml");
    let yaml = format!(
        "base_dir: {base}\nabi: arm64-v8a\nstore_path: {base}/state.json\ndirect:\n  broker: {broker}\n  probe: [\"true\"]\nlogging:\n  level: warn\n",
        base = dir.display(),
    );
    std::fs::write(&path, yaml).unwrap();
    path
}

fn status(config: &Path) -> serde_json::Value {
    let out = fgpolicy()
        .args(["--config", config.to_str().unwrap(), "status"])
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    serde_json::from_slice(&out.stdout).unwrap()
}

#[test]
fn help_lists_subcommands() {
    let out = fgpolicy().arg("--help").output().unwrap();
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    for sub in ["run", "resolve", "discover", "status"] {
        assert!(stdout.contains(sub), "missing {sub} in {stdout}");
    }
}

#[test]
fn status_on_fresh_store_reports_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "/nonexistent/su");
    let value = status(&config);
    assert_eq!(value["rate"]["total_executions"], 0);
    assert_eq!(value["rate"]["count_in_window"], 0);
    assert_eq!(value["discovery"]["done"], false);
    assert!(value["discovery"]["at"].is_null());
}

#[test]
fn missing_config_file_fails() {
    let out = fgpolicy()
        .args(["--config", "/nonexistent/fgpolicy.yml", "status"])
        .output()
        .unwrap();
    assert!(!out.status.success());
}

#[test]
fn invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.yml");
    std::fs::write(&path, "rate:\n  threshold: 0\n").unwrap();
    let out = fgpolicy()
        .args(["--config", path.to_str().unwrap(), "status"])
        .output()
        .unwrap();
    assert!(!out.status.success());
}

#[test]
fn resolve_without_any_channel_prints_none() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "/nonexistent/su");
    let out = fgpolicy()
        .args(["--config", config.to_str().unwrap(), "resolve"])
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "none");
}

#[cfg(unix)]
fn install(dir: &Path, rel: &str, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[cfg(unix)]
fn run_raw(config: &Path, input: &str) -> Output {
    let mut child = fgpolicy()
        .args(["--config", config.to_str().unwrap(), "run", "--raw"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(input.as_bytes())
        .unwrap();
    child.wait_with_output().unwrap()
}

#[cfg(unix)]
#[test]
fn run_dispatches_and_persists_state() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("actions.log");
    install(dir.path(), "su", "#!/bin/sh\nexec /bin/sh \"$@\"\n");
    install(
        dir.path(),
        "bin/policy_cli",
        &format!("#!/bin/sh\necho \"$*\" >> '{}'\n", log.display()),
    );
    let broker = dir.path().join("su");
    let config = write_config(dir.path(), broker.to_str().unwrap());

    let out = run_raw(&config, "com.android.settings\ncom.android.settings\n\n");
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let value = status(&config);
    assert_eq!(value["rate"]["total_executions"], 1);
    let actions = std::fs::read_to_string(&log).unwrap();
    assert_eq!(actions.trim(), "boost com.android.settings");

    // counters continue from the persisted state
    let out = run_raw(&config, "com.android.vending\n");
    assert!(out.status.success());
    assert_eq!(status(&config)["rate"]["total_executions"], 2);
}

#[cfg(unix)]
#[test]
fn discover_marks_flag_once() {
    let dir = tempfile::tempdir().unwrap();
    install(dir.path(), "su", "#!/bin/sh\nexec /bin/sh \"$@\"\n");
    install(dir.path(), "bin/policy_cli", "#!/bin/sh\nexit 0\n");
    let broker = dir.path().join("su");
    let config = write_config(dir.path(), broker.to_str().unwrap());

    let out = fgpolicy()
        .args(["--config", config.to_str().unwrap(), "discover"])
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let value: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(value["channel"], "direct");
    assert_eq!(value["dispatched"], true);
    assert_eq!(value["done"], true);

    let after = status(&config);
    assert_eq!(after["discovery"]["done"], true);
    assert!(after["discovery"]["at"].is_u64());

    let again = fgpolicy()
        .args(["--config", config.to_str().unwrap(), "discover"])
        .output()
        .unwrap();
    assert!(again.status.success());
    let value: serde_json::Value = serde_json::from_slice(&again.stdout).unwrap();
    assert_eq!(value["dispatched"], false);
    assert_eq!(value["done"], true);
}
