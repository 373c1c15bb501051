//! CLI contract tests.

use assert_cmd::Command;

fn wxbridge() -> Command {
    Command::cargo_bin("wxbridge").expect("binary should build")
}

#[test]
fn help_lists_subcommands() {
    let output = wxbridge().arg("--help").output().expect("should run");
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("detect"));
    assert!(text.contains("call"));
    assert!(text.contains("repl"));
    assert!(text.contains("--config"));
}

#[test]
fn call_requires_a_command_name() {
    wxbridge().arg("call").assert().failure();
}

#[test]
fn call_rejects_invalid_params_before_starting() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let output = wxbridge()
        .args(["call", "get_contacts", "--params", "{not json"])
        .arg("--config")
        .arg(tmp.path().join("bridge.toml"))
        .output()
        .expect("should run");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid JSON params"), "stderr: {stderr}");
}

#[test]
fn malformed_config_is_reported() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("bridge.toml");
    std::fs::write(&path, "[commands]\ntimeout_secs = \"soon\"\n").expect("write config");
    let output = wxbridge()
        .arg("detect")
        .arg("--config")
        .arg(&path)
        .output()
        .expect("should run");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to load"), "stderr: {stderr}");
}

/// Bash stands in for the interpreter; it never answers `silent`.
#[cfg(unix)]
const SILENT_SCRIPT: &str = r#"
echo "[INFO] repl mock started"
while IFS= read -r line; do
  :
done
"#;

#[cfg(unix)]
#[test]
fn repl_interrupt_during_pending_command_exits_promptly() {
    use std::io::Write;
    use std::process::Stdio;
    use std::time::Duration;

    let tmp = tempfile::tempdir().expect("should create temp dir");
    let bash = if std::path::Path::new("/bin/bash").exists() {
        "/bin/bash"
    } else {
        "/usr/bin/bash"
    };
    let script = tmp.path().join("wxauto_bridge.sh");
    std::fs::write(&script, SILENT_SCRIPT).expect("write mock script");
    let config = tmp.path().join("bridge.toml");
    std::fs::write(
        &config,
        format!(
            r#"
[runtime]
candidates = ["{bash}"]
fallback_candidates = []
override_file = "{override_file}"

[runtime.policy]
minimum = "1.0"
preferred = "5.2"
reject_from = "99.0"

[launch]
script = "{script}"
strategies = ["direct"]

[commands]
timeout_secs = 120
"#,
            override_file = tmp.path().join("runtime.json").display(),
            script = script.display(),
        ),
    )
    .expect("write config");

    let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin("wxbridge"))
        .arg("--config")
        .arg(&config)
        .arg("repl")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("should start repl");
    let mut stdin = child.stdin.take().expect("stdin piped");
    stdin.write_all(b"silent\n").expect("write command");
    stdin.flush().expect("flush command");

    // Give the bridge time to start and send the command.
    std::thread::sleep(Duration::from_secs(2));
    let status = std::process::Command::new("kill")
        .arg("-INT")
        .arg(child.id().to_string())
        .status()
        .expect("kill should run");
    assert!(status.success());

    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(child.wait_with_output());
    });
    let output = rx
        .recv_timeout(Duration::from_secs(15))
        .expect("repl should exit well before the command timeout")
        .expect("should collect output");
    drop(stdin);

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("interrupted"), "stderr: {stderr}");
}
