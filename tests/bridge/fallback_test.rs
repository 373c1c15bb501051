//! Tests for the missing-executable relaunch through the fallback candidate list.

use std::path::Path;
use std::time::Duration;

use wxbridge::supervisor::LaunchStrategy;
use wxbridge::{Bridge, ProcessState};

use crate::support::{bash_path, config_for, wait_for_state, FakeProbe, MOCK_SCRIPT};

/// Exits like a shell that could not find the interpreter on first run.
fn vanishing_runtime_script() -> String {
    format!(
        r#"
if [ ! -f first_run_done ]; then
  touch first_run_done
  sleep 0.3
  echo "sh: 1: py: command not found" >&2
  exit 127
fi
{MOCK_SCRIPT}"#
    )
}

const ALWAYS_MISSING: &str = r#"
sleep 0.3
echo "sh: 1: py: command not found" >&2
exit 127
"#;

fn alternate_bash(dir: &Path) -> String {
    let link = dir.join("altbash");
    std::os::unix::fs::symlink(bash_path(), &link).expect("should link bash");
    link.to_string_lossy().into_owned()
}

#[tokio::test]
async fn vanished_runtime_relaunches_with_fallback_candidate() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let alt = alternate_bash(tmp.path());
    let mut config = config_for(tmp.path(), &vanishing_runtime_script());
    let primary = config.runtime.candidates[0].clone();
    config.runtime.fallback_candidates = vec![primary.clone(), alt.clone()];
    let probe = FakeProbe::new(&[
        (primary.as_str(), "Python 3.12.1"),
        (alt.as_str(), "Python 3.11.4"),
    ]);

    let bridge = Bridge::with_probe(config, probe);
    let report = bridge.initialize().await;
    assert!(report.success, "initialize failed: {}", report.message);
    let mut events = bridge.subscribe();

    assert!(
        wait_for_state(&mut events, &ProcessState::Terminated, Duration::from_secs(5)).await,
        "first process should exit"
    );
    assert!(
        wait_for_state(&mut events, &ProcessState::Ready, Duration::from_secs(5)).await,
        "fallback relaunch should become ready"
    );

    let runtime = bridge.runtime().expect("relaunched runtime");
    assert_eq!(runtime.candidate.id, alt);
    let payload = bridge
        .send("get_contacts", serde_json::json!({}))
        .await
        .expect("relaunched process should answer");
    assert_eq!(payload["command"], "get_contacts");

    bridge.cleanup().await;
}

#[tokio::test]
async fn fallback_pass_runs_at_most_once() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let alt = alternate_bash(tmp.path());
    let mut config = config_for(tmp.path(), ALWAYS_MISSING);
    let primary = config.runtime.candidates[0].clone();
    config.runtime.fallback_candidates = vec![alt.clone()];
    let probe = FakeProbe::new(&[
        (primary.as_str(), "Python 3.12.1"),
        (alt.as_str(), "Python 3.12.2"),
    ]);

    let bridge = Bridge::with_probe(config, probe);
    assert!(bridge.initialize().await.success);
    let mut events = bridge.subscribe();

    assert!(wait_for_state(&mut events, &ProcessState::Ready, Duration::from_secs(5)).await);
    assert!(wait_for_state(&mut events, &ProcessState::Terminated, Duration::from_secs(5)).await);

    // No third launch.
    assert!(!wait_for_state(&mut events, &ProcessState::Detecting, Duration::from_secs(1)).await);
    assert_eq!(bridge.state(), ProcessState::Terminated);
    assert!(bridge.pid().is_none());
}

#[tokio::test]
async fn cleanup_during_exit_suppresses_relaunch() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let alt = alternate_bash(tmp.path());
    let mut config = config_for(tmp.path(), ALWAYS_MISSING);
    let primary = config.runtime.candidates[0].clone();
    config.runtime.fallback_candidates = vec![alt.clone()];
    let probe = FakeProbe::new(&[
        (primary.as_str(), "Python 3.12.1"),
        (alt.as_str(), "Python 3.12.2"),
    ]);

    let bridge = Bridge::with_probe(config, probe);
    assert!(bridge.initialize().await.success);
    bridge.cleanup().await;
    let mut events = bridge.subscribe();

    assert!(!wait_for_state(&mut events, &ProcessState::Ready, Duration::from_secs(1)).await);
    assert_eq!(bridge.state(), ProcessState::Terminated);
}

#[tokio::test]
async fn spawn_time_not_found_runs_fallback_pass() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let alt = alternate_bash(tmp.path());
    let vanished = tmp.path().join("vanished-python").to_string_lossy().into_owned();
    let mut config = config_for(tmp.path(), MOCK_SCRIPT);
    config.runtime.candidates = vec![vanished.clone()];
    config.runtime.fallback_candidates = vec![vanished.clone(), alt.clone()];
    let probe = FakeProbe::new(&[
        (vanished.as_str(), "Python 3.12.1"),
        (alt.as_str(), "Python 3.11.4"),
    ]);

    let bridge = Bridge::with_probe(config, probe);
    let report = bridge.initialize().await;
    assert!(report.success, "initialize failed: {}", report.message);
    assert_eq!(bridge.state(), ProcessState::Ready);
    assert_eq!(bridge.strategy(), Some(LaunchStrategy::DirectExec));
    assert_eq!(bridge.runtime().expect("runtime").candidate.id, alt);

    let payload = bridge
        .send("get_contacts", serde_json::json!({}))
        .await
        .expect("fallback process should answer");
    assert_eq!(payload["command"], "get_contacts");

    bridge.cleanup().await;
}

#[tokio::test]
async fn failed_spawn_time_fallback_reports_original_cause() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let vanished = tmp.path().join("vanished-python").to_string_lossy().into_owned();
    let also_gone = tmp.path().join("also-gone").to_string_lossy().into_owned();
    let mut config = config_for(tmp.path(), MOCK_SCRIPT);
    config.runtime.candidates = vec![vanished.clone()];
    config.runtime.fallback_candidates = vec![also_gone.clone()];
    let probe = FakeProbe::new(&[
        (vanished.as_str(), "Python 3.12.1"),
        (also_gone.as_str(), "Python 3.12.2"),
    ]);

    let bridge = Bridge::with_probe(config, probe);
    let report = bridge.initialize().await;
    assert!(!report.success);
    assert!(report.message.contains("direct-exec"), "got: {}", report.message);
    assert!(report.message.contains("vanished-python") || report.message.contains("No such file"));
    assert_eq!(bridge.state(), ProcessState::Terminated);
    assert!(bridge.pid().is_none());
}
