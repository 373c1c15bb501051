//! Tests for `src/supervisor/mod.rs`: strategy fallback against real bash children.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use wxbridge::runtime::Invocation;
use wxbridge::supervisor::{
    LaunchError, LaunchRequest, LaunchStrategy, OutputMode, Supervisor,
};

const ECHO_SCRIPT: &str = r#"
echo "[INFO] started with PYTHONIOENCODING=$PYTHONIOENCODING"
while IFS= read -r line; do
  echo "RESPONSE:{\"id\":\"1\",\"echo\":true}"
done
"#;

fn bash() -> Invocation {
    let program = if Path::new("/bin/bash").exists() {
        PathBuf::from("/bin/bash")
    } else {
        PathBuf::from("/usr/bin/bash")
    };
    Invocation::Executable {
        program,
        args: Vec::new(),
    }
}

fn write_script(dir: &Path) -> PathBuf {
    let script = dir.join("wxauto_bridge.sh");
    std::fs::write(&script, ECHO_SCRIPT).expect("should write mock script");
    script
}

fn request<'a>(
    runtime: &'a Invocation,
    script: &'a Path,
    work_dir: &'a Path,
    env: &'a HashMap<String, String>,
) -> LaunchRequest<'a> {
    LaunchRequest {
        runtime,
        script,
        work_dir,
        launcher: "launch.sh",
        env,
    }
}

#[tokio::test]
async fn missing_launcher_falls_back_to_direct_exec() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let script = write_script(tmp.path());
    let runtime = bash();
    let env = HashMap::new();

    let supervisor = Supervisor::new(vec![
        LaunchStrategy::IndirectLauncher,
        LaunchStrategy::DirectExec,
    ]);
    let mut attempted = Vec::new();
    let mut handle = supervisor
        .launch(&request(&runtime, &script, tmp.path(), &env), |s| {
            attempted.push(s);
        })
        .await
        .expect("direct exec should start");

    assert_eq!(
        attempted,
        vec![LaunchStrategy::IndirectLauncher, LaunchStrategy::DirectExec]
    );
    assert_eq!(handle.strategy, LaunchStrategy::DirectExec);
    assert_eq!(handle.output, OutputMode::Streaming);
    assert!(handle.pid().is_some());

    let mut lines = BufReader::new(&mut handle.stdout).lines();
    let first = lines
        .next_line()
        .await
        .expect("read stdout")
        .expect("startup line");
    assert_eq!(first, "[INFO] started with PYTHONIOENCODING=utf-8");

    handle
        .stdin
        .write_all(b"{\"id\":\"1\",\"command\":\"ping\",\"params\":{}}\n")
        .await
        .expect("write command");
    let reply = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("reply in time")
        .expect("read stdout")
        .expect("reply line");
    assert!(reply.starts_with("RESPONSE:"));

    handle.child.kill().await.expect("kill child");
}

#[tokio::test]
async fn present_launcher_is_used_first() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let script = write_script(tmp.path());
    std::fs::write(tmp.path().join("launch.sh"), "exec \"$@\"\n").expect("write launcher");
    let runtime = bash();
    let env = HashMap::from([("WXBRIDGE_MARK".to_owned(), "via-launcher".to_owned())]);

    let supervisor = Supervisor::new(vec![
        LaunchStrategy::IndirectLauncher,
        LaunchStrategy::DirectExec,
    ]);
    let mut handle = supervisor
        .launch(&request(&runtime, &script, tmp.path(), &env), |_| {})
        .await
        .expect("launcher should start");
    assert_eq!(handle.strategy, LaunchStrategy::IndirectLauncher);

    handle.child.kill().await.expect("kill child");
}

#[tokio::test]
async fn buffered_strategy_delivers_output_at_exit() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let script = write_script(tmp.path());
    let runtime = bash();
    let env = HashMap::new();

    let supervisor = Supervisor::new(vec![LaunchStrategy::ExecBuffered]);
    let handle = supervisor
        .launch(&request(&runtime, &script, tmp.path(), &env), |_| {})
        .await
        .expect("buffered exec should start");
    assert_eq!(handle.output, OutputMode::Buffered);

    let mut stdin = handle.stdin;
    let mut stdout = handle.stdout;
    let mut child = handle.child;
    stdin.write_all(b"{}\n").await.expect("write command");
    drop(stdin);

    let mut all = String::new();
    tokio::time::timeout(Duration::from_secs(5), stdout.read_to_string(&mut all))
        .await
        .expect("output in time")
        .expect("read stdout");
    assert!(all.contains("RESPONSE:{\"id\":\"1\""), "got: {all}");
    let status = child.wait().await.expect("wait child");
    assert!(status.success());
}

#[tokio::test]
async fn every_strategy_failing_reports_each_cause() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let script = write_script(tmp.path());
    let runtime = Invocation::Executable {
        program: tmp.path().join("no-such-python"),
        args: Vec::new(),
    };
    let env = HashMap::new();

    let supervisor = Supervisor::new(vec![
        LaunchStrategy::IndirectLauncher,
        LaunchStrategy::DirectExec,
    ]);
    let err = supervisor
        .launch(&request(&runtime, &script, tmp.path(), &env), |_| {})
        .await
        .expect_err("nothing can start");

    let causes = match err {
        LaunchError::LaunchFailed { causes } => causes,
        other => panic!("expected LaunchFailed, got {other:?}"),
    };
    assert_eq!(causes.len(), 2);
    assert_eq!(causes[0].strategy, LaunchStrategy::IndirectLauncher);
    assert!(causes[0].not_found);
    assert_eq!(causes[1].strategy, LaunchStrategy::DirectExec);
    assert!(causes[1].not_found, "spawn of a missing program: {}", causes[1].cause);
}

#[tokio::test]
async fn missing_script_is_reported_before_any_attempt() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let script = tmp.path().join("absent.py");
    let runtime = bash();
    let env = HashMap::new();

    let supervisor = Supervisor::new(vec![LaunchStrategy::DirectExec]);
    let mut attempted = 0_u32;
    let err = supervisor
        .launch(&request(&runtime, &script, tmp.path(), &env), |_| {
            attempted = attempted.saturating_add(1);
        })
        .await
        .expect_err("script is missing");
    assert!(matches!(err, LaunchError::MissingScript(ref p) if p == &script));
    assert_eq!(attempted, 0);
}
