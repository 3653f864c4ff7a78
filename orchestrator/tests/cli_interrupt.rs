//! CLI test for Ctrl-C during `orchestrator run`.
//!
//! Spawns the binary with a model command that never finishes, interrupts it once
//! research has started and verifies the run unwinds through its checkpoints.
#![cfg(unix)]

use std::fs;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use orchestrator::exit_codes;
use orchestrator::io::checkpoint::CheckpointManager;
use orchestrator::test_support::TestProject;

#[test]
fn interrupt_cancels_run_and_keeps_checkpoints() {
    let mut config = TestProject::new().expect("defaults").config().clone();
    config.model.command = vec!["sh".into(), "-c".into(), "sleep 30".into()];
    let project = TestProject::with_config(config).expect("project");

    let child = Command::new(env!("CARGO_BIN_EXE_orchestrator"))
        .arg("run")
        .arg(project.root())
        .args(["--mode", "autonomous", "--goal", "Add a markdown parser"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn orchestrator");

    // Research has started once its first checkpoint exists.
    let checkpoints_dir = project.paths().checkpoints_dir.clone();
    let deadline = Instant::now() + Duration::from_secs(20);
    while fs::read_dir(&checkpoints_dir).map_or(0, Iterator::count) == 0 {
        assert!(Instant::now() < deadline, "research never started");
        thread::sleep(Duration::from_millis(50));
    }
    thread::sleep(Duration::from_millis(200));

    let started = Instant::now();
    let kill = Command::new("kill")
        .args(["-INT", &child.id().to_string()])
        .status()
        .expect("kill");
    assert!(kill.success());
    let output = child.wait_with_output().expect("wait");

    assert!(started.elapsed() < Duration::from_secs(10), "model call was not cut short");
    assert_eq!(output.status.code(), Some(exit_codes::PAUSED));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("cancelled before decomposition"), "{stdout}");

    let newest = CheckpointManager::new(project.root())
        .expect("manager")
        .detect_resumable_checkpoint()
        .expect("detect")
        .expect("checkpoint");
    assert_eq!(newest.checkpoint.phase, "decomposition-pending");
}
