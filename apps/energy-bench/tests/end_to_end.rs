//! Drives the real `bench-worker` binary through sockets and process
//! boundaries.

use std::process::Command as ProcessCommand;
use std::time::Duration;

use energy_bench::{BenchmarkDefinition, Controller, HarnessConfig, HarnessError, LaunchSpec, TrialOutcome};
use energy_sampler::testing::ScriptedSampler;
use energy_sampler::Meter;

const WORKER: &str = env!("CARGO_BIN_EXE_bench-worker");
const CLI: &str = env!("CARGO_BIN_EXE_energy-bench");

fn config(trials: u32, warmup: u32) -> HarnessConfig {
    HarnessConfig {
        trials,
        warmup,
        connect_timeout: Duration::from_secs(5),
        ..HarnessConfig::default()
    }
}

fn worker(payload: &str, size: u64) -> LaunchSpec {
    LaunchSpec::new(WORKER)
        .arg("--payload")
        .arg(payload)
        .arg("--size")
        .arg(size.to_string())
}

#[test_timeout::tokio_timeout_test(30)]
async fn fib_worker_completes_every_trial() {
    let mut controller = Controller::new(config(3, 1), Meter::new(ScriptedSampler::available()));
    let definition = BenchmarkDefinition::new("fib", worker("fib", 15)).with_loop_iterations(2);

    let batch = controller.run_benchmark(&definition).await.expect("benchmark ran");

    assert_eq!(batch.trials.len(), 4);
    assert_eq!(batch.measured().count(), 3);
    assert!(batch.halt.is_none());
    assert_eq!(batch.worker_exit, Some(0));
    assert!(batch.into_result().is_ok());
}

#[test_timeout::tokio_timeout_test(30)]
async fn failing_payload_is_reported_and_worker_exits_non_zero() {
    let mut controller = Controller::new(config(2, 0), Meter::new(ScriptedSampler::available()));
    let definition = BenchmarkDefinition::new("fail", worker("fail", 0));

    let batch = controller.run_benchmark(&definition).await.expect("benchmark ran");

    assert_eq!(batch.trials.len(), 1);
    assert_eq!(
        batch.trials[0].outcome,
        TrialOutcome::Failed {
            reason: "worker reported a payload failure".into()
        }
    );
    assert_eq!(batch.worker_exit, Some(1));
    assert!(batch.into_result().is_err());
}

#[test_timeout::tokio_timeout_test(30)]
async fn unavailable_sampler_lets_the_worker_exit_cleanly() {
    let mut controller = Controller::new(config(2, 0), Meter::new(ScriptedSampler::unavailable()));
    let definition = BenchmarkDefinition::new("empty", worker("empty", 0));

    let batch = controller.run_benchmark(&definition).await.expect("benchmark ran");

    assert!(batch.trials.is_empty());
    assert_eq!(batch.worker_exit, Some(0));
    assert!(matches!(
        batch.into_result(),
        Err(HarnessError::MeasurementUnavailable { .. })
    ));
}

#[cfg(unix)]
#[test_timeout::tokio_timeout_test(30)]
async fn worker_exiting_before_connect_is_a_launch_failure() {
    let mut controller = Controller::new(config(1, 0), Meter::new(ScriptedSampler::available()));
    let launch = LaunchSpec::new("sh").arg("-c").arg("exit 7").arg("never-connects");
    let definition = BenchmarkDefinition::new("quitter", launch);

    let err = controller.run_benchmark(&definition).await.expect_err("no session");
    assert!(matches!(err, HarnessError::WorkerExited { .. }), "{err}");
}

#[cfg(unix)]
#[test_timeout::tokio_timeout_test(30)]
async fn worker_that_never_connects_hits_the_connect_timeout() {
    let mut controller = Controller::new(
        HarnessConfig {
            connect_timeout: Duration::from_millis(200),
            ..config(1, 0)
        },
        Meter::new(ScriptedSampler::available()),
    );
    let launch = LaunchSpec::new("sh").arg("-c").arg("sleep 30").arg("idle");
    let definition = BenchmarkDefinition::new("idle", launch);

    let err = controller.run_benchmark(&definition).await.expect_err("no session");
    assert!(matches!(err, HarnessError::Connection(_)), "{err}");
}

#[test_timeout::timeout(60)]
fn cli_exec_prints_one_json_batch() {
    let output = ProcessCommand::new(CLI)
        .args(["--trials", "2", "--warmup", "1", "--sampler", "none"])
        .args(["exec", "--name", "cli-empty", "--", WORKER, "--payload", "empty"])
        .env_remove("RUST_LOG")
        .output()
        .expect("run energy-bench");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8(output.stdout).expect("utf8 stdout");
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 1, "stdout: {stdout}");
    let batch: serde_json::Value = serde_json::from_str(lines[0]).expect("json batch");
    assert_eq!(batch["benchmark"], "cli-empty");
    assert_eq!(batch["sampler"], "none");
    assert_eq!(batch["plan"]["measured"], 2);
    assert_eq!(batch["plan"]["warmup"], 1);
    assert_eq!(batch["trials"].as_array().map(Vec::len), Some(3));
    assert_eq!(batch["trials"][2]["status"], "completed");
    assert_eq!(batch["worker_exit"], 0);
}

#[test_timeout::timeout(60)]
fn cli_exits_non_zero_when_a_batch_fails() {
    let output = ProcessCommand::new(CLI)
        .args(["--trials", "1", "--sampler", "none"])
        .args(["exec", "--", WORKER, "--payload", "fail"])
        .output()
        .expect("run energy-bench");
    assert!(!output.status.success());
}
