//! Worker side of a session: the loop that runs inside a benchmark process.
//!
//! ```text
//! connect -> { send Ready; receive; Go => run payload; send Done } -> close
//! ```
//!
//! The worker never knows how many trials the controller wants. Anything
//! other than `Go` after a `Ready` ends the loop: a clean close or an
//! explicit `Error` is an orderly finish.

use std::process::ExitCode;
use std::time::Duration;

use clap::Args;
use harness_proto::{Command, ProtocolError, Role, SessionPhase};
use tracing::{debug, error, info, warn};
use transport_ipc::{connect, Endpoint, Session};

use crate::error::HarnessError;
use crate::telemetry::init_tracing;

/// Body of a benchmark. Called `loop_iterations` times per trial on the
/// blocking pool.
pub trait Payload: Send + 'static {
    fn run_once(&mut self) -> anyhow::Result<()>;
}

impl<F> Payload for F
where
    F: FnMut() -> anyhow::Result<()> + Send + 'static,
{
    fn run_once(&mut self) -> anyhow::Result<()> {
        self()
    }
}

/// How an orderly worker run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The controller closed the session instead of answering `Ready`.
    Closed,
    /// The controller answered `Ready` with `Error`.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    /// Completed Go/Done cycles.
    pub cycles: u64,
    pub termination: Termination,
}

pub struct Worker {
    session: Session,
    loop_iterations: u32,
}

impl Worker {
    pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self, HarnessError> {
        let session = connect(endpoint, Role::Worker, timeout)
            .await
            .map_err(HarnessError::Connection)?;
        Ok(Self::from_session(session))
    }

    pub fn from_session(session: Session) -> Self {
        Self {
            session,
            loop_iterations: 1,
        }
    }

    pub fn with_loop_iterations(mut self, loop_iterations: u32) -> Self {
        self.loop_iterations = loop_iterations.max(1);
        self
    }

    /// Serves trials until the controller stops answering `Ready` with `Go`.
    /// The session is closed on every path.
    pub async fn run<P: Payload>(mut self, payload: P) -> Result<WorkerReport, HarnessError> {
        let outcome = self.serve(payload).await;
        if let Err(err) = self.session.close().await {
            debug!(error = %err, "closing worker session");
        }
        outcome
    }

    async fn serve<P: Payload>(&mut self, mut payload: P) -> Result<WorkerReport, HarnessError> {
        let mut cycles = 0u64;
        loop {
            if let Err(err) = self.session.send(Command::Ready).await {
                // The controller may hang up without reading the last Ready.
                if cycles > 0 && err.is_disconnect() {
                    debug!(cycles, "controller hung up after the last trial");
                    return Ok(WorkerReport {
                        cycles,
                        termination: Termination::Closed,
                    });
                }
                return Err(err.into());
            }

            match self.session.receive().await? {
                Some(Command::Go) => {}
                Some(Command::Error) => {
                    info!(cycles, "controller aborted the session");
                    return Ok(WorkerReport {
                        cycles,
                        termination: Termination::Aborted,
                    });
                }
                Some(other) => {
                    return Err(ProtocolError::OutOfSequence {
                        sender: Role::Controller,
                        command: other,
                        phase: SessionPhase::AwaitingGo,
                    }
                    .into());
                }
                None => {
                    debug!(cycles, "controller closed the session");
                    return Ok(WorkerReport {
                        cycles,
                        termination: Termination::Closed,
                    });
                }
            }

            let (returned, result) = execute(payload, self.loop_iterations).await?;
            payload = returned;
            match result {
                Ok(()) => {
                    self.session.send(Command::Done).await?;
                    cycles += 1;
                }
                Err(err) => {
                    if let Err(send_err) = self.session.send(Command::Error).await {
                        warn!(error = %send_err, "could not report payload failure");
                    }
                    return Err(HarnessError::Payload(err));
                }
            }
        }
    }
}

async fn execute<P: Payload>(
    mut payload: P,
    loop_iterations: u32,
) -> Result<(P, anyhow::Result<()>), HarnessError> {
    tokio::task::spawn_blocking(move || {
        let result = (0..loop_iterations).try_for_each(|_| payload.run_once());
        (payload, result)
    })
    .await
    .map_err(|err| HarnessError::Payload(anyhow::anyhow!("payload task failed: {err}")))
}

/// Command line every worker binary accepts.
#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Controller endpoint handed over by the launcher.
    pub endpoint: Endpoint,

    /// Payload executions per trial.
    #[arg(
        long,
        env = "ENERGY_BENCH_LOOP_ITERATIONS",
        default_value_t = 1,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub loop_iterations: u32,

    /// How long to keep retrying the controller endpoint.
    #[arg(long, env = "ENERGY_BENCH_CONNECT_TIMEOUT_MS", default_value_t = 10_000)]
    pub connect_timeout_ms: u64,
}

/// Entry point for a worker binary whose only argument is the endpoint.
pub fn main_with<P: Payload>(payload: P) -> ExitCode {
    #[derive(clap::Parser)]
    struct Cli {
        #[command(flatten)]
        worker: WorkerArgs,
    }

    let cli = <Cli as clap::Parser>::parse();
    run_with_args(cli.worker, payload)
}

/// Runs a worker to completion. Exit code 0 on orderly termination, 1 on
/// any failure.
pub fn run_with_args<P: Payload>(args: WorkerArgs, payload: P) -> ExitCode {
    init_tracing(&std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()));

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to start worker runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        let timeout = Duration::from_millis(args.connect_timeout_ms);
        Worker::connect(&args.endpoint, timeout)
            .await?
            .with_loop_iterations(args.loop_iterations)
            .run(payload)
            .await
    });

    match result {
        Ok(report) => {
            info!(cycles = report.cycles, termination = ?report.termination, "worker finished");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "worker failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn noop() -> anyhow::Result<()> {
        Ok(())
    }

    #[tokio::test]
    async fn runs_payload_loop_iterations_times_per_go() {
        let (mut controller, worker) = Session::in_memory_pair();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let worker = tokio::spawn(
            Worker::from_session(worker)
                .with_loop_iterations(4)
                .run(move || -> anyhow::Result<()> {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
        );

        for _ in 0..2 {
            assert_eq!(controller.receive().await.expect("ready"), Some(Command::Ready));
            controller.send(Command::Go).await.expect("go");
            assert_eq!(controller.receive().await.expect("done"), Some(Command::Done));
        }
        assert_eq!(controller.receive().await.expect("ready"), Some(Command::Ready));
        controller.close().await.expect("close");

        let report = worker.await.expect("join").expect("worker");
        assert_eq!(report.cycles, 2);
        assert_eq!(report.termination, Termination::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn controller_error_is_an_orderly_abort() {
        let (mut controller, worker) = Session::in_memory_pair();
        let worker = tokio::spawn(Worker::from_session(worker).run(noop));

        assert_eq!(controller.receive().await.expect("ready"), Some(Command::Ready));
        controller.send(Command::Error).await.expect("abort");

        let report = worker.await.expect("join").expect("worker");
        assert_eq!(report.cycles, 0);
        assert_eq!(report.termination, Termination::Aborted);
    }

    #[tokio::test]
    async fn payload_failure_is_reported_as_error() {
        let (mut controller, worker) = Session::in_memory_pair();
        let worker = tokio::spawn(
            Worker::from_session(worker).run(|| -> anyhow::Result<()> { anyhow::bail!("checksum mismatch") }),
        );

        assert_eq!(controller.receive().await.expect("ready"), Some(Command::Ready));
        controller.send(Command::Go).await.expect("go");
        assert_eq!(controller.receive().await.expect("error"), Some(Command::Error));
        assert_eq!(controller.phase(), SessionPhase::Terminated);

        let err = worker.await.expect("join").expect_err("payload failed");
        assert!(matches!(err, HarnessError::Payload(_)));
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[tokio::test]
    async fn garbage_from_controller_is_fatal() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut raw, stream) = tokio::io::duplex(16);
        let session = Session::new(Role::Worker, "raw", stream);
        let worker = tokio::spawn(Worker::from_session(session).run(noop));

        let mut ready = [0u8; 4];
        raw.read_exact(&mut ready).await.expect("ready token");
        assert_eq!(harness_proto::decode_token(&ready), Ok(Command::Ready));
        raw.write_all(&[0xFF, 0, 0, 0]).await.expect("garbage");

        let err = worker.await.expect("join").expect_err("protocol error");
        assert!(matches!(
            err,
            HarnessError::Protocol(ProtocolError::UnknownToken(0xFF))
        ));
    }

    #[tokio::test]
    async fn done_from_controller_is_out_of_sequence() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut raw, stream) = tokio::io::duplex(16);
        let session = Session::new(Role::Worker, "raw", stream);
        let worker = tokio::spawn(Worker::from_session(session).run(noop));

        let mut ready = [0u8; 4];
        raw.read_exact(&mut ready).await.expect("ready token");
        raw.write_all(&harness_proto::encode_token(Command::Done))
            .await
            .expect("done");

        let err = worker.await.expect("join").expect_err("protocol error");
        assert!(matches!(
            err,
            HarnessError::Protocol(ProtocolError::OutOfSequence {
                sender: Role::Controller,
                command: Command::Done,
                ..
            })
        ));
    }
}
