//! Controller side of a session.
//!
//! For each trial the controller waits for `Ready`, opens an energy
//! bracket, sends `Go`, waits (bounded) for `Done` and closes the bracket,
//! so the bracket always contains the whole Go..Done interval. Once the
//! plan is exhausted the worker's final `Ready` is left unanswered and the
//! session is closed.

use std::time::{Duration, Instant};

use energy_sampler::Meter;
use harness_proto::{Command, Role};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use transport_ipc::{Listener, Session, TransportError};

use crate::config::HarnessConfig;
use crate::definition::BenchmarkDefinition;
use crate::error::HarnessError;
use crate::launcher::{self, WorkerProcess};
use crate::trial::{Halt, Trial, TrialBatch, TrialOutcome, WaitPhase};

pub struct Controller {
    config: HarnessConfig,
    meter: Meter,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("plan", &self.config.plan())
            .field("meter", &self.meter)
            .finish()
    }
}

/// Result of waiting for a worker command.
enum Reply {
    Command(Command),
    Failed(TrialOutcome),
}

impl Controller {
    pub fn new(config: HarnessConfig, meter: Meter) -> Self {
        Self { config, meter }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn meter(&self) -> &Meter {
        &self.meter
    }

    /// Launches a worker for `definition`, runs one session against it and
    /// reaps the process.
    pub async fn run_benchmark(
        &mut self,
        definition: &BenchmarkDefinition,
    ) -> Result<TrialBatch, HarnessError> {
        definition.validate()?;
        let endpoint = self.config.fresh_endpoint();
        let listener = Listener::bind(&endpoint)
            .await
            .map_err(HarnessError::Connection)?;
        let mut worker = launcher::spawn(
            &definition.launch,
            listener.endpoint(),
            definition.loop_iterations,
        )?;
        info!(benchmark = %definition.name, endpoint = %listener.endpoint(), pid = ?worker.id(), "waiting for worker");

        let session = self.accept(&listener, &mut worker).await?;
        drop(listener);

        let mut batch = self.run_session(session, definition).await;
        batch.worker_exit = worker.reap(self.config.exit_grace).await;
        Ok(batch)
    }

    async fn accept(
        &self,
        listener: &Listener,
        worker: &mut WorkerProcess,
    ) -> Result<Session, HarnessError> {
        let timeout = self.config.connect_timeout;
        tokio::select! {
            accepted = listener.accept(Role::Controller, timeout) => match accepted {
                Ok(session) => Ok(session),
                Err(err) => {
                    warn!(error = %err, "worker never connected");
                    worker.kill().await;
                    Err(HarnessError::Connection(err))
                }
            },
            status = worker.exited() => {
                let status = match status {
                    Ok(status) => status.to_string(),
                    Err(err) => err.to_string(),
                };
                Err(HarnessError::WorkerExited {
                    program: worker.program().to_string(),
                    status,
                })
            }
        }
    }

    /// Drives the trial plan over an established session and closes it.
    /// Never fails as a whole: what went wrong is recorded in the batch.
    pub async fn run_session(
        &mut self,
        mut session: Session,
        definition: &BenchmarkDefinition,
    ) -> TrialBatch {
        let plan = self.config.plan();
        let mut batch = TrialBatch::new(&definition.name, self.meter.sampler_name(), plan);
        info!(
            benchmark = %definition.name,
            measured = plan.measured,
            warmup = plan.warmup,
            sampler = self.meter.sampler_name(),
            peer = session.peer(),
            "starting trials"
        );

        for index in 0..plan.total() {
            let warmup = plan.is_warmup(index);
            if let Err(outcome) = self.run_trial(&mut session, &mut batch, index, warmup).await {
                batch.halt(Halt::SessionLost {
                    trial: index,
                    reason: outcome.reason(),
                });
                break;
            }
            if batch.is_halted() {
                break;
            }
        }

        if !batch.is_halted() {
            self.release(&mut session).await;
        }
        if session.is_open() {
            if let Err(err) = session.close().await {
                debug!(error = %err, "closing controller session");
            }
        }

        info!(
            benchmark = %definition.name,
            measured = batch.measured().count(),
            failed = batch.failures().count(),
            halted = batch.is_halted(),
            "trials finished"
        );
        batch
    }

    /// One trial. A recorded but unsuccessful trial comes back as `Err` so
    /// the caller stops the plan.
    async fn run_trial(
        &mut self,
        session: &mut Session,
        batch: &mut TrialBatch,
        index: u32,
        warmup: bool,
    ) -> Result<(), TrialOutcome> {
        let started_at = OffsetDateTime::now_utc();
        let clock = Instant::now();
        let record_failure = |batch: &mut TrialBatch, outcome: TrialOutcome| {
            batch.record(Trial {
                index,
                warmup,
                started_at,
                elapsed: clock.elapsed(),
                energy: None,
                outcome: outcome.clone(),
            });
            Err(outcome)
        };

        match self.await_reply(session, WaitPhase::Ready, self.config.ready_timeout).await {
            Reply::Command(Command::Ready) => {}
            Reply::Command(other) => {
                return record_failure(batch, unexpected(other, WaitPhase::Ready));
            }
            Reply::Failed(outcome) => return record_failure(batch, outcome),
        }

        if !self.meter.begin() {
            warn!(sampler = self.meter.sampler_name(), trial = index, "energy sampler unavailable; aborting batch");
            batch.halt(Halt::MeasurementUnavailable {
                sampler: self.meter.sampler_name().to_string(),
            });
            if let Err(err) = session.send(Command::Error).await {
                debug!(error = %err, "could not tell worker to stop");
            }
            return Ok(());
        }

        let started_at = OffsetDateTime::now_utc();
        if let Err(err) = session.send(Command::Go).await {
            let measurement = self.meter.end();
            let outcome = TrialOutcome::Failed {
                reason: format!("sending go failed: {err}"),
            };
            batch.record(Trial {
                index,
                warmup,
                started_at,
                elapsed: measurement.elapsed,
                energy: None,
                outcome: outcome.clone(),
            });
            return Err(outcome);
        }
        debug!(trial = index, warmup, "go");

        let reply = self
            .await_reply(session, WaitPhase::Done, self.config.trial_timeout)
            .await;
        let measurement = self.meter.end();
        let outcome = match reply {
            Reply::Command(Command::Done) => TrialOutcome::Completed,
            Reply::Command(Command::Error) => TrialOutcome::Failed {
                reason: "worker reported a payload failure".into(),
            },
            Reply::Command(other) => unexpected(other, WaitPhase::Done),
            Reply::Failed(outcome) => outcome,
        };

        let completed = outcome.is_completed();
        debug!(
            trial = index,
            warmup,
            elapsed_ms = measurement.elapsed.as_millis() as u64,
            joules = ?measurement.energy.total_joules(),
            status = ?outcome,
            "trial finished"
        );
        batch.record(Trial {
            index,
            warmup,
            started_at,
            elapsed: measurement.elapsed,
            energy: completed.then_some(measurement.energy),
            outcome: outcome.clone(),
        });
        if completed {
            Ok(())
        } else {
            Err(outcome)
        }
    }

    async fn await_reply(
        &self,
        session: &mut Session,
        phase: WaitPhase,
        timeout: Duration,
    ) -> Reply {
        match session.receive_within(timeout).await {
            Ok(Some(command)) => Reply::Command(command),
            Ok(None) => Reply::Failed(TrialOutcome::Failed {
                reason: format!("worker closed the session while the controller waited for `{phase}`"),
            }),
            Err(TransportError::Timeout(after)) => {
                warn!(%phase, after_ms = after.as_millis() as u64, "worker timed out");
                Reply::Failed(TrialOutcome::TimedOut {
                    phase,
                    after_ms: after.as_millis() as u64,
                })
            }
            Err(err) => Reply::Failed(TrialOutcome::Failed {
                reason: err.to_string(),
            }),
        }
    }

    /// Reads the worker's closing `Ready` without answering it.
    async fn release(&self, session: &mut Session) {
        match session.receive_within(self.config.ready_timeout).await {
            Ok(Some(Command::Ready)) => debug!("leaving final ready unanswered"),
            Ok(Some(other)) => warn!(command = %other, "unexpected command after the last trial"),
            Ok(None) => debug!("worker closed before re-announcing ready"),
            Err(err) => warn!(error = %err, "worker did not re-announce ready"),
        }
    }
}

fn unexpected(command: Command, phase: WaitPhase) -> TrialOutcome {
    TrialOutcome::Failed {
        reason: format!("worker sent `{command}` while the controller waited for `{phase}`"),
    }
}
