use std::fmt;
use std::time::Duration;

use energy_sampler::EnergyReading;
use serde::{Deserialize, Serialize, Serializer};
use time::OffsetDateTime;

use crate::error::HarnessError;

/// How many trials to run against one worker session. The first `warmup`
/// trials are executed and recorded but never measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialPlan {
    pub measured: u32,
    pub warmup: u32,
}

impl TrialPlan {
    pub fn new(measured: u32, warmup: u32) -> Self {
        Self { measured, warmup }
    }

    pub fn total(&self) -> u32 {
        self.measured.saturating_add(self.warmup)
    }

    pub fn is_warmup(&self, index: u32) -> bool {
        index < self.warmup
    }
}

/// What the controller was waiting on when a trial went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitPhase {
    Ready,
    Done,
}

impl fmt::Display for WaitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WaitPhase::Ready => "ready",
            WaitPhase::Done => "done",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrialOutcome {
    Completed,
    Failed { reason: String },
    TimedOut { phase: WaitPhase, after_ms: u64 },
}

impl TrialOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TrialOutcome::Completed)
    }

    /// One-line description for logs and halt records.
    pub fn reason(&self) -> String {
        match self {
            TrialOutcome::Completed => "completed".into(),
            TrialOutcome::Failed { reason } => reason.clone(),
            TrialOutcome::TimedOut { phase, after_ms } => {
                format!("no `{phase}` within {after_ms} ms")
            }
        }
    }

    pub fn to_error(&self) -> Option<HarnessError> {
        match self {
            TrialOutcome::Completed => None,
            TrialOutcome::Failed { reason } => Some(HarnessError::TrialFailed(reason.clone())),
            TrialOutcome::TimedOut { phase, after_ms } => Some(HarnessError::TrialTimeout {
                phase: *phase,
                after_ms: *after_ms,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trial {
    pub index: u32,
    pub warmup: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(rename = "elapsed_ms", serialize_with = "millis")]
    pub elapsed: Duration,
    /// Present on completed trials only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy: Option<EnergyReading>,
    #[serde(flatten)]
    pub outcome: TrialOutcome,
}

fn millis<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_nanos() as f64 / 1_000_000.0)
}

/// Why a batch stopped before running its whole plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Halt {
    MeasurementUnavailable { sampler: String },
    SessionLost { trial: u32, reason: String },
}

/// Every trial run against one worker session, in execution order.
#[derive(Debug, Clone, Serialize)]
pub struct TrialBatch {
    pub benchmark: String,
    pub sampler: String,
    pub plan: TrialPlan,
    pub trials: Vec<Trial>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halt: Option<Halt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_exit: Option<i32>,
}

impl TrialBatch {
    pub fn new(benchmark: impl Into<String>, sampler: impl Into<String>, plan: TrialPlan) -> Self {
        Self {
            benchmark: benchmark.into(),
            sampler: sampler.into(),
            plan,
            trials: Vec::with_capacity(plan.total() as usize),
            halt: None,
            worker_exit: None,
        }
    }

    pub fn record(&mut self, trial: Trial) {
        self.trials.push(trial);
    }

    /// First halt wins; later ones are consequences of it.
    pub fn halt(&mut self, halt: Halt) {
        if self.halt.is_none() {
            self.halt = Some(halt);
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_some()
    }

    /// Completed, non-warmup trials in execution order.
    pub fn measured(&self) -> impl Iterator<Item = &Trial> {
        self.trials
            .iter()
            .filter(|trial| !trial.warmup && trial.outcome.is_completed())
    }

    pub fn failures(&self) -> impl Iterator<Item = &Trial> {
        self.trials.iter().filter(|trial| !trial.outcome.is_completed())
    }

    pub fn check(&self) -> Result<(), HarnessError> {
        if let Some(Halt::MeasurementUnavailable { sampler }) = &self.halt {
            return Err(HarnessError::MeasurementUnavailable {
                sampler: sampler.clone(),
            });
        }
        if self.measured().next().is_none() {
            let cause = self
                .failures()
                .next()
                .and_then(|trial| trial.outcome.to_error())
                .map(Box::new);
            return Err(HarnessError::NoMeasuredTrials {
                benchmark: self.benchmark.clone(),
                cause,
            });
        }
        Ok(())
    }

    /// The batch itself when at least one trial was measured.
    pub fn into_result(self) -> Result<TrialBatch, HarnessError> {
        self.check()?;
        Ok(self)
    }
}
