use std::io;
use std::path::PathBuf;

use harness_proto::ProtocolError;
use thiserror::Error;
use transport_ipc::TransportError;

use crate::trial::WaitPhase;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("could not establish a session with the worker: {0}")]
    Connection(#[source] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("worker sent no `{phase}` within {after_ms} ms")]
    TrialTimeout { phase: WaitPhase, after_ms: u64 },
    #[error("energy sampler `{sampler}` refused to start; nothing was measured")]
    MeasurementUnavailable { sampler: String },
    #[error("benchmark `{benchmark}` finished without a single measured trial")]
    NoMeasuredTrials {
        benchmark: String,
        #[source]
        cause: Option<Box<HarnessError>>,
    },
    #[error("trial failed: {0}")]
    TrialFailed(String),
    #[error("session failed: {0}")]
    Transport(#[source] TransportError),
    #[error("payload failed: {0:#}")]
    Payload(anyhow::Error),
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("worker `{program}` exited before connecting (status {status})")]
    WorkerExited { program: String, status: String },
    #[error("invalid benchmark definition: {0}")]
    Definition(String),
    #[error("failed to parse suite {path}: {source}")]
    Suite {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<TransportError> for HarnessError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Protocol(err) => HarnessError::Protocol(err),
            err @ (TransportError::Connect { .. } | TransportError::AcceptTimeout { .. }) => {
                HarnessError::Connection(err)
            }
            other => HarnessError::Transport(other),
        }
    }
}
