//! Controller and worker halves of the energy benchmark harness.
//!
//! The controller launches a worker process per benchmark definition,
//! accepts its session and drives Ready/Go/Done trials while bracketing
//! each one with an energy measurement. The worker side lives in
//! [`worker`] and is what benchmark binaries link against.

pub mod config;
pub mod controller;
pub mod definition;
pub mod error;
pub mod launcher;
pub mod telemetry;
pub mod trial;
pub mod worker;

pub use config::HarnessConfig;
pub use controller::Controller;
pub use definition::{BenchmarkDefinition, LaunchSpec, Suite};
pub use error::HarnessError;
pub use trial::{Halt, Trial, TrialBatch, TrialOutcome, TrialPlan, WaitPhase};
pub use worker::{Payload, Termination, Worker, WorkerReport};
