use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{EnergyReading, EnergySampler};

/// Result of one closed bracket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub energy: EnergyReading,
    pub elapsed: Duration,
}

/// Owns a sampler and enforces the bracket contract: one `begin` followed
/// by exactly one `end`, never nested. Violations are programming errors
/// and panic.
pub struct Meter {
    sampler: Box<dyn EnergySampler>,
    opened_at: Option<Instant>,
    brackets: u64,
}

impl Meter {
    pub fn new<S: EnergySampler + 'static>(sampler: S) -> Self {
        Self::from_boxed(Box::new(sampler))
    }

    pub fn from_boxed(sampler: Box<dyn EnergySampler>) -> Self {
        Self {
            sampler,
            opened_at: None,
            brackets: 0,
        }
    }

    pub fn sampler_name(&self) -> &'static str {
        self.sampler.name()
    }

    pub fn is_open(&self) -> bool {
        self.opened_at.is_some()
    }

    /// Closed brackets so far.
    pub fn brackets(&self) -> u64 {
        self.brackets
    }

    /// Opens a bracket. `false` means the sampler refused and no bracket
    /// is open.
    pub fn begin(&mut self) -> bool {
        assert!(
            self.opened_at.is_none(),
            "energy bracket already open; brackets may not nest"
        );
        if !self.sampler.start() {
            debug!(sampler = self.sampler.name(), "sampler refused to start");
            return false;
        }
        self.opened_at = Some(Instant::now());
        true
    }

    pub fn end(&mut self) -> Measurement {
        let opened_at = self
            .opened_at
            .take()
            .unwrap_or_else(|| panic!("energy bracket closed without a matching begin"));
        let energy = self.sampler.stop();
        self.brackets += 1;
        Measurement {
            energy,
            elapsed: opened_at.elapsed(),
        }
    }
}

impl std::fmt::Debug for Meter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Meter")
            .field("sampler", &self.sampler.name())
            .field("open", &self.is_open())
            .field("brackets", &self.brackets)
            .finish()
    }
}
