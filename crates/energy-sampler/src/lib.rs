//! Energy sampling behind a two-call capability: `start` then `stop`.
//!
//! Real adapters read the processor's RAPL counters, either straight from
//! the model-specific registers or through the kernel's powercap tree.
//! [`NoopSampler`] serves timing-only runs and [`testing::ScriptedSampler`]
//! lets the orchestration logic be exercised without hardware access.

mod meter;
mod msr;
mod powercap;
pub mod testing;

pub use meter::{Measurement, Meter};
pub use msr::{MsrSampler, Vendor};
pub use powercap::{PowercapSampler, DEFAULT_POWERCAP_ROOT};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("sampler io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported cpu vendor")]
    UnsupportedVendor,
    #[error("malformed counter value `{0}`")]
    MalformedCounter(String),
    #[error("no RAPL package zone under {0}")]
    MissingZone(String),
    #[error("unknown sampler kind `{0}` (expected auto, msr, powercap or none)")]
    UnknownKind(String),
}

/// Native energy sampling capability.
///
/// `start` reports whether a measurement can be taken at all; a `false`
/// means the caller must not measure. `stop` closes the bracket opened by
/// the last successful `start`.
pub trait EnergySampler: Send {
    fn name(&self) -> &'static str;
    fn start(&mut self) -> bool;
    fn stop(&mut self) -> EnergyReading;
}

impl<S: EnergySampler + ?Sized> EnergySampler for Box<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn start(&mut self) -> bool {
        (**self).start()
    }

    fn stop(&mut self) -> EnergyReading {
        (**self).stop()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Package,
    Core,
    Uncore,
    Dram,
}

/// Energy accumulated over one bracket, per RAPL domain. Domains the host
/// does not expose stay `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyReading {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_joules: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core_joules: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uncore_joules: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dram_joules: Option<f64>,
}

impl EnergyReading {
    pub fn set(&mut self, domain: Domain, joules: f64) {
        let slot = match domain {
            Domain::Package => &mut self.package_joules,
            Domain::Core => &mut self.core_joules,
            Domain::Uncore => &mut self.uncore_joules,
            Domain::Dram => &mut self.dram_joules,
        };
        *slot = Some(joules);
    }

    pub fn get(&self, domain: Domain) -> Option<f64> {
        match domain {
            Domain::Package => self.package_joules,
            Domain::Core => self.core_joules,
            Domain::Uncore => self.uncore_joules,
            Domain::Dram => self.dram_joules,
        }
    }

    /// Whole-socket energy, which already includes core and uncore.
    pub fn total_joules(&self) -> Option<f64> {
        self.package_joules
    }

    pub fn is_empty(&self) -> bool {
        *self == EnergyReading::default()
    }
}

/// Always available and never measures anything. Only for timing runs
/// where energy figures are explicitly not wanted.
#[derive(Debug, Default)]
pub struct NoopSampler;

impl EnergySampler for NoopSampler {
    fn name(&self) -> &'static str {
        "none"
    }

    fn start(&mut self) -> bool {
        true
    }

    fn stop(&mut self) -> EnergyReading {
        EnergyReading::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    #[default]
    Auto,
    Msr,
    Powercap,
    None,
}

impl FromStr for SamplerKind {
    type Err = SamplerError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(SamplerKind::Auto),
            "msr" => Ok(SamplerKind::Msr),
            "powercap" | "sysfs" => Ok(SamplerKind::Powercap),
            "none" | "noop" => Ok(SamplerKind::None),
            other => Err(SamplerError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SamplerKind::Auto => "auto",
            SamplerKind::Msr => "msr",
            SamplerKind::Powercap => "powercap",
            SamplerKind::None => "none",
        })
    }
}

/// Builds the sampler for `kind`. `Auto` prefers the powercap tree when it
/// is readable and falls back to raw MSR access.
pub fn open_sampler(kind: SamplerKind) -> Box<dyn EnergySampler> {
    match kind {
        SamplerKind::Auto if PowercapSampler::is_readable(DEFAULT_POWERCAP_ROOT) => {
            Box::new(PowercapSampler::new(DEFAULT_POWERCAP_ROOT))
        }
        SamplerKind::Auto | SamplerKind::Msr => Box::new(MsrSampler::new(0)),
        SamplerKind::Powercap => Box::new(PowercapSampler::new(DEFAULT_POWERCAP_ROOT)),
        SamplerKind::None => Box::new(NoopSampler),
    }
}
