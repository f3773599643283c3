//! RAPL counters read straight from `/dev/cpu/<n>/msr` (needs the `msr`
//! kernel module and read access to the device, usually root).

use std::fs::File;

use tracing::{debug, info, warn};

use crate::{Domain, EnergyReading, EnergySampler, SamplerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Intel,
    Amd,
}

struct RegisterMap {
    power_unit: u64,
    domains: &'static [(Domain, u64)],
}

const INTEL: RegisterMap = RegisterMap {
    power_unit: 0x606,
    domains: &[
        (Domain::Package, 0x611),
        (Domain::Core, 0x639),
        (Domain::Uncore, 0x641),
        (Domain::Dram, 0x619),
    ],
};

// AMD reports core energy per core; the package register covers the socket.
const AMD: RegisterMap = RegisterMap {
    power_unit: 0xC001_0299,
    domains: &[(Domain::Package, 0xC001_029B), (Domain::Core, 0xC001_029A)],
};

impl Vendor {
    fn registers(self) -> &'static RegisterMap {
        match self {
            Vendor::Intel => &INTEL,
            Vendor::Amd => &AMD,
        }
    }

    /// Reads the `vendor_id` line of a `/proc/cpuinfo` dump.
    pub fn from_cpuinfo(cpuinfo: &str) -> Option<Vendor> {
        cpuinfo
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(key, _)| key.trim() == "vendor_id")
            .and_then(|(_, value)| match value.trim() {
                "GenuineIntel" => Some(Vendor::Intel),
                "AuthenticAMD" | "HygonGenuine" => Some(Vendor::Amd),
                _ => None,
            })
    }
}

/// Joules per counter increment, from the energy-status-unit field
/// (bits 12:8) of the power unit register.
pub(crate) fn joules_per_count(power_unit: u64) -> f64 {
    let esu = ((power_unit >> 8) & 0x1F) as i32;
    0.5f64.powi(esu)
}

/// Energy status registers hold a 32-bit wrapping counter.
pub(crate) fn counter_delta(start: u64, end: u64) -> u64 {
    u64::from((end as u32).wrapping_sub(start as u32))
}

struct Device {
    file: File,
    domains: Vec<(Domain, u64)>,
    joules_per_count: f64,
}

pub struct MsrSampler {
    cpu: u32,
    device: Option<Device>,
    opened: Option<Vec<u64>>,
}

impl MsrSampler {
    pub fn new(cpu: u32) -> Self {
        Self {
            cpu,
            device: None,
            opened: None,
        }
    }

    fn device(&mut self) -> Result<&Device, SamplerError> {
        if self.device.is_none() {
            let device = Device::open(self.cpu)?;
            info!(
                cpu = self.cpu,
                domains = ?device.domains.iter().map(|(d, _)| *d).collect::<Vec<_>>(),
                joules_per_count = device.joules_per_count,
                "msr sampler ready"
            );
            self.device = Some(device);
        }
        self.device.as_ref().ok_or(SamplerError::UnsupportedVendor)
    }
}

impl EnergySampler for MsrSampler {
    fn name(&self) -> &'static str {
        "msr"
    }

    fn start(&mut self) -> bool {
        let opening = self.device().and_then(Device::snapshot);
        match opening {
            Ok(counters) => {
                self.opened = Some(counters);
                true
            }
            Err(err) => {
                warn!(cpu = self.cpu, error = %err, "msr energy sampling unavailable");
                false
            }
        }
    }

    fn stop(&mut self) -> EnergyReading {
        let mut reading = EnergyReading::default();
        let (Some(begin), Some(device)) = (self.opened.take(), self.device.as_ref()) else {
            return reading;
        };
        match device.snapshot() {
            Ok(end) => {
                for ((domain, _), (start, end)) in device.domains.iter().zip(begin.iter().zip(end)) {
                    let counts = counter_delta(*start, end);
                    reading.set(*domain, counts as f64 * device.joules_per_count);
                }
            }
            Err(err) => warn!(cpu = self.cpu, error = %err, "failed to read closing msr counters"),
        }
        reading
    }
}

impl Device {
    #[cfg(target_os = "linux")]
    fn open(cpu: u32) -> Result<Self, SamplerError> {
        let cpuinfo = std::fs::read_to_string("/proc/cpuinfo")?;
        let vendor = Vendor::from_cpuinfo(&cpuinfo).ok_or(SamplerError::UnsupportedVendor)?;
        let file = File::open(format!("/dev/cpu/{cpu}/msr"))?;
        let map = vendor.registers();
        let joules_per_count = joules_per_count(read_msr(&file, map.power_unit)?);

        // Not every part exposes every domain (PP1 is client-only, DRAM
        // server-only); keep what answers.
        let domains = map
            .domains
            .iter()
            .copied()
            .filter(|(domain, register)| match read_msr(&file, *register) {
                Ok(_) => true,
                Err(err) => {
                    debug!(?domain, error = %err, "skipping unreadable rapl domain");
                    false
                }
            })
            .collect();
        Ok(Self {
            file,
            domains,
            joules_per_count,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn open(_cpu: u32) -> Result<Self, SamplerError> {
        Err(SamplerError::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "msr sampling is only implemented for linux",
        )))
    }

    fn snapshot(&self) -> Result<Vec<u64>, SamplerError> {
        self.domains
            .iter()
            .map(|(_, register)| read_msr(&self.file, *register))
            .collect()
    }
}

#[cfg(target_os = "linux")]
fn read_msr(file: &File, register: u64) -> Result<u64, SamplerError> {
    use std::os::unix::fs::FileExt;

    let mut raw = [0u8; 8];
    file.read_exact_at(&mut raw, register)?;
    Ok(u64::from_le_bytes(raw))
}

#[cfg(not(target_os = "linux"))]
fn read_msr(_file: &File, _register: u64) -> Result<u64, SamplerError> {
    Err(SamplerError::UnsupportedVendor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_detection() {
        let intel = "processor\t: 0\nvendor_id\t: GenuineIntel\ncpu family\t: 6\n";
        let amd = "processor\t: 0\nvendor_id\t: AuthenticAMD\n";
        assert_eq!(Vendor::from_cpuinfo(intel), Some(Vendor::Intel));
        assert_eq!(Vendor::from_cpuinfo(amd), Some(Vendor::Amd));
        assert_eq!(Vendor::from_cpuinfo("vendor_id : ARM\n"), None);
        assert_eq!(Vendor::from_cpuinfo(""), None);
    }

    #[test]
    fn energy_unit_decoding() {
        // 0xA0E03 is a common Intel value: ESU = 14 → 61 µJ per count.
        let unit = joules_per_count(0x000A_0E03);
        assert!((unit - 1.0 / 16384.0).abs() < f64::EPSILON);
        assert_eq!(joules_per_count(0), 1.0);
    }

    #[test]
    fn counter_wraps_at_32_bits() {
        assert_eq!(counter_delta(100, 250), 150);
        assert_eq!(counter_delta(0xFFFF_FFF0, 0x10), 0x20);
        // Upper bits are reserved and ignored.
        assert_eq!(counter_delta(0x1_0000_0005, 0x2_0000_0009), 4);
    }

    #[test]
    fn stop_without_open_bracket_is_empty() {
        let mut sampler = MsrSampler::new(0);
        assert!(sampler.stop().is_empty());
    }
}
