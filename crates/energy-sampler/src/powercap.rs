//! RAPL counters through the kernel powercap interface
//! (`/sys/class/powercap/intel-rapl:0`). Readable without root on hosts
//! where `energy_uj` is world-readable.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::{Domain, EnergyReading, EnergySampler, SamplerError};

pub const DEFAULT_POWERCAP_ROOT: &str = "/sys/class/powercap";

const PACKAGE_ZONE: &str = "intel-rapl:0";

#[derive(Debug)]
struct Zone {
    domain: Domain,
    energy_path: PathBuf,
    max_range_uj: u64,
}

#[derive(Debug)]
pub struct PowercapSampler {
    root: PathBuf,
    zones: Option<Vec<Zone>>,
    opened: Option<Vec<u64>>,
}

impl PowercapSampler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            zones: None,
            opened: None,
        }
    }

    /// Cheap probe used to pick a default sampler.
    pub fn is_readable(root: impl AsRef<Path>) -> bool {
        read_counter(&root.as_ref().join(PACKAGE_ZONE).join("energy_uj")).is_ok()
    }

    fn zones(&mut self) -> Result<&[Zone], SamplerError> {
        if self.zones.is_none() {
            let zones = discover(&self.root)?;
            info!(
                root = %self.root.display(),
                domains = ?zones.iter().map(|z| z.domain).collect::<Vec<_>>(),
                "powercap sampler ready"
            );
            self.zones = Some(zones);
        }
        Ok(self.zones.as_deref().unwrap_or_default())
    }
}

impl EnergySampler for PowercapSampler {
    fn name(&self) -> &'static str {
        "powercap"
    }

    fn start(&mut self) -> bool {
        let opening = self.zones().and_then(snapshot);
        match opening {
            Ok(counters) => {
                self.opened = Some(counters);
                true
            }
            Err(err) => {
                warn!(root = %self.root.display(), error = %err, "powercap energy sampling unavailable");
                false
            }
        }
    }

    fn stop(&mut self) -> EnergyReading {
        let mut reading = EnergyReading::default();
        let (Some(begin), Some(zones)) = (self.opened.take(), self.zones.as_deref()) else {
            return reading;
        };
        match snapshot(zones) {
            Ok(end) => {
                for (zone, (start, end)) in zones.iter().zip(begin.into_iter().zip(end)) {
                    let micro = counter_delta(start, end, zone.max_range_uj);
                    reading.set(zone.domain, micro as f64 / 1_000_000.0);
                }
            }
            Err(err) => warn!(root = %self.root.display(), error = %err, "failed to read closing powercap counters"),
        }
        reading
    }
}

/// Difference between two `energy_uj` readings, allowing one wrap at
/// `max_range_uj`.
pub(crate) fn counter_delta(start: u64, end: u64, max_range_uj: u64) -> u64 {
    if end >= start {
        end - start
    } else {
        max_range_uj.saturating_sub(start) + end
    }
}

fn discover(root: &Path) -> Result<Vec<Zone>, SamplerError> {
    let package = root.join(PACKAGE_ZONE);
    if !package.is_dir() {
        return Err(SamplerError::MissingZone(root.display().to_string()));
    }
    let mut zones = vec![open_zone(Domain::Package, &package)?];

    let prefix = format!("{PACKAGE_ZONE}:");
    let mut children: Vec<PathBuf> = fs::read_dir(&package)?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(&prefix))
        .map(|entry| entry.path())
        .collect();
    children.sort();
    for child in children {
        let Ok(name) = fs::read_to_string(child.join("name")) else {
            continue;
        };
        let domain = match name.trim() {
            "core" => Domain::Core,
            "uncore" => Domain::Uncore,
            "dram" => Domain::Dram,
            _ => continue,
        };
        zones.push(open_zone(domain, &child)?);
    }
    Ok(zones)
}

fn open_zone(domain: Domain, dir: &Path) -> Result<Zone, SamplerError> {
    Ok(Zone {
        domain,
        energy_path: dir.join("energy_uj"),
        max_range_uj: read_counter(&dir.join("max_energy_range_uj")).unwrap_or(u64::MAX),
    })
}

fn snapshot(zones: &[Zone]) -> Result<Vec<u64>, SamplerError> {
    zones.iter().map(|zone| read_counter(&zone.energy_path)).collect()
}

fn read_counter(path: &Path) -> Result<u64, SamplerError> {
    let raw = fs::read_to_string(path)?;
    raw.trim()
        .parse()
        .map_err(|_| SamplerError::MalformedCounter(raw.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTree {
        root: PathBuf,
    }

    impl FakeTree {
        fn new() -> Self {
            let root = std::env::temp_dir().join(format!("powercap-{}", uuid::Uuid::new_v4()));
            let package = root.join(PACKAGE_ZONE);
            fs::create_dir_all(&package).expect("package dir");
            fs::write(package.join("name"), "package-0\n").expect("name");
            fs::write(package.join("max_energy_range_uj"), "1000000\n").expect("range");
            fs::write(package.join("energy_uj"), "900000\n").expect("energy");
            for (index, name) in ["core", "dram"].iter().enumerate() {
                let zone = package.join(format!("{PACKAGE_ZONE}:{index}"));
                fs::create_dir_all(&zone).expect("sub zone");
                fs::write(zone.join("name"), format!("{name}\n")).expect("name");
                fs::write(zone.join("energy_uj"), "0\n").expect("energy");
            }
            Self { root }
        }

        fn set(&self, zone: &str, value: u64) {
            let dir = if zone == PACKAGE_ZONE {
                self.root.join(PACKAGE_ZONE)
            } else {
                self.root.join(PACKAGE_ZONE).join(zone)
            };
            fs::write(dir.join("energy_uj"), format!("{value}\n")).expect("write counter");
        }
    }

    impl Drop for FakeTree {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    #[test]
    fn reads_package_and_sub_zones() {
        let tree = FakeTree::new();
        assert!(PowercapSampler::is_readable(&tree.root));
        let mut sampler = PowercapSampler::new(&tree.root);

        assert!(sampler.start());
        tree.set(PACKAGE_ZONE, 400_000);
        tree.set("intel-rapl:0:0", 1_000_000);
        tree.set("intel-rapl:0:1", 250_000);
        let reading = sampler.stop();

        // Package wrapped at its 1 J range: (1_000_000 - 900_000) + 400_000 µJ.
        assert_eq!(reading.package_joules, Some(0.5));
        assert_eq!(reading.core_joules, Some(1.0));
        assert_eq!(reading.dram_joules, Some(0.25));
        assert_eq!(reading.uncore_joules, None);
    }

    #[test]
    fn missing_tree_is_unavailable() {
        let root = std::env::temp_dir().join(format!("powercap-missing-{}", uuid::Uuid::new_v4()));
        assert!(!PowercapSampler::is_readable(&root));
        let mut sampler = PowercapSampler::new(root);
        assert!(!sampler.start());
        assert!(sampler.stop().is_empty());
    }

    #[test]
    fn wrap_arithmetic() {
        assert_eq!(counter_delta(10, 30, 100), 20);
        assert_eq!(counter_delta(90, 5, 100), 15);
    }
}
