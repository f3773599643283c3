use std::path::PathBuf;
use std::time::Duration;

use energy_sampler::SamplerKind;
use tracing::warn;
use transport_ipc::Endpoint;

use crate::trial::TrialPlan;

/// Environment variable a launched worker reads its loop-iteration count from.
pub const LOOP_ITERATIONS_ENV: &str = "ENERGY_BENCH_LOOP_ITERATIONS";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Measured trials per benchmark, warmups not included.
    pub trials: u32,
    pub warmup: u32,
    pub trial_timeout: Duration,
    pub ready_timeout: Duration,
    pub connect_timeout: Duration,
    pub exit_grace: Duration,
    pub sampler: SamplerKind,
    pub socket_dir: PathBuf,
    pub log_filter: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            trials: 10,
            warmup: 0,
            trial_timeout: Duration::from_millis(5_000),
            ready_timeout: Duration::from_millis(5_000),
            connect_timeout: Duration::from_millis(10_000),
            exit_grace: Duration::from_millis(2_000),
            sampler: SamplerKind::Auto,
            socket_dir: std::env::temp_dir(),
            log_filter: "info".into(),
        }
    }
}

impl HarnessConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(key, value = %raw, "ignoring non-numeric setting");
                    None
                }
            }
        };
        let millis = |key: &str, fallback: Duration| {
            number(key).map(Duration::from_millis).unwrap_or(fallback)
        };

        let trials = number("ENERGY_BENCH_TRIALS")
            .or_else(|| number("RAPL_ITERATIONS"))
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v > 0)
            .unwrap_or(defaults.trials);
        let warmup = number("ENERGY_BENCH_WARMUP")
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(defaults.warmup);
        let sampler = match lookup("ENERGY_BENCH_SAMPLER") {
            Some(raw) => raw.parse().unwrap_or_else(|err| {
                warn!(error = %err, "falling back to automatic sampler selection");
                SamplerKind::Auto
            }),
            None => defaults.sampler,
        };

        Self {
            trials,
            warmup,
            trial_timeout: millis("ENERGY_BENCH_TRIAL_TIMEOUT_MS", defaults.trial_timeout),
            ready_timeout: millis("ENERGY_BENCH_READY_TIMEOUT_MS", defaults.ready_timeout),
            connect_timeout: millis("ENERGY_BENCH_CONNECT_TIMEOUT_MS", defaults.connect_timeout),
            exit_grace: millis("ENERGY_BENCH_EXIT_GRACE_MS", defaults.exit_grace),
            sampler,
            socket_dir: lookup("ENERGY_BENCH_SOCKET_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.socket_dir),
            log_filter: lookup("RUST_LOG").unwrap_or(defaults.log_filter),
        }
    }

    pub fn plan(&self) -> TrialPlan {
        TrialPlan::new(self.trials, self.warmup)
    }

    /// A never-before-used endpoint for one worker session.
    pub fn fresh_endpoint(&self) -> Endpoint {
        #[cfg(unix)]
        {
            let name = format!("energy-bench-{}.sock", uuid::Uuid::new_v4().simple());
            Endpoint::Unix(self.socket_dir.join(name))
        }
        #[cfg(not(unix))]
        {
            Endpoint::tcp_loopback()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = HarnessConfig::from_lookup(lookup(&[]));
        assert_eq!(config.trials, 10);
        assert_eq!(config.warmup, 0);
        assert_eq!(config.trial_timeout, Duration::from_millis(5_000));
        assert_eq!(config.connect_timeout, Duration::from_millis(10_000));
        assert_eq!(config.sampler, SamplerKind::Auto);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn rapl_iterations_is_a_fallback_for_trials() {
        let config = HarnessConfig::from_lookup(lookup(&[("RAPL_ITERATIONS", "25")]));
        assert_eq!(config.trials, 25);

        let config = HarnessConfig::from_lookup(lookup(&[
            ("RAPL_ITERATIONS", "25"),
            ("ENERGY_BENCH_TRIALS", "3"),
            ("ENERGY_BENCH_WARMUP", "2"),
        ]));
        assert_eq!(config.plan(), TrialPlan::new(3, 2));
    }

    #[test]
    fn malformed_values_keep_defaults() {
        let config = HarnessConfig::from_lookup(lookup(&[
            ("ENERGY_BENCH_TRIALS", "many"),
            ("ENERGY_BENCH_TRIAL_TIMEOUT_MS", "soon"),
            ("ENERGY_BENCH_SAMPLER", "perf"),
        ]));
        assert_eq!(config.trials, 10);
        assert_eq!(config.trial_timeout, Duration::from_millis(5_000));
        assert_eq!(config.sampler, SamplerKind::Auto);
    }

    #[test]
    fn zero_trials_is_rejected() {
        let config = HarnessConfig::from_lookup(lookup(&[("ENERGY_BENCH_TRIALS", "0")]));
        assert_eq!(config.trials, 10);
    }

    #[cfg(unix)]
    #[test]
    fn endpoints_are_unique_under_the_socket_dir() {
        let config = HarnessConfig::from_lookup(lookup(&[("ENERGY_BENCH_SOCKET_DIR", "/run/bench")]));
        let first = config.fresh_endpoint();
        let second = config.fresh_endpoint();
        assert_ne!(first, second);
        match first {
            Endpoint::Unix(path) => assert!(path.starts_with("/run/bench")),
            other => panic!("unexpected endpoint {other}"),
        }
    }
}
