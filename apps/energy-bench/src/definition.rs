//! Benchmark definitions as read from a suite file:
//!
//! ```toml
//! [[benchmark]]
//! name = "fib-java"
//! group = "recursion"
//! loop_iterations = 10
//! launch = { program = "java", args = ["-cp", "build", "Fib", "{endpoint}"] }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use transport_ipc::Endpoint;

use crate::error::HarnessError;

/// Argument placeholder replaced with the session endpoint. Without one the
/// endpoint is appended as the last argument.
pub const ENDPOINT_PLACEHOLDER: &str = "{endpoint}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Command line for one session.
    pub fn argv(&self, endpoint: &Endpoint) -> Vec<String> {
        let endpoint = endpoint.to_string();
        let mut substituted = false;
        let mut argv: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                if arg.contains(ENDPOINT_PLACEHOLDER) {
                    substituted = true;
                    arg.replace(ENDPOINT_PLACEHOLDER, &endpoint)
                } else {
                    arg.clone()
                }
            })
            .collect();
        if !substituted {
            argv.push(endpoint);
        }
        argv
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkDefinition {
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    /// Payload executions per trial.
    #[serde(default = "default_loop_iterations")]
    pub loop_iterations: u32,
    #[serde(default)]
    pub skip: bool,
    pub launch: LaunchSpec,
}

fn default_loop_iterations() -> u32 {
    1
}

impl BenchmarkDefinition {
    pub fn new(name: impl Into<String>, launch: LaunchSpec) -> Self {
        Self {
            name: name.into(),
            group: None,
            loop_iterations: default_loop_iterations(),
            skip: false,
            launch,
        }
    }

    pub fn with_loop_iterations(mut self, loop_iterations: u32) -> Self {
        self.loop_iterations = loop_iterations;
        self
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.name.trim().is_empty() {
            return Err(HarnessError::Definition("benchmark name is empty".into()));
        }
        if self.loop_iterations == 0 {
            return Err(HarnessError::Definition(format!(
                "`{}` needs at least one loop iteration",
                self.name
            )));
        }
        if self.launch.program.trim().is_empty() {
            return Err(HarnessError::Definition(format!(
                "`{}` has no program to launch",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suite {
    #[serde(rename = "benchmark", default)]
    pub benchmarks: Vec<BenchmarkDefinition>,
}

impl Suite {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, HarnessError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let suite: Suite = toml::from_str(&raw).map_err(|source| HarnessError::Suite {
            path: path.to_path_buf(),
            source,
        })?;
        suite.validate()?;
        Ok(suite)
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        let mut seen = HashSet::new();
        for definition in &self.benchmarks {
            definition.validate()?;
            if !seen.insert(definition.name.as_str()) {
                return Err(HarnessError::Definition(format!(
                    "benchmark `{}` is defined twice",
                    definition.name
                )));
            }
        }
        Ok(())
    }

    /// Definitions to run: skipped ones are left out, and `only` narrows
    /// the set to a single name.
    pub fn runnable<'a>(&'a self, only: Option<&'a str>) -> impl Iterator<Item = &'a BenchmarkDefinition> {
        self.benchmarks
            .iter()
            .filter(move |definition| only.map_or(true, |name| definition.name == name))
            .filter(|definition| !definition.skip)
    }
}
