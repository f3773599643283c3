use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use energy_bench::config::HarnessConfig;
use energy_bench::telemetry::init_tracing;
use energy_bench::{BenchmarkDefinition, Controller, LaunchSpec, Suite};
use energy_sampler::{open_sampler, Meter, SamplerKind};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "energy-bench")]
#[command(about = "Runs benchmark workers in lock-step and measures the energy of every trial")]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Flags that take precedence over the `ENERGY_BENCH_*` environment.
#[derive(Args, Debug)]
struct Overrides {
    /// Measured trials per benchmark
    #[arg(long, global = true, value_parser = clap::value_parser!(u32).range(1..))]
    trials: Option<u32>,

    /// Warmup trials run before the measured ones and left out of results
    #[arg(long, global = true)]
    warmup: Option<u32>,

    /// How long a trial may run before it is abandoned
    #[arg(long, global = true)]
    trial_timeout_ms: Option<u64>,

    /// Energy sampler: auto, msr, powercap or none
    #[arg(long, global = true)]
    sampler: Option<SamplerKind>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every benchmark of a suite file
    Run {
        /// TOML file with `[[benchmark]]` tables
        suite: PathBuf,

        /// Only run the benchmark with this name
        #[arg(long)]
        only: Option<String>,
    },
    /// Run a single worker command line
    Exec {
        /// Name reported in the results
        #[arg(long, default_value = "exec")]
        name: String,

        /// Payload executions per trial
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        loop_iterations: u32,

        /// Worker program and its arguments; the endpoint is appended
        #[arg(last = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },
}

impl Overrides {
    fn apply(&self, config: &mut HarnessConfig) {
        if let Some(trials) = self.trials {
            config.trials = trials;
        }
        if let Some(warmup) = self.warmup {
            config.warmup = warmup;
        }
        if let Some(ms) = self.trial_timeout_ms {
            config.trial_timeout = std::time::Duration::from_millis(ms);
        }
        if let Some(sampler) = self.sampler {
            config.sampler = sampler;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut config = HarnessConfig::from_env();
    cli.overrides.apply(&mut config);
    init_tracing(&config.log_filter);

    match run(cli.command, config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!(error = %format!("{err:#}"), "energy-bench failed");
            ExitCode::FAILURE
        }
    }
}

/// Runs the selected definitions; `Ok(false)` when any batch failed.
async fn run(command: Commands, config: HarnessConfig) -> Result<bool> {
    let definitions = match command {
        Commands::Run { suite, only } => {
            let suite = Suite::load(&suite)
                .with_context(|| format!("loading suite {}", suite.display()))?;
            let selected: Vec<BenchmarkDefinition> =
                suite.runnable(only.as_deref()).cloned().collect();
            for skipped in suite.benchmarks.iter().filter(|d| d.skip) {
                info!(benchmark = %skipped.name, "skipped by definition");
            }
            if selected.is_empty() {
                warn!(only = ?only, "nothing to run");
            }
            selected
        }
        Commands::Exec {
            name,
            loop_iterations,
            command,
        } => {
            let mut argv = command.into_iter();
            let program = argv.next().context("missing worker program")?;
            let launch = LaunchSpec {
                args: argv.collect(),
                ..LaunchSpec::new(program)
            };
            vec![BenchmarkDefinition::new(name, launch).with_loop_iterations(loop_iterations)]
        }
    };

    info!(
        benchmarks = definitions.len(),
        trials = config.trials,
        warmup = config.warmup,
        sampler = %config.sampler,
        "starting energy-bench"
    );
    let meter = Meter::from_boxed(open_sampler(config.sampler));
    let mut controller = Controller::new(config, meter);

    let mut all_ok = true;
    for definition in &definitions {
        let batch = match controller.run_benchmark(definition).await {
            Ok(batch) => batch,
            Err(err) => {
                error!(benchmark = %definition.name, error = %err, "benchmark did not run");
                all_ok = false;
                continue;
            }
        };
        println!("{}", serde_json::to_string(&batch)?);
        if let Err(err) = batch.check() {
            error!(benchmark = %definition.name, error = %err, "benchmark failed");
            all_ok = false;
        }
    }
    Ok(all_ok)
}
