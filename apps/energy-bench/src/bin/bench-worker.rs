//! Demo worker with a handful of small built-in payloads.

use std::hint::black_box;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use energy_bench::worker::{self, WorkerArgs};

#[derive(Parser, Debug)]
#[command(name = "bench-worker")]
#[command(about = "Serves energy-bench trials with a built-in payload")]
struct Cli {
    #[command(flatten)]
    worker: WorkerArgs,

    #[arg(long, value_enum, default_value_t = PayloadKind::Empty)]
    payload: PayloadKind,

    /// Payload size: fibonacci index, sleep millis or element count
    #[arg(long, default_value_t = 20)]
    size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PayloadKind {
    Empty,
    Fib,
    Sleep,
    Mergesort,
    Fail,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let size = cli.size;
    match cli.payload {
        PayloadKind::Empty => worker::run_with_args(cli.worker, || -> anyhow::Result<()> { Ok(()) }),
        PayloadKind::Fib => worker::run_with_args(cli.worker, move || -> anyhow::Result<()> {
            black_box(fib(black_box(size)));
            Ok(())
        }),
        PayloadKind::Sleep => worker::run_with_args(cli.worker, move || -> anyhow::Result<()> {
            std::thread::sleep(Duration::from_millis(size));
            Ok(())
        }),
        PayloadKind::Mergesort => {
            let input = scrambled(size as usize);
            worker::run_with_args(cli.worker, move || -> anyhow::Result<()> {
                let mut data = input.clone();
                merge_sort(&mut data);
                anyhow::ensure!(data.windows(2).all(|w| w[0] <= w[1]), "output not sorted");
                black_box(data);
                Ok(())
            })
        }
        PayloadKind::Fail => worker::run_with_args(cli.worker, || -> anyhow::Result<()> {
            anyhow::bail!("payload configured to fail")
        }),
    }
}

fn fib(n: u64) -> u64 {
    if n < 2 {
        n
    } else {
        fib(n - 1) + fib(n - 2)
    }
}

/// Deterministic pseudo-random input so every trial sorts the same data.
fn scrambled(len: usize) -> Vec<u64> {
    let mut state = 0x2545_F491_4F6C_DD1Du64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state % 1_000_000
        })
        .collect()
}

fn merge_sort(data: &mut [u64]) {
    let len = data.len();
    if len < 2 {
        return;
    }
    let mid = len / 2;
    merge_sort(&mut data[..mid]);
    merge_sort(&mut data[mid..]);

    let mut merged = Vec::with_capacity(len);
    let (mut left, mut right) = (0, mid);
    while left < mid && right < len {
        if data[left] <= data[right] {
            merged.push(data[left]);
            left += 1;
        } else {
            merged.push(data[right]);
            right += 1;
        }
    }
    merged.extend_from_slice(&data[left..mid]);
    merged.extend_from_slice(&data[right..]);
    data.copy_from_slice(&merged);
}
