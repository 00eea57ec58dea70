//! Demo: two workers that churn through a three-level call chain, then
//! block forever on a gate that never opens. The watchdog notices once
//! their fingerprints stay frozen for the full confirmation window and
//! writes a symbolized report.

use anyhow::Result;
use clap::Parser;
use hangwatch::{Hangwatch, TrackedThread};
use parking_lot::{Condvar, Mutex};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Hangwatch - Sampling Deadlock Watchdog (demo: two workers freeze on purpose)"
)]
struct Cli {
    /// Write the hang report to this file instead of stderr
    #[arg(long)]
    report: Option<PathBuf>,

    /// Seconds of useful work before the workers block forever
    #[arg(long, default_value_t = 3.0)]
    stall_after: f64,

    /// Watchdog polling interval in milliseconds
    #[arg(long, default_value_t = 100)]
    tick_ms: u64,

    /// Consecutive all-idle rounds required to declare a deadlock
    #[arg(long, default_value_t = 50)]
    rounds: u32,
}

/// A gate that closes after a deadline and then never opens again
struct Gate {
    deadline: Instant,
    lock: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    fn new(stall_after: Duration) -> Self {
        Gate {
            deadline: Instant::now() + stall_after,
            lock: Mutex::new(false),
            opened: Condvar::new(),
        }
    }

    fn closed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn wait_forever(&self) {
        let mut open = self.lock.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
    }
}

/// Busywork with data-dependent recursion depth, so a sampled stack keeps
/// changing while the worker is genuinely active
#[inline(never)]
fn churn(n: u64) -> u64 {
    if n < 2 {
        n
    } else {
        churn(n - 1).wrapping_add(churn(n - 2))
    }
}

#[inline(never)]
fn level2(gate: &Gate) {
    if gate.closed() {
        gate.wait_forever();
    }
    std::hint::black_box(churn(18));
}

#[inline(never)]
fn level1(gate: &Gate) {
    level2(gate);
}

#[inline(never)]
fn level0(gate: &Gate) {
    level1(gate);
}

fn worker(gate: Arc<Gate>) {
    loop {
        level0(&gate);
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut builder = Hangwatch::new()
        .with_tick(Duration::from_millis(cli.tick_ms))
        .with_confirmation_rounds(cli.rounds);
    if let Some(path) = &cli.report {
        builder = builder.with_report_file(path);
    }
    let detector = builder.build()?;

    let gate = Arc::new(Gate::new(Duration::from_secs_f64(cli.stall_after)));
    let _workers: Vec<TrackedThread<()>> = (0..2)
        .map(|index| {
            let gate = Arc::clone(&gate);
            TrackedThread::spawn(&detector, format!("worker-{index}"), move || worker(gate))
        })
        .collect();

    detector.run()?;
    log::info!(
        "two workers running; they will freeze after {:.1}s",
        cli.stall_after
    );

    // The monitor exits on its own once it has declared the deadlock and
    // written the report.
    detector.wait_until_stopped();
    Ok(())
}
