// Ring Experiment Statistics

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use ringq::RunStats;

// ============================================================================
// Per-Run Summary
// ============================================================================

/// Aggregated side-channel observations for one completed ring.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Ring size
    pub n: usize,

    /// Observed hops (round-time records)
    pub rounds: usize,

    /// Observed activity events
    pub events: u64,

    /// Hop duration extremes and mean, in seconds
    pub min_time: f64,
    pub max_time: f64,
    pub avg_time: f64,
}

impl RunSummary {
    /// Build a summary from collected stats. `None` when no telemetry was
    /// observed - a run that produced nothing is a failure, not a zero row.
    pub fn from_stats(n: usize, stats: &RunStats) -> Option<Self> {
        Some(Self {
            n,
            rounds: stats.rounds(),
            events: stats.events,
            min_time: stats.min_duration()?,
            max_time: stats.max_duration()?,
            avg_time: stats.mean_duration()?,
        })
    }

    fn csv_row(&self) -> String {
        format!(
            "{},{},{},{:.6},{:.6},{:.6}",
            self.n, self.rounds, self.events, self.min_time, self.max_time, self.avg_time
        )
    }
}

// ============================================================================
// Sweep Results
// ============================================================================

/// Everything a sweep produced, including where (and why) it stopped.
#[derive(Debug, Clone, Default)]
pub struct SweepResults {
    pub runs: Vec<RunSummary>,

    /// First failing ring size and the failure description, if any
    pub failed_at: Option<(usize, String)>,
}

impl SweepResults {
    /// Largest ring size that completed successfully.
    pub fn max_successful_n(&self) -> Option<usize> {
        self.runs.last().map(|r| r.n)
    }

    /// Print summary to console
    pub fn print_summary(&self) {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║    RING SWEEP RESULTS                                  ║");
        println!("╚════════════════════════════════════════════════════════╝\n");

        if self.runs.is_empty() {
            println!("No successful runs.");
        } else {
            println!(
                "{:>5} {:>8} {:>8} {:>10} {:>10} {:>10}",
                "n", "rounds", "events", "min_time", "max_time", "avg_time"
            );
            for run in &self.runs {
                println!(
                    "{:>5} {:>8} {:>8} {:>10.6} {:>10.6} {:>10.6}",
                    run.n, run.rounds, run.events, run.min_time, run.max_time, run.avg_time
                );
            }
        }

        if let Some((n, ref reason)) = self.failed_at {
            println!("\nSweep stopped at n={}: {}", n, reason);
        }
        if let Some(n) = self.max_successful_n() {
            println!("\nMaximum successful n: {}", n);
        }
        println!();
    }

    /// Write the per-run rows as CSV.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        writeln!(writer, "n,rounds,events,min_time,max_time,avg_time")?;
        for run in &self.runs {
            writeln!(writer, "{}", run.csv_row())?;
        }

        writer.flush()
    }
}
