// Ring Experiment Runner - process-per-node supervision

use std::error::Error;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use ringq::{Fanout, RingLayout, StatsCollector, Token, UdpFanout};

use super::config::ExperimentConfig;
use super::stats::{RunSummary, SweepResults};

/// How often child exit status is polled during a run.
const CHILD_POLL: Duration = Duration::from_millis(250);

/// Grace period between a terminate request and a forced kill.
const KILL_GRACE: Duration = Duration::from_secs(1);

// ============================================================================
// Runner
// ============================================================================

/// Runs rings of increasing size until the configured maximum or the first
/// failure, whichever comes first.
pub struct ExperimentRunner {
    config: ExperimentConfig,
}

impl ExperimentRunner {
    pub fn new(config: ExperimentConfig) -> Self {
        Self { config }
    }

    pub fn run(self) -> SweepResults {
        let mut results = SweepResults::default();

        for n in self.config.start_n..=self.config.max_n {
            info!("running ring of n={}...", n);
            match self.run_single_ring(n) {
                Ok(summary) => {
                    info!(
                        "n={}: {} rounds, {} events, avg {:.6}s",
                        n, summary.rounds, summary.events, summary.avg_time
                    );
                    results.runs.push(summary);
                }
                Err(e) => {
                    // a failed size aborts further increases; partial
                    // results up to here are kept
                    error!("n={}: {}", n, e);
                    results.failed_at = Some((n, e.to_string()));
                    break;
                }
            }
        }

        results
    }

    fn run_single_ring(&self, n: usize) -> Result<RunSummary, Box<dyn Error>> {
        let mut layout = RingLayout::new(n);
        layout.base_port = self.config.base_port;
        layout.initial_probability = self.config.initial_probability;
        layout.silence_threshold = self.config.silence_threshold;
        layout.hop_delay = Duration::from_millis(self.config.hop_delay_ms);

        // subscribe before any node can publish
        let collector = StatsCollector::spawn(
            UdpFanout::telemetry().listen()?,
            UdpFanout::activity().listen()?,
        )?;

        let mut children: Vec<Child> = Vec::new();
        for i in 0..n {
            match self.spawn_node(&layout, i) {
                Ok(child) => children.push(child),
                Err(e) => {
                    cleanup_processes(&mut children);
                    collector.stop();
                    return Err(format!("failed to spawn node {}: {}", i, e).into());
                }
            }
        }

        // let the ring settle, then start the first token
        thread::sleep(Duration::from_millis(self.config.settle_ms));
        if let Err(e) = inject_token(&layout.node_addr(0)) {
            cleanup_processes(&mut children);
            collector.stop();
            return Err(format!("failed to inject initial token: {}", e).into());
        }

        let outcome = self.wait_for_ring(&mut children);
        if let Err(e) = outcome {
            cleanup_processes(&mut children);
            collector.stop();
            return Err(e);
        }

        let stats = collector.stop();
        RunSummary::from_stats(n, &stats).ok_or_else(|| "no telemetry observed".into())
    }

    fn spawn_node(&self, layout: &RingLayout, i: usize) -> Result<Child, Box<dyn Error>> {
        let successor = (i + 1) % layout.size;

        let mut command = Command::new(self.node_runner_path()?);
        command
            .arg("--id")
            .arg(i.to_string())
            .arg("--host")
            .arg(&layout.host)
            .arg("--port")
            .arg((layout.base_port as usize + i).to_string())
            .arg("--next-host")
            .arg(&layout.host)
            .arg("--next-port")
            .arg((layout.base_port as usize + successor).to_string())
            .arg("--initial-p")
            .arg(layout.initial_probability.to_string())
            .arg("--k")
            .arg(layout.silence_threshold.to_string())
            .arg("--hop-delay-ms")
            .arg(self.config.hop_delay_ms.to_string());

        if let Some(ref seed) = self.config.seed {
            command.arg("--seed").arg(seed);
        }

        Ok(command.spawn()?)
    }

    fn node_runner_path(&self) -> Result<PathBuf, Box<dyn Error>> {
        if let Some(ref path) = self.config.node_runner_bin {
            return Ok(PathBuf::from(path));
        }

        // default: the sibling binary of this executable
        let mut path = std::env::current_exe()?;
        path.pop();
        path.push("node_runner");
        Ok(path)
    }

    /// Block until every node process has exited, or fail on the wall-clock
    /// bound or the first abnormal exit.
    fn wait_for_ring(&self, children: &mut [Child]) -> Result<(), Box<dyn Error>> {
        let deadline = Instant::now() + Duration::from_secs(self.config.run_timeout_secs);

        loop {
            let mut all_done = true;
            for (i, child) in children.iter_mut().enumerate() {
                match child.try_wait()? {
                    Some(status) if !status.success() => {
                        return Err(format!("node {} exited abnormally: {}", i, status).into());
                    }
                    Some(_) => {}
                    None => all_done = false,
                }
            }

            if all_done {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(format!(
                    "ring did not complete within {}s",
                    self.config.run_timeout_secs
                )
                .into());
            }

            thread::sleep(CHILD_POLL);
        }
    }
}

// ============================================================================
// Process Cleanup
// ============================================================================

fn inject_token(addr: &str) -> Result<(), Box<dyn Error>> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.send_to(&Token::new().to_wire()?, addr)?;
    Ok(())
}

/// Terminate all remaining nodes: graceful signal first, forced kill after
/// a short grace period.
fn cleanup_processes(children: &mut [Child]) {
    for child in children.iter_mut() {
        if let Ok(None) = child.try_wait() {
            terminate(child);
        }
    }

    let deadline = Instant::now() + KILL_GRACE;
    while Instant::now() < deadline {
        if children
            .iter_mut()
            .all(|c| matches!(c.try_wait(), Ok(Some(_)) | Err(_)))
        {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }

    for child in children.iter_mut() {
        if let Ok(None) = child.try_wait() {
            warn!("killing unresponsive node process {}", child.id());
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
}
