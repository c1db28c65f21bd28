// Ring Experiment Configuration

use ringq::DEFAULT_HOP_DELAY_MS;

// ============================================================================
// Main Configuration
// ============================================================================

/// Configuration for one ring-size sweep.
///
/// A sweep runs complete rings for n = start_n ..= max_n and stops at the
/// first ring size that fails (timeout or abnormal node exit); results up to
/// that point are preserved.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Smallest ring size to run
    pub start_n: usize,

    /// Largest ring size to attempt
    pub max_n: usize,

    /// Initial event probability handed to every node
    pub initial_probability: f64,

    /// Consecutive silent rounds required to terminate
    pub silence_threshold: u64,

    /// Artificial delay before each token forward (milliseconds)
    pub hop_delay_ms: u64,

    /// Settle time after spawning the nodes, before injecting the token
    /// (milliseconds)
    pub settle_ms: u64,

    /// Wall-clock bound per run; exceeding it is a hard failure for that
    /// ring size (seconds)
    pub run_timeout_secs: u64,

    /// Node 0 listens on base_port; node i on base_port + i
    pub base_port: u16,

    /// CSV output file path
    pub csv_path: Option<String>,

    /// Experiment seed as hex; forwarded to the nodes for reproducible draws
    pub seed: Option<String>,

    /// Override for the node_runner binary path (default: next to this
    /// executable)
    pub node_runner_bin: Option<String>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            start_n: 2,
            max_n: 16,
            initial_probability: 0.5,
            silence_threshold: 5,
            hop_delay_ms: DEFAULT_HOP_DELAY_MS,
            settle_ms: 2000,
            run_timeout_secs: 60,
            base_port: 6000,
            csv_path: Some("experiment_results.csv".to_string()),
            seed: None,
            node_runner_bin: None,
        }
    }
}

impl ExperimentConfig {
    pub fn summary_line(&self) -> String {
        format!(
            "n={}..{}, p0={}, k={}, hop_delay={}ms, timeout={}s",
            self.start_n,
            self.max_n,
            self.initial_probability,
            self.silence_threshold,
            self.hop_delay_ms,
            self.run_timeout_secs
        )
    }
}
