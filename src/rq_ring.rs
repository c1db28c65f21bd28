//! Ring topology helper: builds the N node configurations the coordinator
//! starts, with successor(i) = (i+1) mod N and distinct per-node addresses.
//!
//! How the nodes are physically instantiated - threads over the in-memory
//! transport, OS processes over UDP, remote hosts - is a deployment
//! decision made by the coordinator, not here.

use std::time::Duration;

use crate::rq_interface::{NodeId, DEFAULT_HOP_DELAY_MS};
use crate::rq_node::NodeConfig;

/// Parameters shared by every node of one ring.
#[derive(Debug, Clone)]
pub struct RingLayout {
    pub size: usize,
    pub host: String,
    pub base_port: u16,
    pub initial_probability: f64,
    pub silence_threshold: u64,
    pub hop_delay: Duration,
}

impl RingLayout {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            host: "127.0.0.1".to_string(),
            base_port: 6000,
            initial_probability: 0.5,
            silence_threshold: 5,
            hop_delay: Duration::from_millis(DEFAULT_HOP_DELAY_MS),
        }
    }

    /// Address of node `i`: `host:base_port + i`.
    pub fn node_addr(&self, i: usize) -> String {
        format!("{}:{}", self.host, self.base_port as usize + i)
    }

    /// The full set of node configurations. The token is injected at
    /// node 0; a ring of size 1 is degenerate (successor = self) and still
    /// satisfies the termination contract.
    pub fn configs(&self) -> Vec<NodeConfig> {
        (0..self.size)
            .map(|i| {
                let successor = (i + 1) % self.size;
                let mut config = NodeConfig::new(
                    i as NodeId,
                    &self.node_addr(i),
                    &self.node_addr(successor),
                );
                config.initial_probability = self.initial_probability;
                config.silence_threshold = self.silence_threshold;
                config.hop_delay = self.hop_delay;
                config.inject_token = i == 0;
                config
            })
            .collect()
    }
}
