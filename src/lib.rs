//! # ringq - Probabilistic Token Ring with Quiescence Detection
//!
//! A Rust implementation of a token-passing ring that terminates on global
//! quiescence. A single token circulates; every node that holds it makes a
//! probabilistic decision to broadcast an activity event, and the ring
//! collectively detects k consecutive silent hops and shuts down.
//!
//! ## Core Components
//!
//! - **RingNode**: the per-node state machine - receive, decide, forward,
//!   terminate - plus the background activity listener
//! - **SilenceCounter**: the one mutable field shared between a node's two
//!   concurrent activities, behind a single lock
//! - **Token / ActivityRecord / TelemetryRecord**: the wire records
//! - **MemoryNet / UdpTokenLink**: in-process and UDP datagram transports
//! - **StatsCollector**: side-channel subscriber aggregating hop latency and
//!   event counts
//!
//! ## Usage with a Deployment Layer
//!
//! This library provides transport-agnostic ring components. You need to:
//! 1. Pick a transport (in-memory for threads, UDP for processes)
//! 2. Create a `RingNode` per ring position from a `RingLayout`
//! 3. Start the nodes and inject `Token::new()` at node 0
//! 4. Wait for every node to stop (or give up on a run timeout)
//!
//! ```no_run
//! use ringq::{MemoryFanout, MemoryNet, MemoryTokenLink, NodeConfig, RingNode, Token};
//!
//! let net = MemoryNet::new();
//! let config = NodeConfig::new(0, "node-0", "node-0");
//! let link = MemoryTokenLink::bind(&net, "node-0", "node-0").unwrap();
//! let node = RingNode::new(config, link, MemoryFanout::new(), MemoryFanout::new());
//!
//! // inject the initial token, then drive the node to completion
//! net.send_to("node-0", &Token::new().to_wire().unwrap()).unwrap();
//! let report = node.run().unwrap();
//! ```
//!
//! ## Orchestration
//!
//! For running full rings as OS processes and sweeping ring sizes, see the
//! `node_runner` and `experiment_runner` binaries in `simulator/`.

// Core ring protocol modules
pub mod rq_interface;
pub mod rq_node;
pub mod rq_ring;
pub mod rq_silence;
pub mod rq_stats;

// Transport implementations
pub mod rq_memory;
pub mod rq_udp;

// Re-export commonly used types
pub use rq_interface::{
    ActivityRecord, EventSink, Fanout, FanoutListener, NodeEvent, NodeId, NoOpSink, RingError,
    Round, TelemetryRecord, Token, TokenTransport, DEFAULT_HOP_DELAY_MS,
};
pub use rq_memory::{MemoryFanout, MemoryNet, MemorySocket, MemoryTokenLink};
pub use rq_node::{
    Draw, FixedDraw, HopOutcome, NodeConfig, NodeReport, NodeState, RingNode, RunOutcome, StdDraw,
};
pub use rq_ring::RingLayout;
pub use rq_silence::SilenceCounter;
pub use rq_stats::{RunStats, StatsCollector};
pub use rq_udp::{UdpFanout, UdpGroupListener, UdpTokenLink};
