//! The per-node token-processing state machine.
//!
//! A node owns one position in the ring: it blocks on token receipt, makes a
//! probabilistic activity decision, advances the ring-observed silence
//! counter, forwards the token to its successor, and decides local and
//! ring-wide termination. A background listener thread drains the activity
//! channel to catch resets caused by other nodes' events; the two activities
//! share exactly one mutable field, the [`SilenceCounter`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::rq_interface::{
    unix_now, ActivityRecord, EventSink, Fanout, FanoutListener, NodeEvent, NodeId, NoOpSink,
    RingError, Round, TelemetryRecord, Token, TokenTransport, DEFAULT_HOP_DELAY_MS,
};
use crate::rq_silence::SilenceCounter;

// ============================================================================
// Configuration
// ============================================================================

/// Immutable per-node configuration, fixed at creation.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: NodeId,

    /// Own listening address, in whatever form the chosen transport binds.
    pub listen_addr: String,

    /// Successor's address; successor(i) = (i+1) mod n in a ring of n.
    pub successor_addr: String,

    /// Initial event probability, in (0, 1]. Halved after every hop this
    /// node processes; decays toward zero but never reaches it.
    pub initial_probability: f64,

    /// Consecutive silent hops, ring-wide, required to terminate (k >= 1).
    pub silence_threshold: u64,

    /// Artificial delay inserted before each forward.
    pub hop_delay: Duration,

    /// Whether the deployment should inject the initial token at this node.
    pub inject_token: bool,
}

impl NodeConfig {
    pub fn new(id: NodeId, listen_addr: &str, successor_addr: &str) -> Self {
        Self {
            id,
            listen_addr: listen_addr.to_string(),
            successor_addr: successor_addr.to_string(),
            initial_probability: 0.5,
            silence_threshold: 5,
            hop_delay: Duration::from_millis(DEFAULT_HOP_DELAY_MS),
            inject_token: false,
        }
    }
}

// ============================================================================
// Probabilistic Decision
// ============================================================================

/// Source of uniform draws in [0, 1) for the per-hop activity decision.
pub trait Draw: Send {
    fn draw(&mut self) -> f64;
}

/// Production draw source backed by a seedable RNG.
pub struct StdDraw(StdRng);

impl StdDraw {
    pub fn from_entropy() -> Self {
        Self(StdRng::from_entropy())
    }

    /// Seeded draws for reproducible runs.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self(StdRng::from_seed(seed))
    }
}

impl Draw for StdDraw {
    fn draw(&mut self) -> f64 {
        self.0.gen::<f64>()
    }
}

/// Deterministic draw source. `FixedDraw(1.0)` never emits an event;
/// `FixedDraw(0.0)` emits on every hop.
pub struct FixedDraw(pub f64);

impl Draw for FixedDraw {
    fn draw(&mut self) -> f64 {
        self.0
    }
}

// ============================================================================
// Node State Machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    WaitingForToken,
    Processing,
    Forwarding,
    Stopped,
}

/// Result of one per-hop step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopOutcome {
    /// Normal hop; the node re-enters its receive loop.
    Forwarded,
    /// This node detected ring-wide quiescence and stopped.
    Detected,
    /// The terminal token was relayed onward unchanged; the node stopped.
    Relayed,
}

/// How a node's run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    DetectedQuiescence { round: Round, silent_rounds: u64 },
    RelayedTermination { round: Round },
}

/// Summary returned by [`RingNode::run`] after a clean shutdown.
#[derive(Debug, Clone, Copy)]
pub struct NodeReport {
    pub node: NodeId,
    pub rounds_processed: u64,
    pub events_emitted: u64,
    pub outcome: RunOutcome,
}

pub struct RingNode<T: TokenTransport, F: Fanout> {
    config: NodeConfig,
    transport: T,
    activity: F,
    telemetry: F,
    probability: f64,
    silence: SilenceCounter,
    draw: Box<dyn Draw>,
    event_sink: Box<dyn EventSink + Send>,
    state: NodeState,
    rounds_processed: u64,
    events_emitted: u64,
    outcome: Option<RunOutcome>,
}

impl<T: TokenTransport, F: Fanout> RingNode<T, F> {
    /// Create a node with entropy-seeded draws and the default NoOpSink.
    pub fn new(config: NodeConfig, transport: T, activity: F, telemetry: F) -> Self {
        Self::new_with_sink(config, transport, activity, telemetry, Box::new(NoOpSink))
    }

    /// Create a node with a custom event sink for debugging/analysis.
    pub fn new_with_sink(
        config: NodeConfig,
        transport: T,
        activity: F,
        telemetry: F,
        event_sink: Box<dyn EventSink + Send>,
    ) -> Self {
        let probability = config.initial_probability;
        Self {
            config,
            transport,
            activity,
            telemetry,
            probability,
            silence: SilenceCounter::new(),
            draw: Box::new(StdDraw::from_entropy()),
            event_sink,
            state: NodeState::WaitingForToken,
            rounds_processed: 0,
            events_emitted: 0,
            outcome: None,
        }
    }

    /// Replace the draw source (seeded runs, deterministic tests).
    pub fn set_draw(&mut self, draw: Box<dyn Draw>) {
        self.draw = draw;
    }

    pub fn id(&self) -> NodeId {
        self.config.id
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn current_probability(&self) -> f64 {
        self.probability
    }

    /// Run the node to completion: spawn the activity listener, loop on
    /// token receipt until the terminal condition, then stop the listener
    /// and join it so the bound listening resource is released
    /// deterministically.
    ///
    /// Transport errors are fatal: no retry, no reconnection. The listener
    /// is joined on the error path too.
    pub fn run(mut self) -> Result<NodeReport, RingError> {
        let stop = Arc::new(AtomicBool::new(false));
        let listener = spawn_activity_listener(
            self.config.id,
            self.activity.listen()?,
            self.silence.clone(),
            Arc::clone(&stop),
        )?;

        let result = self.token_loop();

        stop.store(true, Ordering::Relaxed);
        if listener.join().is_err() {
            warn!("node {}: activity listener panicked", self.config.id);
        }

        result
    }

    fn token_loop(&mut self) -> Result<NodeReport, RingError> {
        info!(
            "node {}: listening on {}, successor {}",
            self.config.id, self.config.listen_addr, self.config.successor_addr
        );

        while self.state != NodeState::Stopped {
            self.state = NodeState::WaitingForToken;
            let mut token = self.transport.receive()?;

            self.state = NodeState::Processing;
            self.event_sink.log(
                self.config.id,
                NodeEvent::TokenReceived {
                    round: token.round,
                    silent_rounds: token.silent_rounds,
                },
            );
            debug!(
                "node {}: token in round {} ({} silent)",
                self.config.id, token.round, token.silent_rounds
            );

            self.process_token(&mut token)?;
        }

        let outcome = match self.outcome {
            Some(outcome) => outcome,
            None => return Err(RingError::Disconnected),
        };

        info!(
            "node {}: stopped after {} rounds, {} events",
            self.config.id, self.rounds_processed, self.events_emitted
        );

        Ok(NodeReport {
            node: self.config.id,
            rounds_processed: self.rounds_processed,
            events_emitted: self.events_emitted,
            outcome,
        })
    }

    /// One per-hop step, given a just-received token.
    ///
    /// Exposed for deterministic single-step tests; `run` drives it in a
    /// loop. Mutates the token in place and forwards it on every path.
    pub fn process_token(&mut self, token: &mut Token) -> Result<HopOutcome, RingError> {
        let k = self.config.silence_threshold;

        // Termination relay: the previous node already detected ring-wide
        // silence; pass the signal on unchanged and exit. Every node sees
        // the terminal token exactly once before the ring winds down.
        if token.silent_rounds >= k {
            self.event_sink
                .log(self.config.id, NodeEvent::TerminationRelayed { round: token.round });
            info!(
                "node {}: terminal token ({} silent rounds), relaying and stopping",
                self.config.id, token.silent_rounds
            );
            self.forward(token)?;
            self.state = NodeState::Stopped;
            self.outcome = Some(RunOutcome::RelayedTermination { round: token.round });
            return Ok(HopOutcome::Relayed);
        }

        self.rounds_processed += 1;

        // Events only ever happen at the token holder, so the count carried
        // by the token is exact at receipt; the local cell may hold a stale
        // broadcast reset from between visits.
        self.silence.adopt(token.silent_rounds);

        let r = self.draw.draw();
        if r < self.probability {
            let record = ActivityRecord {
                origin: self.config.id,
                round: token.round,
            };
            self.activity.publish(&record.to_wire()?)?;
            self.silence.reset();
            self.events_emitted += 1;
            self.event_sink
                .log(self.config.id, NodeEvent::ActivityEmitted { round: token.round });
            info!("node {}: activity in round {}", self.config.id, token.round);
        } else {
            let observed = self.silence.record_silent_hop();
            self.event_sink
                .log(self.config.id, NodeEvent::SilentHop { observed });
        }

        // Local decay, independent of the ring-wide counter.
        self.probability /= 2.0;

        token.round += 1;

        // Terminal comparison from a single locked snapshot; a concurrent
        // reset landing after it yields a relay the ring still honors.
        let observed = self.silence.observe();
        token.silent_rounds = observed;

        if observed >= k {
            self.event_sink.log(
                self.config.id,
                NodeEvent::QuiescenceDetected {
                    round: token.round,
                    silent_rounds: observed,
                },
            );
            info!(
                "node {}: quiescence detected in round {} ({} silent rounds)",
                self.config.id, token.round, observed
            );
            self.forward(token)?;
            self.state = NodeState::Stopped;
            self.outcome = Some(RunOutcome::DetectedQuiescence {
                round: token.round,
                silent_rounds: observed,
            });
            return Ok(HopOutcome::Detected);
        }

        self.forward(token)?;
        self.state = NodeState::WaitingForToken;
        Ok(HopOutcome::Forwarded)
    }

    /// Common forwarding path: hop delay, round-time telemetry, re-stamp,
    /// transmit. Applies to normal, detecting, and relay forwards alike.
    fn forward(&mut self, token: &mut Token) -> Result<(), RingError> {
        self.state = NodeState::Forwarding;
        thread::sleep(self.config.hop_delay);

        let now = unix_now();
        let duration = now - token.timestamp;
        let record = TelemetryRecord::RoundTime { duration };
        self.telemetry.publish(&record.to_wire()?)?;
        self.event_sink.log(
            self.config.id,
            NodeEvent::TokenForwarded {
                round: token.round,
                duration_secs: duration,
            },
        );

        token.timestamp = now;
        self.transport.forward(token)
    }
}

// ============================================================================
// Activity Listener
// ============================================================================

/// Poll interval for the listener thread; short so a stop request is
/// observed promptly.
const LISTENER_POLL: Duration = Duration::from_millis(200);

fn spawn_activity_listener<L: FanoutListener + 'static>(
    node: NodeId,
    mut listener: L,
    silence: SilenceCounter,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, RingError> {
    let handle = thread::Builder::new()
        .name(format!("activity-listener-{}", node))
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                match listener.poll(LISTENER_POLL) {
                    Ok(Some(payload)) => match ActivityRecord::from_wire(&payload) {
                        Ok(record) => {
                            debug!(
                                "node {}: activity from {} in round {}",
                                node, record.origin, record.round
                            );
                            // idempotent: resetting an already-zero counter
                            // is a no-op
                            silence.reset();
                        }
                        Err(e) => {
                            warn!("node {}: ignoring undecodable activity payload: {}", node, e)
                        }
                    },
                    Ok(None) => {}
                    Err(e) => {
                        debug!("node {}: activity channel closed: {}", node, e);
                        break;
                    }
                }
            }
        })?;

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rq_interface::FanoutListener;
    use crate::rq_memory::{MemoryFanout, MemoryNet, MemoryTokenLink};

    const POLL: Duration = Duration::from_millis(100);

    fn test_config(id: NodeId, k: u64) -> NodeConfig {
        let mut config = NodeConfig::new(id, &format!("node-{}", id), &format!("node-{}", id));
        config.silence_threshold = k;
        config.hop_delay = Duration::from_millis(1);
        config
    }

    fn test_node(
        config: NodeConfig,
        net: &MemoryNet,
        draw: f64,
    ) -> RingNode<MemoryTokenLink, MemoryFanout> {
        let link = MemoryTokenLink::bind(net, &config.listen_addr, &config.successor_addr).unwrap();
        let mut node = RingNode::new(config, link, MemoryFanout::new(), MemoryFanout::new());
        node.set_draw(Box::new(FixedDraw(draw)));
        node
    }

    #[test]
    fn test_silent_hop_advances_counter_and_round() {
        let net = MemoryNet::new();
        let mut node = test_node(test_config(0, 5), &net, 1.0);

        let mut token = Token::new();
        let before = token.timestamp;
        let outcome = node.process_token(&mut token).unwrap();

        assert_eq!(outcome, HopOutcome::Forwarded);
        assert_eq!(token.round, 1);
        assert_eq!(token.silent_rounds, 1);
        assert!(token.timestamp >= before);
        assert_eq!(node.state(), NodeState::WaitingForToken);
    }

    #[test]
    fn test_round_strictly_increases_per_processed_hop() {
        let net = MemoryNet::new();
        let mut node = test_node(test_config(0, 100), &net, 1.0);

        let mut token = Token::new();
        for expected in 1..=10u64 {
            node.process_token(&mut token).unwrap();
            assert_eq!(token.round, expected);
        }
    }

    #[test]
    fn test_emitting_hop_resets_silence_and_broadcasts() {
        let net = MemoryNet::new();
        let activity = MemoryFanout::new();
        let mut subscriber = activity.listen().unwrap();

        let config = test_config(3, 5);
        let link = MemoryTokenLink::bind(&net, "node-3", "node-3").unwrap();
        let mut node = RingNode::new(config, link, activity, MemoryFanout::new());
        node.set_draw(Box::new(FixedDraw(0.0)));

        let mut token = Token {
            round: 4,
            silent_rounds: 3,
            timestamp: unix_now(),
        };
        let outcome = node.process_token(&mut token).unwrap();

        assert_eq!(outcome, HopOutcome::Forwarded);
        // reset beats the adopted count of 3
        assert_eq!(token.silent_rounds, 0);
        assert_eq!(token.round, 5);

        let payload = subscriber.poll(POLL).unwrap().expect("activity record");
        let record = ActivityRecord::from_wire(&payload).unwrap();
        assert_eq!(record.origin, 3);
        assert_eq!(record.round, 4); // round as received, before the increment
    }

    #[test]
    fn test_probability_halves_but_never_reaches_zero() {
        let net = MemoryNet::new();
        let mut config = test_config(0, 1000);
        config.initial_probability = 0.5;
        let mut node = test_node(config, &net, 1.0);

        let mut token = Token::new();
        for hop in 1..=20u32 {
            node.process_token(&mut token).unwrap();
            let expected = 0.5 / f64::powi(2.0, hop as i32);
            assert!((node.current_probability() - expected).abs() < 1e-12);
            assert!(node.current_probability() > 0.0);
        }
    }

    #[test]
    fn test_terminal_token_is_relayed_unchanged() {
        let net = MemoryNet::new();
        let successor = net.bind("succ").unwrap();

        let mut config = test_config(1, 5);
        config.successor_addr = "succ".to_string();
        let link = MemoryTokenLink::bind(&net, "node-1", "succ").unwrap();
        let mut node = RingNode::new(config, link, MemoryFanout::new(), MemoryFanout::new());
        node.set_draw(Box::new(FixedDraw(0.0))); // must not even be consulted

        let mut token = Token {
            round: 12,
            silent_rounds: 5,
            timestamp: unix_now(),
        };
        let outcome = node.process_token(&mut token).unwrap();

        assert_eq!(outcome, HopOutcome::Relayed);
        assert_eq!(node.state(), NodeState::Stopped);

        let relayed = Token::from_wire(&successor.recv().unwrap()).unwrap();
        assert_eq!(relayed.round, 12);
        assert_eq!(relayed.silent_rounds, 5);
    }

    #[test]
    fn test_detection_sets_exact_threshold_on_token() {
        let net = MemoryNet::new();
        let mut node = test_node(test_config(0, 3), &net, 1.0);

        let mut token = Token::new();
        assert_eq!(node.process_token(&mut token).unwrap(), HopOutcome::Forwarded);
        assert_eq!(node.process_token(&mut token).unwrap(), HopOutcome::Forwarded);
        let outcome = node.process_token(&mut token).unwrap();

        assert_eq!(outcome, HopOutcome::Detected);
        assert_eq!(token.silent_rounds, 3);
        assert_eq!(node.state(), NodeState::Stopped);
    }

    #[test]
    fn test_broadcast_reset_defers_detection() {
        let net = MemoryNet::new();
        let mut node = test_node(test_config(0, 3), &net, 1.0);

        let mut token = Token::new();
        node.process_token(&mut token).unwrap();
        node.process_token(&mut token).unwrap();
        assert_eq!(token.silent_rounds, 2);

        // an activity record from elsewhere lands between visits
        token.silent_rounds = 0;

        let outcome = node.process_token(&mut token).unwrap();
        assert_eq!(outcome, HopOutcome::Forwarded);
        assert_eq!(token.silent_rounds, 1);
    }

    #[test]
    fn test_single_node_ring_terminates_within_k_self_hops() {
        let net = MemoryNet::new();
        let node = test_node(test_config(0, 4), &net, 1.0);

        let injector = net.clone();
        let handle = thread::spawn(move || node.run());

        injector
            .send_to("node-0", &Token::new().to_wire().unwrap())
            .unwrap();

        let report = handle.join().unwrap().unwrap();
        assert_eq!(report.rounds_processed, 4);
        assert_eq!(report.events_emitted, 0);
        match report.outcome {
            RunOutcome::DetectedQuiescence { silent_rounds, .. } => assert_eq!(silent_rounds, 4),
            other => panic!("expected detection, got {:?}", other),
        }
    }

    #[test]
    fn test_quiet_ring_terminates_in_n_plus_k_hops() {
        let n = 4u64;
        let k = 5u64;
        let net = MemoryNet::new();
        let activity = MemoryFanout::new();
        let telemetry = MemoryFanout::new();

        let mut handles = Vec::new();
        for id in 0..n {
            let mut config = NodeConfig::new(
                id,
                &format!("node-{}", id),
                &format!("node-{}", (id + 1) % n),
            );
            config.silence_threshold = k;
            config.hop_delay = Duration::from_millis(1);

            let link =
                MemoryTokenLink::bind(&net, &config.listen_addr, &config.successor_addr).unwrap();
            let mut node = RingNode::new(config, link, activity.clone(), telemetry.clone());
            node.set_draw(Box::new(FixedDraw(1.0)));
            handles.push(thread::spawn(move || node.run()));
        }

        net.send_to("node-0", &Token::new().to_wire().unwrap())
            .unwrap();

        let reports: Vec<NodeReport> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();

        let total_hops: u64 = reports.iter().map(|r| r.rounds_processed).sum();
        assert_eq!(total_hops, k); // k processed hops ring-wide, then relays

        let detectors: Vec<&NodeReport> = reports
            .iter()
            .filter(|r| matches!(r.outcome, RunOutcome::DetectedQuiescence { .. }))
            .collect();
        assert_eq!(detectors.len(), 1);
        match detectors[0].outcome {
            RunOutcome::DetectedQuiescence { silent_rounds, .. } => assert_eq!(silent_rounds, k),
            _ => unreachable!(),
        }

        assert_eq!(
            reports.iter().map(|r| r.events_emitted).sum::<u64>(),
            0,
            "FixedDraw(1.0) must never emit"
        );
    }
}
