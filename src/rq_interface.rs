// all the same numeric type to allow casting/interop with wire formats
pub type NodeId = u64;
pub type Round = u64;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Artificial delay before each token forward, in milliseconds.
/// Keeps the ring observable and bounds the message rate.
pub const DEFAULT_HOP_DELAY_MS: u64 = 100;

/// Wall-clock seconds since the Unix epoch, as carried in `Token::timestamp`.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ============================================================================
// Wire Records
// ============================================================================

/// The single message whose circulation drives the ring.
///
/// Exactly one token is in flight in a healthy ring. `round` counts processed
/// hops and never decreases; `silent_rounds` mirrors the ring-observed count
/// of consecutive hops without an activity event. `timestamp` is stamped by
/// the sender immediately before transmission and is used by the next node to
/// compute the hop duration - the receiver must not touch it before that
/// computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub round: Round,
    pub silent_rounds: u64,
    pub timestamp: f64,
}

impl Token {
    /// The initial token injected at node 0 by the coordinator.
    pub fn new() -> Self {
        Self {
            round: 0,
            silent_rounds: 0,
            timestamp: unix_now(),
        }
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, RingError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_wire(payload: &[u8]) -> Result<Self, RingError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

/// Broadcast announcement of a node's probabilistic activity event.
///
/// Delivered to every node (including the emitter) and to the stats
/// collector over the activity channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub origin: NodeId,
    pub round: Round,
}

impl ActivityRecord {
    pub fn to_wire(&self) -> Result<Vec<u8>, RingError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_wire(payload: &[u8]) -> Result<Self, RingError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Observability record published on the telemetry channel.
///
/// Self-describing on the wire (`{"type": "round_time", ...}`) so collectors
/// can skip unrelated payloads on a shared group channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryRecord {
    RoundTime { duration: f64 },
}

impl TelemetryRecord {
    pub fn to_wire(&self) -> Result<Vec<u8>, RingError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_wire(payload: &[u8]) -> Result<Self, RingError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Crate-wide error type.
///
/// Transport failures are fatal to the node that hits them; decode failures
/// on broadcast channels are logged and skipped at the consumption site and
/// never propagate past it.
#[derive(Debug, Error)]
pub enum RingError {
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),

    /// The listening address is already bound. Fatal at node startup.
    #[error("address already in use: {0}")]
    AddrInUse(String),

    #[error("undecodable payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// An in-memory endpoint was torn down while still in use.
    #[error("endpoint disconnected")]
    Disconnected,
}

// ============================================================================
// Transport Seams
// ============================================================================

/// Point-to-point token channel between a node and its successor.
///
/// The model is an unordered, best-effort, at-most-once datagram: `forward`
/// may silently drop (the ring surfaces a lost token only through the
/// coordinator's run timeout), and `receive` blocks until the next decodable
/// token arrives. Implementations skip undecodable datagrams after logging
/// them - the channel stays open.
pub trait TokenTransport {
    fn forward(&mut self, token: &Token) -> Result<(), RingError>;

    fn receive(&mut self) -> Result<Token, RingError>;
}

/// One end of a broadcast subscription.
///
/// `poll` returns the next raw payload, or `None` on timeout so the owning
/// thread can observe its shutdown flag between waits. Payloads are
/// undecoded bytes; group channels may carry traffic from unrelated sources.
pub trait FanoutListener: Send {
    fn poll(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, RingError>;
}

/// Best-effort broadcast capability for one logical channel.
///
/// Delivery is at-most-once and unordered, including across messages from a
/// single publisher; the publisher may receive its own messages. Consumers
/// must treat missed or duplicate payloads as acceptable, not exceptional.
pub trait Fanout {
    type Listener: FanoutListener + 'static;

    fn publish(&self, payload: &[u8]) -> Result<(), RingError>;

    fn listen(&self) -> Result<Self::Listener, RingError>;
}

// ============================================================================
// Event Logging System
// ============================================================================

/// Events emitted by a node's state machine for debugging and analysis
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Token received from the predecessor
    TokenReceived { round: Round, silent_rounds: u64 },
    /// Probabilistic draw succeeded, activity broadcast
    ActivityEmitted { round: Round },
    /// Hop completed without an event; counter advanced
    SilentHop { observed: u64 },
    /// This node detected ring-wide quiescence
    QuiescenceDetected { round: Round, silent_rounds: u64 },
    /// Terminal token relayed onward unchanged
    TerminationRelayed { round: Round },
    /// Token sent to the successor
    TokenForwarded { round: Round, duration_secs: f64 },
}

/// Trait for consuming node events
pub trait EventSink {
    fn log(&mut self, node: NodeId, event: NodeEvent);
}

/// No-op event sink for production use (zero overhead)
pub struct NoOpSink;

impl EventSink for NoOpSink {
    #[inline(always)]
    fn log(&mut self, _node: NodeId, _event: NodeEvent) {
        // Intentionally empty - compiler should optimize this away
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_wire_round_trip() {
        let token = Token {
            round: 7,
            silent_rounds: 3,
            timestamp: 1723014000.25,
        };

        let wire = token.to_wire().unwrap();
        let decoded = Token::from_wire(&wire).unwrap();

        // Field-for-field equality, timestamp included - the receiver is not
        // allowed to mutate it before the duration computation is captured.
        assert_eq!(decoded.round, 7);
        assert_eq!(decoded.silent_rounds, 3);
        assert_eq!(decoded.timestamp, 1723014000.25);
        assert_eq!(decoded, token);
    }

    #[test]
    fn test_token_wire_field_names() {
        let token = Token {
            round: 1,
            silent_rounds: 0,
            timestamp: 2.5,
        };
        let wire = String::from_utf8(token.to_wire().unwrap()).unwrap();

        assert!(wire.contains("\"round\""));
        assert!(wire.contains("\"silent_rounds\""));
        assert!(wire.contains("\"timestamp\""));
    }

    #[test]
    fn test_telemetry_self_describing_tag() {
        let record = TelemetryRecord::RoundTime { duration: 0.104 };
        let wire = String::from_utf8(record.to_wire().unwrap()).unwrap();

        assert!(wire.contains("\"type\":\"round_time\""));

        let decoded =
            TelemetryRecord::from_wire(br#"{"type":"round_time","duration":0.104}"#).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_activity_record_round_trip() {
        let record = ActivityRecord { origin: 2, round: 11 };
        let decoded = ActivityRecord::from_wire(&record.to_wire().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_malformed_payloads_are_errors_not_panics() {
        assert!(Token::from_wire(b"not json").is_err());
        assert!(ActivityRecord::from_wire(b"{\"origin\":true}").is_err());
        assert!(TelemetryRecord::from_wire(b"{\"type\":\"unrelated\"}").is_err());
    }

    #[test]
    fn test_unix_now_advances() {
        let a = unix_now();
        let b = unix_now();
        assert!(b >= a);
        assert!(a > 1.0e9); // sanity: epoch seconds, not uptime
    }
}
