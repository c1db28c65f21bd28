//! In-process implementations of the transport seams.
//!
//! `MemoryNet` models the same unordered, best-effort, at-most-once datagram
//! semantics as the UDP transport, over std channels: sending to an unbound
//! or torn-down address silently drops the payload. Used by tests and by
//! thread-per-node deployments; the library's trait seams are what the
//! simulator binaries exercise over real sockets.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hashbrown::HashMap;
use indexmap::IndexMap;
use log::warn;

use crate::rq_interface::{Fanout, FanoutListener, RingError, Token, TokenTransport};

// ============================================================================
// Addressed Datagram Network
// ============================================================================

/// A process-local datagram network: a table of bound addresses.
///
/// Cloning shares the network. `send_to` never blocks and never fails for
/// missing receivers - datagram loss is part of the model.
#[derive(Clone, Default)]
pub struct MemoryNet {
    sockets: Arc<Mutex<HashMap<String, Sender<Vec<u8>>>>>,
}

/// A bound endpoint on a [`MemoryNet`]. Unbinds on drop.
pub struct MemorySocket {
    addr: String,
    rx: Receiver<Vec<u8>>,
    net: MemoryNet,
}

impl MemoryNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an address. Fails with [`RingError::AddrInUse`] if it is taken,
    /// mirroring the fatal-at-startup contract of the socket transport.
    pub fn bind(&self, addr: &str) -> Result<MemorySocket, RingError> {
        let mut sockets = self.sockets.lock().expect("socket table poisoned");
        if sockets.contains_key(addr) {
            return Err(RingError::AddrInUse(addr.to_string()));
        }

        let (tx, rx) = mpsc::channel();
        sockets.insert(addr.to_string(), tx);

        Ok(MemorySocket {
            addr: addr.to_string(),
            rx,
            net: self.clone(),
        })
    }

    /// Best-effort send. A missing or closed destination drops the payload.
    pub fn send_to(&self, addr: &str, payload: &[u8]) -> Result<(), RingError> {
        let sockets = self.sockets.lock().expect("socket table poisoned");
        if let Some(tx) = sockets.get(addr) {
            // receiver may have been dropped between unbind and cleanup
            let _ = tx.send(payload.to_vec());
        }
        Ok(())
    }

    fn release(&self, addr: &str) {
        let mut sockets = self.sockets.lock().expect("socket table poisoned");
        sockets.remove(addr);
    }
}

impl MemorySocket {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Block until the next datagram arrives.
    pub fn recv(&self) -> Result<Vec<u8>, RingError> {
        self.rx.recv().map_err(|_| RingError::Disconnected)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>, RingError> {
        match self.rx.recv_timeout(timeout) {
            Ok(payload) => Ok(Some(payload)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(RingError::Disconnected),
        }
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        self.net.release(&self.addr);
    }
}

// ============================================================================
// Token Link
// ============================================================================

/// [`TokenTransport`] between one bound endpoint and a fixed successor.
pub struct MemoryTokenLink {
    socket: MemorySocket,
    successor: String,
    net: MemoryNet,
}

impl MemoryTokenLink {
    pub fn bind(net: &MemoryNet, own_addr: &str, successor_addr: &str) -> Result<Self, RingError> {
        Ok(Self {
            socket: net.bind(own_addr)?,
            successor: successor_addr.to_string(),
            net: net.clone(),
        })
    }
}

impl TokenTransport for MemoryTokenLink {
    fn forward(&mut self, token: &Token) -> Result<(), RingError> {
        let wire = token.to_wire()?;
        self.net.send_to(&self.successor, &wire)
    }

    fn receive(&mut self) -> Result<Token, RingError> {
        loop {
            let payload = self.socket.recv()?;
            match Token::from_wire(&payload) {
                Ok(token) => return Ok(token),
                Err(e) => warn!("{}: skipping undecodable datagram: {}", self.socket.addr(), e),
            }
        }
    }
}

// ============================================================================
// Broadcast Fanout
// ============================================================================

/// In-process broadcast channel with best-effort delivery to all current
/// subscribers, the publisher's own listener included.
#[derive(Clone, Default)]
pub struct MemoryFanout {
    subscribers: Arc<Mutex<IndexMap<u64, Sender<Vec<u8>>>>>,
    next_id: Arc<Mutex<u64>>,
}

pub struct MemoryListener {
    id: u64,
    rx: Receiver<Vec<u8>>,
    subscribers: Arc<Mutex<IndexMap<u64, Sender<Vec<u8>>>>>,
}

impl MemoryFanout {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Fanout for MemoryFanout {
    type Listener = MemoryListener;

    fn publish(&self, payload: &[u8]) -> Result<(), RingError> {
        let subscribers = self.subscribers.lock().expect("subscriber table poisoned");
        for tx in subscribers.values() {
            // a torn-down listener is a missed delivery, not an error
            let _ = tx.send(payload.to_vec());
        }
        Ok(())
    }

    fn listen(&self) -> Result<MemoryListener, RingError> {
        let id = {
            let mut next = self.next_id.lock().expect("id counter poisoned");
            *next += 1;
            *next
        };

        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .expect("subscriber table poisoned")
            .insert(id, tx);

        Ok(MemoryListener {
            id,
            rx,
            subscribers: Arc::clone(&self.subscribers),
        })
    }
}

impl FanoutListener for MemoryListener {
    fn poll(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, RingError> {
        match self.rx.recv_timeout(timeout) {
            Ok(payload) => Ok(Some(payload)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(RingError::Disconnected),
        }
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.subscribers
            .lock()
            .expect("subscriber table poisoned")
            .shift_remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rq_interface::Token;

    const POLL: Duration = Duration::from_millis(50);

    #[test]
    fn test_bind_conflict_is_fatal() {
        let net = MemoryNet::new();
        let _a = net.bind("127.0.0.1:6000").unwrap();

        match net.bind("127.0.0.1:6000") {
            Err(RingError::AddrInUse(addr)) => assert_eq!(addr, "127.0.0.1:6000"),
            other => panic!("expected AddrInUse, got {:?}", other.map(|s| s.addr().to_string())),
        }
    }

    #[test]
    fn test_address_released_on_drop() {
        let net = MemoryNet::new();
        {
            let _socket = net.bind("127.0.0.1:6001").unwrap();
        }
        assert!(net.bind("127.0.0.1:6001").is_ok());
    }

    #[test]
    fn test_send_to_unbound_address_is_dropped() {
        let net = MemoryNet::new();
        assert!(net.send_to("127.0.0.1:9999", b"gone").is_ok());
    }

    #[test]
    fn test_token_link_round_trip() {
        let net = MemoryNet::new();
        let mut a = MemoryTokenLink::bind(&net, "a", "b").unwrap();
        let mut b = MemoryTokenLink::bind(&net, "b", "a").unwrap();

        let token = Token {
            round: 4,
            silent_rounds: 1,
            timestamp: 99.5,
        };
        a.forward(&token).unwrap();

        let received = b.receive().unwrap();
        assert_eq!(received, token);
    }

    #[test]
    fn test_token_link_skips_malformed_datagrams() {
        let net = MemoryNet::new();
        let mut link = MemoryTokenLink::bind(&net, "b", "a").unwrap();

        net.send_to("b", b"not a token").unwrap();
        net.send_to("b", &Token::new().to_wire().unwrap()).unwrap();

        let received = link.receive().unwrap();
        assert_eq!(received.round, 0);
    }

    #[test]
    fn test_fanout_reaches_all_subscribers_including_publisher() {
        let fanout = MemoryFanout::new();
        let mut own = fanout.listen().unwrap();
        let mut other = fanout.listen().unwrap();

        fanout.publish(b"burst").unwrap();

        assert_eq!(own.poll(POLL).unwrap().as_deref(), Some(&b"burst"[..]));
        assert_eq!(other.poll(POLL).unwrap().as_deref(), Some(&b"burst"[..]));
    }

    #[test]
    fn test_fanout_tolerates_dropped_listener() {
        let fanout = MemoryFanout::new();
        let mut kept = fanout.listen().unwrap();
        let dropped = fanout.listen().unwrap();
        drop(dropped);

        fanout.publish(b"still delivered").unwrap();
        assert!(kept.poll(POLL).unwrap().is_some());
    }

    #[test]
    fn test_listener_poll_times_out_quietly() {
        let fanout = MemoryFanout::new();
        let mut listener = fanout.listen().unwrap();
        assert!(listener.poll(Duration::from_millis(10)).unwrap().is_none());
    }
}
