//! UDP implementations of the transport seams.
//!
//! Tokens travel as unicast JSON datagrams to the successor's address; the
//! activity and telemetry channels are IP-multicast groups so every node and
//! the stats collector hear them without knowing each other's addresses.
//! Delivery on all three is best-effort, unordered, at-most-once.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use log::warn;

use crate::rq_interface::{Fanout, FanoutListener, RingError, Token, TokenTransport};

/// Activity event group.
pub const ACTIVITY_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);
pub const ACTIVITY_PORT: u16 = 5007;

/// Round-time telemetry group, distinct from both the token channel and the
/// activity group.
pub const TELEMETRY_GROUP: Ipv4Addr = Ipv4Addr::new(224, 1, 1, 1);
pub const TELEMETRY_PORT: u16 = 5008;

/// Largest datagram either channel will carry.
pub const MAX_DATAGRAM: usize = 1024;

// ============================================================================
// Socket Helpers
// ============================================================================

/// Bind a UDP socket with SO_REUSEADDR set before the bind, so several
/// group listeners on one host can share the multicast port. std cannot set
/// the option pre-bind, hence the drop to libc.
#[cfg(unix)]
fn bind_reusable(addr: SocketAddrV4) -> io::Result<UdpSocket> {
    use std::os::unix::io::FromRawFd;

    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let one: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let mut sa: libc::sockaddr_in = std::mem::zeroed();
        sa.sin_family = libc::AF_INET as libc::sa_family_t;
        sa.sin_port = addr.port().to_be();
        sa.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());

        if libc::bind(
            fd,
            &sa as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(UdpSocket::from_raw_fd(fd))
    }
}

#[cfg(not(unix))]
fn bind_reusable(addr: SocketAddrV4) -> io::Result<UdpSocket> {
    UdpSocket::bind(addr)
}

fn map_bind_error(err: io::Error, addr: &str) -> RingError {
    if err.kind() == io::ErrorKind::AddrInUse {
        RingError::AddrInUse(addr.to_string())
    } else {
        RingError::Io(err)
    }
}

// ============================================================================
// Token Link
// ============================================================================

/// [`TokenTransport`] over unicast UDP: bound to the node's own address,
/// forwarding to the fixed successor.
pub struct UdpTokenLink {
    socket: UdpSocket,
    successor: String,
}

impl UdpTokenLink {
    /// Bind the node's listening socket. An already-bound address is fatal
    /// at startup.
    pub fn bind(own_addr: &str, successor_addr: &str) -> Result<Self, RingError> {
        let socket = UdpSocket::bind(own_addr).map_err(|e| map_bind_error(e, own_addr))?;
        Ok(Self {
            socket,
            successor: successor_addr.to_string(),
        })
    }

    /// The actually bound address (relevant when binding port 0).
    pub fn local_addr(&self) -> Result<String, RingError> {
        Ok(self.socket.local_addr()?.to_string())
    }
}

impl TokenTransport for UdpTokenLink {
    fn forward(&mut self, token: &Token) -> Result<(), RingError> {
        let wire = token.to_wire()?;
        self.socket.send_to(&wire, &self.successor)?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Token, RingError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf)?;
            match Token::from_wire(&buf[..len]) {
                Ok(token) => return Ok(token),
                Err(e) => warn!("skipping undecodable datagram from {}: {}", from, e),
            }
        }
    }
}

// ============================================================================
// Multicast Fanout
// ============================================================================

/// One logical broadcast channel, addressed by multicast group and port.
#[derive(Debug, Clone)]
pub struct UdpFanout {
    group: Ipv4Addr,
    port: u16,
}

impl UdpFanout {
    pub fn new(group: Ipv4Addr, port: u16) -> Self {
        Self { group, port }
    }

    pub fn activity() -> Self {
        Self::new(ACTIVITY_GROUP, ACTIVITY_PORT)
    }

    pub fn telemetry() -> Self {
        Self::new(TELEMETRY_GROUP, TELEMETRY_PORT)
    }
}

impl Fanout for UdpFanout {
    type Listener = UdpGroupListener;

    fn publish(&self, payload: &[u8]) -> Result<(), RingError> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_multicast_ttl_v4(1)?;
        socket.send_to(payload, (self.group, self.port))?;
        Ok(())
    }

    fn listen(&self) -> Result<UdpGroupListener, RingError> {
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port);
        let socket = bind_reusable(bind_addr)
            .map_err(|e| map_bind_error(e, &bind_addr.to_string()))?;
        socket.join_multicast_v4(&self.group, &Ipv4Addr::UNSPECIFIED)?;

        Ok(UdpGroupListener { socket })
    }
}

/// Group subscription draining one multicast socket.
pub struct UdpGroupListener {
    socket: UdpSocket,
}

impl FanoutListener for UdpGroupListener {
    fn poll(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, RingError> {
        // zero would mean "no timeout" to the socket layer
        let timeout = timeout.max(Duration::from_millis(1));
        self.socket.set_read_timeout(Some(timeout))?;

        let mut buf = [0u8; MAX_DATAGRAM];
        match self.socket.recv_from(&mut buf) {
            Ok((len, _)) => Ok(Some(buf[..len].to_vec())),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                Ok(None)
            }
            Err(e) => Err(RingError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unicast_token_round_trip() {
        let mut receiver = UdpTokenLink::bind("127.0.0.1:0", "127.0.0.1:9").unwrap();
        let receiver_addr = receiver.local_addr().unwrap();
        let mut sender = UdpTokenLink::bind("127.0.0.1:0", &receiver_addr).unwrap();

        let token = Token {
            round: 9,
            silent_rounds: 2,
            timestamp: 1234.5,
        };
        sender.forward(&token).unwrap();

        let received = receiver.receive().unwrap();
        assert_eq!(received, token);
    }

    #[test]
    fn test_malformed_datagram_leaves_link_usable() {
        let mut receiver = UdpTokenLink::bind("127.0.0.1:0", "127.0.0.1:9").unwrap();
        let receiver_addr = receiver.local_addr().unwrap();

        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        probe.send_to(b"definitely not a token", &receiver_addr).unwrap();
        probe
            .send_to(&Token::new().to_wire().unwrap(), &receiver_addr)
            .unwrap();

        let received = receiver.receive().unwrap();
        assert_eq!(received.round, 0);
        assert_eq!(received.silent_rounds, 0);
    }

    #[test]
    fn test_bound_address_conflict_is_fatal() {
        let first = UdpTokenLink::bind("127.0.0.1:0", "127.0.0.1:9").unwrap();
        let addr = first.local_addr().unwrap();

        match UdpTokenLink::bind(&addr, "127.0.0.1:9") {
            Err(RingError::AddrInUse(reported)) => assert_eq!(reported, addr),
            Err(other) => panic!("expected AddrInUse, got {}", other),
            Ok(_) => panic!("second bind on {} unexpectedly succeeded", addr),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_reusable_bind_allows_shared_port() {
        // two listeners on one port is exactly what the multicast groups
        // need on a single host
        let a = bind_reusable(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 45707)).unwrap();
        let b = bind_reusable(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 45707));
        assert!(b.is_ok());
        drop(a);
    }
}
