/**
 * coordinator/stun.rs
 *
 * STUN client for NAT hole punching
 *
 * The relay connection exists only so the relay learns our public
 * endpoint and the OS reserves our local port. Nothing the relay sends is
 * interpreted. The local endpoint captured after connecting is the bind
 * address for the peer dial that follows.
 */

use super::protocol::StunMessage;
use crate::network::{ConnectId, DialOptions, Dialer, Family, NetworkAddress, PacketChannel, SendStatus};
use std::net::{SocketAddr, TcpStream};

/// Packets drained from the relay per tick
const MAX_RELAY_PACKETS_PER_TICK: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunState {
    /// Dialing the relay
    Connecting,
    /// Request sent; holding the socket open
    Connected,
    /// Peer dial in progress from our local endpoint; socket held, no longer pumped
    Handoff,
    Closed,
}

/// One relay connection for one token and one address family
pub struct StunClient {
    token: String,
    family: Family,
    state: StunState,
    connect_id: Option<ConnectId>,
    channel: Option<PacketChannel>,
    local_addr: Option<SocketAddr>,
}

impl StunClient {
    /// Start dialing the relay with a reusable local endpoint
    pub fn connect(dialer: &mut dyn Dialer, relay: &NetworkAddress, token: &str, family: Family) -> Self {
        let target = NetworkAddress::new(relay.hostname(), relay.port(), family);
        let connect_id = dialer.dial(target, DialOptions::reusable());
        log::debug!("[stun] {} connecting to relay {} over {}", token, relay, family);

        Self {
            token: token.to_string(),
            family,
            state: StunState::Connecting,
            connect_id: Some(connect_id),
            channel: None,
            local_addr: None,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn state(&self) -> StunState {
        self.state
    }

    pub fn connect_id(&self) -> Option<ConnectId> {
        self.connect_id
    }

    /// Local endpoint of the relay connection, once connected
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Whether this client may still lead to a peer connection
    pub fn is_alive(&self) -> bool {
        self.state != StunState::Closed
    }

    /// The relay accepted our connection: remember the local endpoint and
    /// send the request. Returns false if the socket is unusable.
    pub fn on_connected(&mut self, stream: TcpStream) -> bool {
        self.connect_id = None;

        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("[stun] {} cannot read local address: {}", self.token, e);
                self.close();
                return false;
            }
        };

        let mut channel = match PacketChannel::from_tcp(stream) {
            Ok(channel) => channel,
            Err(e) => {
                log::warn!("[stun] {} cannot configure relay socket: {}", self.token, e);
                self.close();
                return false;
            }
        };

        let request = StunMessage { token: self.token.clone(), family: self.family };
        if let Err(e) = channel.send_packet(request.to_packet()) {
            log::warn!("[stun] {} cannot queue request: {}", self.token, e);
            self.close();
            return false;
        }
        channel.send_packets();

        log::debug!("[stun] {} connected over {} from {}", self.token, self.family, local_addr);
        self.local_addr = Some(local_addr);
        self.channel = Some(channel);
        self.state = StunState::Connected;
        true
    }

    /// The relay could not be reached
    pub fn on_failed(&mut self) {
        self.connect_id = None;
        log::debug!("[stun] {} relay unreachable over {}", self.token, self.family);
        self.close();
    }

    /// Flush our request and discard whatever the relay sends back
    pub fn send_receive(&mut self) {
        if self.state != StunState::Connected {
            return;
        }
        let Some(channel) = self.channel.as_mut() else {
            return;
        };

        if channel.send_packets() == SendStatus::Closed {
            log::debug!("[stun] {} relay closed the connection", self.token);
            return;
        }

        for _ in 0..MAX_RELAY_PACKETS_PER_TICK {
            match channel.receive_packet() {
                Ok(Some(packet)) => {
                    log::trace!("[stun] {} ignoring relay packet type {}", self.token, packet.packet_type());
                }
                Ok(None) => break,
                Err(e) => {
                    // The local endpoint stays usable for the peer dial.
                    log::debug!("[stun] {} relay connection ended: {}", self.token, e);
                    break;
                }
            }
        }
    }

    /// Stop using the relay connection but keep the socket, and with it the
    /// local port, until `close`
    pub fn close_connection(&mut self) {
        if self.state == StunState::Connected {
            self.state = StunState::Handoff;
        }
    }

    /// Release the socket and the local port
    pub fn close(&mut self) {
        self.channel = None;
        self.state = StunState::Closed;
    }

    /// Release everything, abandoning a relay dial still in flight
    pub fn abort(&mut self, dialer: &mut dyn Dialer) {
        if let Some(id) = self.connect_id.take() {
            dialer.kill(id);
        }
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ConnectOutcome, ConnectorPool, Packet};
    use std::io::Read;
    use std::net::TcpListener;
    use std::time::Duration;

    fn connect_to(listener: &TcpListener, family: Family) -> (StunClient, ConnectorPool) {
        let mut pool = ConnectorPool::synchronous(Duration::from_secs(2));
        let relay = NetworkAddress::from_socket_addr(listener.local_addr().unwrap());
        let mut stun = StunClient::connect(&mut pool, &relay, "tok2", family);
        assert_eq!(stun.state(), StunState::Connecting);

        match pool.poll().pop() {
            Some((id, ConnectOutcome::Connected { stream, .. })) => {
                assert_eq!(Some(id), stun.connect_id());
                assert!(stun.on_connected(stream));
            }
            other => panic!("relay connect failed: {:?}", other),
        }
        (stun, pool)
    }

    #[test]
    fn test_sends_request_and_captures_local_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (stun, _pool) = connect_to(&listener, Family::V4);

        assert_eq!(stun.state(), StunState::Connected);
        let local = stun.local_addr().unwrap();
        assert_ne!(local.port(), 0);

        let (mut relay_side, peer) = listener.accept().unwrap();
        assert_eq!(peer, local);

        relay_side.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut frame = vec![0u8; 11];
        relay_side.read_exact(&mut frame).unwrap();
        let mut packet = Packet::from_frame(frame).unwrap();
        let request = StunMessage::from_packet(&mut packet).unwrap();
        assert_eq!(request.token, "tok2");
        assert_eq!(request.family, Family::V4);
    }

    #[test]
    fn test_handoff_keeps_endpoint_until_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut stun, _pool) = connect_to(&listener, Family::V4);

        stun.close_connection();
        assert_eq!(stun.state(), StunState::Handoff);
        assert!(stun.is_alive());
        assert!(stun.local_addr().is_some());

        stun.close();
        assert_eq!(stun.state(), StunState::Closed);
        assert!(!stun.is_alive());
    }

    #[test]
    fn test_unreachable_relay() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let mut pool = ConnectorPool::synchronous(Duration::from_secs(2));
        let mut stun = StunClient::connect(&mut pool, &NetworkAddress::from_socket_addr(addr), "tok2", Family::V4);

        let outcome = pool.poll().pop();
        assert!(matches!(outcome, Some((_, ConnectOutcome::Failed(_)))));
        stun.on_failed();
        assert!(!stun.is_alive());
        assert!(stun.local_addr().is_none());
    }
}
