//! Test fixtures: a fake rendezvous service on localhost and a dialer that
//! sends documentation-range addresses to local listeners instead.

#![allow(dead_code)]

use rendezvous::coordinator::protocol::{ClientMessage, ServiceMessage};
use rendezvous::network::{ConnectId, ConnectOutcome, ConnectorPool, DialOptions, Dialer, NetworkAddress, Packet};
use rendezvous::{CoordinatorClient, CoordinatorConfig, CoordinatorEvent};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(5);

/// Synchronous dialer that records every dial and rewrites chosen targets
pub struct RedirectDialer {
    inner: ConnectorPool,
    redirects: HashMap<String, SocketAddr>,
    pub dials: Vec<(String, DialOptions)>,
}

impl RedirectDialer {
    pub fn new() -> Self {
        Self {
            inner: ConnectorPool::synchronous(Duration::from_secs(2)),
            redirects: HashMap::new(),
            dials: Vec::new(),
        }
    }

    /// Dials to `target` ("host:port") connect to `local` instead
    pub fn redirect(&mut self, target: &str, local: SocketAddr) {
        self.redirects.insert(target.to_string(), local);
    }

    /// Recorded dials to `target`
    pub fn dials_to(&self, target: &str) -> Vec<DialOptions> {
        self.dials.iter().filter(|(t, _)| t == target).map(|(_, o)| *o).collect()
    }
}

impl Dialer for RedirectDialer {
    fn dial(&mut self, target: NetworkAddress, options: DialOptions) -> ConnectId {
        let label = target.to_string();
        self.dials.push((label.clone(), options));
        match self.redirects.get(&label) {
            Some(local) => self.inner.dial(NetworkAddress::from_socket_addr(*local), DialOptions::default()),
            None => self.inner.dial(target, options),
        }
    }

    fn kill(&mut self, id: ConnectId) {
        self.inner.kill(id);
    }

    fn kill_all(&mut self) {
        self.inner.kill_all();
    }

    fn poll(&mut self) -> Vec<(ConnectId, ConnectOutcome)> {
        self.inner.poll()
    }
}

pub type TestClient = CoordinatorClient<RedirectDialer>;

/// Client whose rendezvous service is `service`
pub fn client_for(service: SocketAddr, tweak: impl FnOnce(&mut CoordinatorConfig)) -> TestClient {
    let mut config = CoordinatorConfig {
        coordinator_server: service.to_string(),
        ..CoordinatorConfig::default()
    };
    tweak(&mut config);
    CoordinatorClient::with_dialer(config, RedirectDialer::new())
}

/// A port nothing listens on
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Tick `client` until `done` holds, collecting the events seen meanwhile
pub fn pump_until(
    client: &mut TestClient,
    what: &str,
    mut done: impl FnMut(&TestClient) -> bool,
) -> Vec<CoordinatorEvent> {
    let deadline = Instant::now() + WAIT;
    let mut events = Vec::new();
    loop {
        client.send_receive();
        events.extend(client.take_events());
        if done(&*client) {
            return events;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Tick `client` until `listener` has a connection
pub fn accept(listener: &TcpListener, client: &mut TestClient) -> Peer {
    listener.set_nonblocking(true).unwrap();
    let deadline = Instant::now() + WAIT;
    loop {
        match listener.accept() {
            Ok((stream, _)) => return Peer::new(stream),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => panic!("accept failed: {}", e),
        }
        assert!(Instant::now() < deadline, "timed out waiting for a connection");
        client.send_receive();
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Our end of a connection the client opened
pub struct Peer {
    pub stream: TcpStream,
    buffer: Vec<u8>,
}

impl Peer {
    fn new(stream: TcpStream) -> Self {
        stream.set_nonblocking(false).unwrap();
        stream.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
        Self { stream, buffer: Vec::new() }
    }

    pub fn send(&mut self, message: ServiceMessage) {
        let frame = message.to_packet().into_frame().unwrap();
        self.stream.write_all(&frame).unwrap();
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    /// Next packet from the client, ticking it while waiting
    pub fn expect_packet(&mut self, client: &mut TestClient) -> Packet {
        let deadline = Instant::now() + WAIT;
        loop {
            if self.buffer.len() >= 2 {
                let size = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
                if self.buffer.len() >= size {
                    let frame: Vec<u8> = self.buffer.drain(..size).collect();
                    return Packet::from_frame(frame).unwrap();
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for a packet");

            client.send_receive();
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => panic!("client closed the connection"),
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => panic!("read failed: {}", e),
            }
        }
    }

    /// Next rendezvous message from the client
    pub fn expect(&mut self, client: &mut TestClient) -> ClientMessage {
        let mut packet = self.expect_packet(client);
        ClientMessage::from_packet(&mut packet).unwrap()
    }
}
