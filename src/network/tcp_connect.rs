/**
 * network/tcp_connect.rs
 *
 * Non-blocking outbound TCP connects
 *
 * Resolution and connect() run on a bounded worker pool. Each worker
 * publishes its result through a pair of one-shot flags that the main
 * loop polls once per tick; nothing else crosses threads.
 */

use super::address::NetworkAddress;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Upper bound on concurrently running connect workers
pub const MAX_CONNECT_WORKERS: usize = 8;

/// TCP connection error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpConnectError {
    Resolve(String),
    NoAddress(String),
    BindFailed(String),
    ConnectFailed(String),
    Timeout,
}

impl fmt::Display for TcpConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcpConnectError::Resolve(e) => write!(f, "Resolve failed: {}", e),
            TcpConnectError::NoAddress(e) => write!(f, "No usable address: {}", e),
            TcpConnectError::BindFailed(e) => write!(f, "Bind failed: {}", e),
            TcpConnectError::ConnectFailed(e) => write!(f, "Connect failed: {}", e),
            TcpConnectError::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for TcpConnectError {}

/// Handle for one connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectId(pub u64);

impl fmt::Display for ConnectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Local-side socket options for a dial
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialOptions {
    /// Local address to bind before connecting
    pub bind: Option<SocketAddr>,
    /// Set SO_REUSEADDR (and SO_REUSEPORT on unix) so another socket can
    /// later bind the same local endpoint
    pub reuse_address: bool,
}

impl DialOptions {
    /// Options for a socket whose local port will be reused later
    pub fn reusable() -> Self {
        Self { bind: None, reuse_address: true }
    }

    /// Options for a dial from a previously reserved local endpoint
    pub fn bound_to(local: SocketAddr) -> Self {
        Self { bind: Some(local), reuse_address: true }
    }
}

/// Result of a finished attempt
#[derive(Debug)]
pub enum ConnectOutcome {
    Connected { stream: TcpStream, peer: SocketAddr },
    Failed(TcpConnectError),
}

/// Starts connects and reports their outcomes when polled
pub trait Dialer {
    /// Start connecting to `target`
    fn dial(&mut self, target: NetworkAddress, options: DialOptions) -> ConnectId;

    /// Abandon an attempt; its outcome is dropped silently
    fn kill(&mut self, id: ConnectId);

    /// Abandon every attempt
    fn kill_all(&mut self);

    /// Collect every attempt that finished since the last call
    fn poll(&mut self) -> Vec<(ConnectId, ConnectOutcome)>;
}

type ConnectResult = Result<(TcpStream, SocketAddr), TcpConnectError>;

/// One-shot result slot. The flags only ever go false -> true.
#[derive(Default)]
struct Latch {
    connected: AtomicBool,
    aborted: AtomicBool,
    result: Mutex<Option<ConnectResult>>,
}

impl Latch {
    fn complete(&self, result: ConnectResult) {
        let ok = result.is_ok();
        *self.result.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
        if ok {
            self.connected.store(true, Ordering::Release);
        } else {
            self.aborted.store(true, Ordering::Release);
        }
    }

    fn is_done(&self) -> bool {
        self.connected.load(Ordering::Acquire) || self.aborted.load(Ordering::Acquire)
    }

    fn take(&self) -> Option<ConnectResult> {
        self.result.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

struct PendingConnect {
    id: ConnectId,
    target: String,
    latch: Arc<Latch>,
    killed: bool,
}

/// Registry of in-flight connects backed by a tokio blocking pool
pub struct ConnectorPool {
    runtime: Option<tokio::runtime::Runtime>,
    pending: Vec<PendingConnect>,
    next_id: u64,
    connect_timeout: Duration,
}

impl ConnectorPool {
    /// Create a pool; falls back to synchronous connects if no worker
    /// pool can be started
    pub fn new(connect_timeout: Duration) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(MAX_CONNECT_WORKERS)
            .thread_name("rendezvous-connect")
            .build();

        let runtime = match runtime {
            Ok(runtime) => Some(runtime),
            Err(e) => {
                log::warn!("[connect] cannot start connect workers ({}); connecting synchronously", e);
                None
            }
        };

        Self {
            runtime,
            pending: Vec::new(),
            next_id: 1,
            connect_timeout,
        }
    }

    /// A pool that connects on the calling thread
    pub fn synchronous(connect_timeout: Duration) -> Self {
        Self {
            runtime: None,
            pending: Vec::new(),
            next_id: 1,
            connect_timeout,
        }
    }

    /// Attempts not yet reaped by `poll`, killed ones included
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Dialer for ConnectorPool {
    fn dial(&mut self, target: NetworkAddress, options: DialOptions) -> ConnectId {
        let id = ConnectId(self.next_id);
        self.next_id += 1;

        let latch = Arc::new(Latch::default());
        let label = target.to_string();
        let timeout = self.connect_timeout;

        log::debug!("[connect] {} dialing {} (bind {:?})", id, label, options.bind);

        match &self.runtime {
            Some(runtime) => {
                let worker_latch = Arc::clone(&latch);
                runtime.spawn_blocking(move || {
                    worker_latch.complete(connect_blocking(&target, options, timeout));
                });
            }
            None => latch.complete(connect_blocking(&target, options, timeout)),
        }

        self.pending.push(PendingConnect {
            id,
            target: label,
            latch,
            killed: false,
        });
        id
    }

    fn kill(&mut self, id: ConnectId) {
        if let Some(pending) = self.pending.iter_mut().find(|p| p.id == id) {
            pending.killed = true;
        }
    }

    fn kill_all(&mut self) {
        for pending in &mut self.pending {
            pending.killed = true;
        }
    }

    fn poll(&mut self) -> Vec<(ConnectId, ConnectOutcome)> {
        let mut finished = Vec::new();

        self.pending.retain(|pending| {
            if !pending.latch.is_done() {
                return true;
            }

            let result = pending.latch.take();
            if pending.killed {
                // Dropping the stream closes a socket that connected too late.
                log::trace!("[connect] {} to {} finished after kill", pending.id, pending.target);
                return false;
            }

            let outcome = match result {
                Some(Ok((stream, peer))) => ConnectOutcome::Connected { stream, peer },
                Some(Err(e)) => ConnectOutcome::Failed(e),
                None => ConnectOutcome::Failed(TcpConnectError::ConnectFailed(
                    "worker finished without a result".to_string(),
                )),
            };
            finished.push((pending.id, outcome));
            false
        });

        finished
    }
}

impl Drop for ConnectorPool {
    fn drop(&mut self) {
        self.kill_all();
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        // Workers are bounded by the connect timeout. Inside another runtime
        // we may not block, so they finish on their own instead.
        if tokio::runtime::Handle::try_current().is_ok() {
            log::trace!("[connect] dropped inside a runtime; {} workers finish unattended", self.pending.len());
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(self.connect_timeout + Duration::from_secs(1));
        }
    }
}

/// Resolve `target` and connect to the first candidate that answers
fn connect_blocking(target: &NetworkAddress, options: DialOptions, timeout: Duration) -> ConnectResult {
    let candidates = target
        .lookup()
        .map_err(|e| TcpConnectError::Resolve(format!("{}: {}", target, e)))?;

    let mut last_error = TcpConnectError::NoAddress(target.to_string());
    for addr in candidates {
        if let Some(bind) = options.bind {
            if bind.is_ipv4() != addr.is_ipv4() {
                continue;
            }
        }

        match connect_one(addr, options, timeout) {
            Ok(stream) => return Ok((stream, addr)),
            Err(e) => {
                log::trace!("[connect] {} failed: {}", addr, e);
                last_error = e;
            }
        }
    }

    Err(last_error)
}

fn connect_one(addr: SocketAddr, options: DialOptions, timeout: Duration) -> Result<TcpStream, TcpConnectError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| TcpConnectError::ConnectFailed(e.to_string()))?;

    // A port picked implicitly by connect() cannot be shared later, so
    // reusable sockets always bind explicitly.
    let bind = match (options.bind, options.reuse_address) {
        (Some(bind), _) => Some(bind),
        (None, true) => Some(unspecified_for(addr)),
        (None, false) => None,
    };

    if options.reuse_address {
        socket
            .set_reuse_address(true)
            .map_err(|e| TcpConnectError::BindFailed(e.to_string()))?;
        #[cfg(unix)]
        socket
            .set_reuse_port(true)
            .map_err(|e| TcpConnectError::BindFailed(e.to_string()))?;
    }

    if let Some(bind) = bind {
        socket
            .bind(&bind.into())
            .map_err(|e| TcpConnectError::BindFailed(format!("{}: {}", bind, e)))?;
    }

    match socket.connect_timeout(&addr.into(), timeout) {
        Ok(()) => Ok(socket.into()),
        Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
            Err(TcpConnectError::Timeout)
        }
        Err(e) => Err(TcpConnectError::ConnectFailed(format!("{}: {}", addr, e))),
    }
}

fn unspecified_for(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    fn wait_for(pool: &mut ConnectorPool) -> Vec<(ConnectId, ConnectOutcome)> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let events = pool.poll();
            if !events.is_empty() || Instant::now() > deadline {
                return events;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[tokio::test]
    async fn test_drop_inside_runtime() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut pool = ConnectorPool::new(Duration::from_secs(2));
        pool.dial(NetworkAddress::from_socket_addr(listener.local_addr().unwrap()), DialOptions::default());
        drop(pool);
    }

    #[test]
    fn test_connect_success() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut pool = ConnectorPool::new(Duration::from_secs(2));

        let id = pool.dial(NetworkAddress::from_socket_addr(addr), DialOptions::default());
        let events = wait_for(&mut pool);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, id);
        match &events[0].1 {
            ConnectOutcome::Connected { peer, .. } => assert_eq!(*peer, addr),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(pool.pending_count(), 0);
    }

    #[test]
    fn test_connect_refused() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let mut pool = ConnectorPool::new(Duration::from_secs(2));
        pool.dial(NetworkAddress::from_socket_addr(addr), DialOptions::default());

        let events = wait_for(&mut pool);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].1, ConnectOutcome::Failed(_)));
    }

    #[test]
    fn test_killed_attempt_is_reaped_silently() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut pool = ConnectorPool::new(Duration::from_secs(2));

        let id = pool.dial(NetworkAddress::from_socket_addr(addr), DialOptions::default());
        pool.kill(id);

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.pending_count() > 0 && Instant::now() < deadline {
            assert!(pool.poll().is_empty());
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.pending_count(), 0);
    }

    #[test]
    fn test_synchronous_mode() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut pool = ConnectorPool::synchronous(Duration::from_secs(2));

        pool.dial(NetworkAddress::from_socket_addr(addr), DialOptions::default());
        let events = pool.poll();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].1, ConnectOutcome::Connected { .. }));
    }

    #[test]
    fn test_reused_local_endpoint() {
        let relay = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut pool = ConnectorPool::synchronous(Duration::from_secs(2));

        pool.dial(NetworkAddress::from_socket_addr(relay.local_addr().unwrap()), DialOptions::reusable());
        let relay_stream = match pool.poll().pop() {
            Some((_, ConnectOutcome::Connected { stream, .. })) => stream,
            other => panic!("relay connect failed: {:?}", other),
        };
        let local = relay_stream.local_addr().unwrap();

        pool.dial(NetworkAddress::from_socket_addr(peer.local_addr().unwrap()), DialOptions::bound_to(local));
        match pool.poll().pop() {
            Some((_, ConnectOutcome::Connected { stream, .. })) => {
                assert_eq!(stream.local_addr().unwrap(), local);
            }
            other => panic!("peer connect failed: {:?}", other),
        }
    }
}
