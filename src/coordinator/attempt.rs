/**
 * coordinator/attempt.rs
 *
 * Connection attempts: one per join in flight, or per token the service
 * asks us to help with while hosting
 *
 * A join is tracked by its join-key until the service assigns a token,
 * then by the token. Every dial and STUN relay connection belongs to
 * exactly one attempt. The first dial that connects wins; everything else
 * the attempt owns is killed or closed at once.
 */

use super::protocol::ClientMessage;
use super::stun::{StunClient, StunState};
use super::types::CoordinatorEvent;
use crate::network::{ConnectId, ConnectOutcome, DialOptions, Dialer, Family, NetworkAddress};
use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

/// Why a join did not produce a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// A join for this join-key is already in flight
    DuplicateInFlight(String),
    /// The service gave up on the connection
    ServiceGaveUp,
    ControlConnectionLost,
    /// The control connection could not be opened
    ServiceUnreachable(String),
    TimedOut,
    InvalidJoinKey(String),
    ProtocolVersion,
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::DuplicateInFlight(key) => write!(f, "A join to {} is already in progress", key),
            JoinError::ServiceGaveUp => write!(f, "No connection could be established"),
            JoinError::ControlConnectionLost => write!(f, "Lost connection to the rendezvous service"),
            JoinError::ServiceUnreachable(e) => write!(f, "Rendezvous service unreachable: {}", e),
            JoinError::TimedOut => write!(f, "Join timed out"),
            JoinError::InvalidJoinKey(key) => write!(f, "Invalid join-key: {}", key),
            JoinError::ProtocolVersion => write!(f, "Rendezvous protocol version mismatch"),
        }
    }
}

impl std::error::Error for JoinError {}

/// Final result of a join
#[derive(Debug)]
pub enum JoinResult {
    Connected { stream: TcpStream, peer: SocketAddr },
    Failed(JoinError),
}

/// Receives the result of a join, exactly once
pub type JoinCallback = Box<dyn FnOnce(JoinResult)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// CONNECT queued, not yet on the wire
    Requested,
    /// Waiting for the service to assign a token and pick a strategy
    AwaitingToken,
    DirectDialing,
    /// STUN relay connections open, waiting for the peer's endpoint
    StunPending,
    /// Dialing the peer from a STUN-reserved local endpoint
    PeerDialing,
    Connected,
    /// Every strategy so far failed; waiting for the service
    Failed,
}

/// What an outstanding dial is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialKind {
    Direct,
    Peer(Family),
}

enum Role {
    Joining { join_key: String, callback: JoinCallback },
    Hosting,
}

pub struct ConnectAttempt {
    role: Role,
    token: Option<String>,
    state: AttemptState,
    dials: HashMap<ConnectId, DialKind>,
    stuns: Vec<StunClient>,
    started: Instant,
    /// The control connection that issued our token is gone
    detached: bool,
}

impl ConnectAttempt {
    fn joining(join_key: &str, callback: JoinCallback, now: Instant) -> Self {
        Self {
            role: Role::Joining { join_key: join_key.to_string(), callback },
            token: None,
            state: AttemptState::Requested,
            dials: HashMap::new(),
            stuns: Vec::new(),
            started: now,
            detached: false,
        }
    }

    fn hosting(token: &str, now: Instant) -> Self {
        Self {
            role: Role::Hosting,
            token: Some(token.to_string()),
            state: AttemptState::AwaitingToken,
            dials: HashMap::new(),
            stuns: Vec::new(),
            started: now,
            detached: false,
        }
    }

    pub fn join_key(&self) -> Option<&str> {
        match &self.role {
            Role::Joining { join_key, .. } => Some(join_key),
            Role::Hosting => None,
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn is_hosting(&self) -> bool {
        matches!(self.role, Role::Hosting)
    }

    fn label(&self) -> String {
        match (&self.token, self.join_key()) {
            (Some(token), Some(key)) => format!("{} ({})", token, key),
            (Some(token), None) => format!("{} (host)", token),
            (None, Some(key)) => key.to_string(),
            (None, None) => "?".to_string(),
        }
    }

    /// Nothing left that could still connect
    fn is_exhausted(&self) -> bool {
        self.dials.is_empty() && !self.stuns.iter().any(|s| s.is_alive())
    }

    /// Kill every dial and close every relay connection
    fn release(&mut self, dialer: &mut dyn Dialer) {
        for id in self.dials.keys() {
            dialer.kill(*id);
        }
        self.dials.clear();
        for stun in &mut self.stuns {
            stun.abort(dialer);
        }
        self.stuns.clear();
    }

    fn owns(&self, id: ConnectId) -> bool {
        self.dials.contains_key(&id) || self.stuns.iter().any(|s| s.connect_id() == Some(id))
    }

    /// Hand the result to whoever is waiting for it
    fn conclude(self, result: JoinResult, events: &mut Vec<CoordinatorEvent>) {
        let label = self.label();
        match (self.role, result) {
            (Role::Joining { callback, .. }, result) => callback(result),
            (Role::Hosting, JoinResult::Connected { stream, peer }) => {
                let token = self.token.unwrap_or_default();
                events.push(CoordinatorEvent::IncomingPeer { token, stream, peer });
            }
            (Role::Hosting, JoinResult::Failed(e)) => {
                log::debug!("[connect] {} host side gave up: {}", label, e);
            }
        }
    }
}

/// All attempts in flight, plus the messages and events they produce
#[derive(Default)]
pub struct AttemptTable {
    by_join_key: HashMap<String, ConnectAttempt>,
    by_token: HashMap<String, ConnectAttempt>,
    outgoing: Vec<ClientMessage>,
    events: Vec<CoordinatorEvent>,
}

impl AttemptTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_join_key.len() + self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_by_token(&self, token: &str) -> Option<&ConnectAttempt> {
        self.by_token.get(token)
    }

    pub fn get_by_join_key(&self, join_key: &str) -> Option<&ConnectAttempt> {
        self.by_join_key
            .get(join_key)
            .or_else(|| self.by_token.values().find(|a| a.join_key() == Some(join_key)))
    }

    /// Messages for the service produced since the last call
    pub fn take_outgoing(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.outgoing)
    }

    /// Events for the embedding application produced since the last call
    pub fn take_events(&mut self) -> Vec<CoordinatorEvent> {
        std::mem::take(&mut self.events)
    }

    /// Track a new join. Only one join per join-key may be in flight.
    pub fn begin_join(&mut self, join_key: &str, callback: JoinCallback, now: Instant) -> Result<(), JoinError> {
        if self.get_by_join_key(join_key).is_some() {
            return Err(JoinError::DuplicateInFlight(join_key.to_string()));
        }
        self.by_join_key
            .insert(join_key.to_string(), ConnectAttempt::joining(join_key, callback, now));
        Ok(())
    }

    /// CONNECT for `join_key` went out on the control channel
    pub fn mark_sent(&mut self, join_key: &str) {
        if let Some(attempt) = self.by_join_key.get_mut(join_key) {
            if attempt.state == AttemptState::Requested {
                attempt.state = AttemptState::AwaitingToken;
            }
        }
    }

    /// The service assigned `token` to our join for `join_key`
    pub fn on_connecting(&mut self, token: &str, join_key: &str) {
        if self.by_token.contains_key(token) {
            log::debug!("[connect] duplicate CONNECTING for {}", token);
            return;
        }
        let Some(mut attempt) = self.by_join_key.remove(join_key) else {
            log::warn!("[connect] CONNECTING {} for unknown join-key {}", token, join_key);
            self.outgoing.push(ClientMessage::ConnectFailed { token: token.to_string() });
            return;
        };

        log::debug!("[connect] {} assigned token {}", join_key, token);
        attempt.token = Some(token.to_string());
        attempt.state = AttemptState::AwaitingToken;
        self.by_token.insert(token.to_string(), attempt);
    }

    /// The service gave up on `token`
    pub fn on_connect_failed(&mut self, dialer: &mut dyn Dialer, token: &str) {
        let Some(mut attempt) = self.by_token.remove(token) else {
            log::debug!("[connect] CONNECT_FAILED for finished attempt {}", token);
            return;
        };
        attempt.release(dialer);
        attempt.state = AttemptState::Failed;
        log::info!("[connect] {} failed: service gave up", attempt.label());
        attempt.conclude(JoinResult::Failed(JoinError::ServiceGaveUp), &mut self.events);
    }

    /// The service says the server is directly reachable
    pub fn on_direct_connect(&mut self, dialer: &mut dyn Dialer, token: &str, host: &str, port: u16) {
        let Some(attempt) = self.by_token.get_mut(token) else {
            log::warn!("[connect] DIRECT_CONNECT for unknown token {}", token);
            return;
        };

        let target = NetworkAddress::new(host, port, Family::Unspecified);
        log::debug!("[connect] {} dialing {} directly", attempt.label(), target);
        let id = dialer.dial(target, DialOptions::default());
        attempt.dials.insert(id, DialKind::Direct);
        attempt.state = AttemptState::DirectDialing;
    }

    /// The service wants our public endpoints for `token`: open one relay
    /// connection per family
    pub fn on_stun_request(
        &mut self,
        dialer: &mut dyn Dialer,
        relay: &NetworkAddress,
        families: &[Family],
        token: &str,
        hosting: bool,
        now: Instant,
    ) {
        if !self.by_token.contains_key(token) {
            if !hosting {
                log::warn!("[stun] STUN_REQUEST for unknown token {}", token);
                self.outgoing.push(ClientMessage::ConnectFailed { token: token.to_string() });
                return;
            }
            log::debug!("[stun] {} peer joining our game", token);
            self.by_token.insert(token.to_string(), ConnectAttempt::hosting(token, now));
        }

        let Some(attempt) = self.by_token.get_mut(token) else {
            return;
        };
        for family in families {
            let running = attempt.stuns.iter().any(|s| s.family() == *family && s.is_alive());
            if !running {
                attempt.stuns.push(StunClient::connect(dialer, relay, token, *family));
            }
        }
        attempt.state = AttemptState::StunPending;

        self.report_if_exhausted(token);
    }

    /// The relay told the service both endpoints; dial the peer from the
    /// local endpoint the relay connection used
    pub fn on_stun_connect(&mut self, dialer: &mut dyn Dialer, token: &str, family: Family, host: &str, port: u16) {
        let Some(attempt) = self.by_token.get_mut(token) else {
            log::warn!("[stun] STUN_CONNECT for unknown token {}", token);
            return;
        };

        let stun = attempt
            .stuns
            .iter_mut()
            .find(|s| s.family() == family && s.is_alive() && s.local_addr().is_some());
        let Some(stun) = stun else {
            log::warn!("[stun] {} no relay connection over {}", token, family);
            self.report_if_exhausted(token);
            return;
        };
        let Some(local) = stun.local_addr() else {
            return;
        };

        stun.close_connection();
        let target = NetworkAddress::new(host, port, family);
        log::debug!("[stun] {} dialing peer {} from {}", token, target, local);
        let id = dialer.dial(target, DialOptions::bound_to(local));
        attempt.dials.insert(id, DialKind::Peer(family));
        attempt.state = AttemptState::PeerDialing;
    }

    /// Route a finished dial to its attempt. Returns false when no attempt
    /// owns `id`; a stream in the outcome is then dropped (closed).
    pub fn on_dial_outcome(&mut self, dialer: &mut dyn Dialer, id: ConnectId, outcome: ConnectOutcome) -> bool {
        let Some(token) = self
            .by_token
            .iter()
            .find(|(_, a)| a.owns(id))
            .map(|(token, _)| token.clone())
        else {
            return false;
        };
        let Some(attempt) = self.by_token.get_mut(&token) else {
            return false;
        };

        if let Some(kind) = attempt.dials.remove(&id) {
            match outcome {
                ConnectOutcome::Connected { stream, peer } => {
                    let Some(mut winner) = self.by_token.remove(&token) else {
                        return true;
                    };
                    winner.release(dialer);
                    winner.state = AttemptState::Connected;
                    log::info!("[connect] {} connected to {} ({:?})", winner.label(), peer, kind);
                    winner.conclude(JoinResult::Connected { stream, peer }, &mut self.events);
                }
                ConnectOutcome::Failed(e) => {
                    log::debug!("[connect] {} {:?} dial failed: {}", attempt.label(), kind, e);
                    if let DialKind::Peer(family) = kind {
                        for stun in attempt.stuns.iter_mut().filter(|s| s.family() == family) {
                            stun.close();
                        }
                    }
                    self.report_if_exhausted(&token);
                }
            }
            return true;
        }

        let Some(stun) = attempt.stuns.iter_mut().find(|s| s.connect_id() == Some(id)) else {
            return true;
        };
        let alive = match outcome {
            ConnectOutcome::Connected { stream, .. } => stun.on_connected(stream),
            ConnectOutcome::Failed(e) => {
                log::debug!("[stun] {} relay dial over {} failed: {}", token, stun.family(), e);
                stun.on_failed();
                false
            }
        };
        if !alive {
            self.report_if_exhausted(&token);
        }
        true
    }

    /// Tell the service once nothing for `token` can still succeed. With
    /// no service left to tell, the attempt fails instead.
    fn report_if_exhausted(&mut self, token: &str) {
        let Some(attempt) = self.by_token.get_mut(token) else {
            return;
        };
        if attempt.state == AttemptState::Failed || !attempt.is_exhausted() {
            return;
        }

        if attempt.detached {
            let Some(attempt) = self.by_token.remove(token) else {
                return;
            };
            log::info!("[connect] {} every strategy failed after losing the service", attempt.label());
            attempt.conclude(JoinResult::Failed(JoinError::ControlConnectionLost), &mut self.events);
            return;
        }

        attempt.state = AttemptState::Failed;
        log::info!("[connect] {} every strategy failed, reporting to service", attempt.label());
        self.outgoing.push(ClientMessage::ConnectFailed { token: token.to_string() });
    }

    /// Pump every live relay connection
    pub fn send_receive(&mut self) {
        for attempt in self.by_token.values_mut() {
            for stun in &mut attempt.stuns {
                stun.send_receive();
            }
        }
    }

    /// Fail attempts older than `timeout`
    pub fn check_timeouts(&mut self, dialer: &mut dyn Dialer, now: Instant, timeout: Duration) {
        let expired = |a: &ConnectAttempt| now.saturating_duration_since(a.started) >= timeout;

        let keys: Vec<String> = self.by_join_key.iter().filter(|&(_, a)| expired(a)).map(|(k, _)| k.clone()).collect();
        for key in keys {
            if let Some(attempt) = self.by_join_key.remove(&key) {
                self.time_out(dialer, attempt);
            }
        }

        let tokens: Vec<String> = self.by_token.iter().filter(|&(_, a)| expired(a)).map(|(k, _)| k.clone()).collect();
        for token in tokens {
            if let Some(attempt) = self.by_token.remove(&token) {
                self.time_out(dialer, attempt);
            }
        }
    }

    fn time_out(&mut self, dialer: &mut dyn Dialer, mut attempt: ConnectAttempt) {
        attempt.release(dialer);
        attempt.state = AttemptState::Failed;
        log::info!("[connect] {} timed out", attempt.label());
        if let Some(token) = &attempt.token {
            self.outgoing.push(ClientMessage::ConnectFailed { token: token.clone() });
        }
        attempt.conclude(JoinResult::Failed(JoinError::TimedOut), &mut self.events);
    }

    /// Drop the join for `join_key` without reporting to its callback
    pub fn cancel(&mut self, dialer: &mut dyn Dialer, join_key: &str) -> bool {
        let attempt = match self.by_join_key.remove(join_key) {
            Some(attempt) => attempt,
            None => {
                let token = self
                    .by_token
                    .iter()
                    .find(|(_, a)| a.join_key() == Some(join_key))
                    .map(|(token, _)| token.clone());
                match token.and_then(|t| self.by_token.remove(&t)) {
                    Some(attempt) => attempt,
                    None => return false,
                }
            }
        };

        let mut attempt = attempt;
        attempt.release(dialer);
        log::info!("[connect] {} cancelled", attempt.label());
        if let Some(token) = attempt.token.take() {
            self.outgoing.push(ClientMessage::ConnectFailed { token });
        }
        true
    }

    /// Fail the join for `join_key` with `error`
    pub fn fail_join_key(&mut self, dialer: &mut dyn Dialer, join_key: &str, error: JoinError) -> bool {
        let attempt = match self.by_join_key.remove(join_key) {
            Some(attempt) => Some(attempt),
            None => {
                let token = self
                    .by_token
                    .iter()
                    .find(|(_, a)| a.join_key() == Some(join_key))
                    .map(|(token, _)| token.clone());
                token.and_then(|t| self.by_token.remove(&t))
            }
        };
        let Some(mut attempt) = attempt else {
            return false;
        };

        attempt.release(dialer);
        log::info!("[connect] {} failed: {}", attempt.label(), error);
        attempt.conclude(JoinResult::Failed(error), &mut self.events);
        true
    }

    /// The control channel went away. Attempts that still need the service
    /// (no dial of their own running) fail; the rest keep dialing and fail
    /// on their own once their last dial does.
    pub fn fail_awaiting(&mut self, dialer: &mut dyn Dialer, error: JoinError) {
        let waiting = |a: &ConnectAttempt| a.state != AttemptState::Requested && a.dials.is_empty();

        let keys: Vec<String> = self.by_join_key.iter().filter(|&(_, a)| waiting(a)).map(|(k, _)| k.clone()).collect();
        let tokens: Vec<String> = self.by_token.iter().filter(|&(_, a)| waiting(a)).map(|(k, _)| k.clone()).collect();

        let mut failed: Vec<ConnectAttempt> = keys.iter().filter_map(|k| self.by_join_key.remove(k)).collect();
        failed.extend(tokens.iter().filter_map(|t| self.by_token.remove(t)));

        for mut attempt in failed {
            attempt.release(dialer);
            log::info!("[connect] {} failed: {}", attempt.label(), error);
            attempt.conclude(JoinResult::Failed(error.clone()), &mut self.events);
        }

        for attempt in self.by_token.values_mut() {
            attempt.detached = true;
            // Only relay sockets reserving a port for a running peer dial stay open.
            attempt.stuns.retain_mut(|stun| {
                if stun.state() == StunState::Handoff {
                    return true;
                }
                stun.abort(dialer);
                false
            });
        }
    }

    /// Fail joins whose CONNECT never made it onto the wire
    pub fn fail_requested(&mut self, error: JoinError) {
        let keys: Vec<String> = self
            .by_join_key
            .iter()
            .filter(|(_, a)| a.state == AttemptState::Requested)
            .map(|(k, _)| k.clone())
            .collect();

        for key in keys {
            if let Some(attempt) = self.by_join_key.remove(&key) {
                log::info!("[connect] {} failed: {}", key, error);
                attempt.conclude(JoinResult::Failed(error.clone()), &mut self.events);
            }
        }
    }

    /// Drop every attempt silently, killing its dials and relay connections
    pub fn shutdown(&mut self, dialer: &mut dyn Dialer) {
        for attempt in self.by_join_key.values_mut().chain(self.by_token.values_mut()) {
            attempt.release(dialer);
        }
        self.by_join_key.clear();
        self.by_token.clear();
        self.outgoing.clear();
        self.events.clear();
    }
}
