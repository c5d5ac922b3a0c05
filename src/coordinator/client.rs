/**
 * coordinator/client.rs
 *
 * Control connection to the rendezvous service
 *
 * One connection carries hosting (registration and periodic updates),
 * browsing (listing passes) and joining (connection orchestration). All
 * work happens in `send_receive`, which the embedding application calls
 * once per tick; nothing here blocks.
 */

use super::attempt::{AttemptTable, JoinError, JoinResult};
use super::protocol::{ClientMessage, ServiceErrorKind, ServiceMessage};
use super::types::{
    Backoff, ConnectionType, CoordinatorConfig, CoordinatorEvent, Visibility, COORDINATOR_PORT, STUN_PORT,
};
use crate::game_info::GameInfo;
use crate::game_list::GameList;
use crate::network::{
    supported_families, ChannelError, ConnectId, ConnectOutcome, ConnectorPool, DialOptions, Dialer, Family,
    NetworkAddress, PacketChannel, SendStatus,
};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// What we advertise while hosting
struct Hosting {
    visibility: Visibility,
    port: u16,
    info: GameInfo,
}

/// Rendezvous service client
pub struct CoordinatorClient<D: Dialer = ConnectorPool> {
    config: CoordinatorConfig,
    coordinator: NetworkAddress,
    relay: NetworkAddress,
    stun_families: Vec<Family>,
    dialer: D,

    channel: Option<PacketChannel>,
    connecting: Option<ConnectId>,
    /// Messages waiting for the control connection to open
    outbox: VecDeque<ClientMessage>,
    backoff: Backoff,
    reconnect_at: Option<Instant>,
    /// Set when the service rejects our protocol version; blocks
    /// reconnects until the next `register`
    version_mismatch: bool,

    hosting: Option<Hosting>,
    join_key: String,
    connection_type: ConnectionType,
    next_update: Option<Instant>,

    game_list: GameList,
    listing_in_progress: bool,
    listing_queued: bool,

    attempts: AttemptTable,
    events: Vec<CoordinatorEvent>,
}

impl CoordinatorClient<ConnectorPool> {
    pub fn new(config: CoordinatorConfig) -> Self {
        let dialer = ConnectorPool::new(config.connect_timeout());
        Self::with_dialer(config, dialer)
    }
}

impl<D: Dialer> CoordinatorClient<D> {
    pub fn with_dialer(config: CoordinatorConfig, dialer: D) -> Self {
        let coordinator = NetworkAddress::parse(&config.coordinator_server, COORDINATOR_PORT);
        let relay = NetworkAddress::parse(&config.stun_server, STUN_PORT);
        let stun_families = config.stun_families.clone().unwrap_or_else(supported_families);
        let backoff = Backoff::new(
            Duration::from_secs(config.reconnect_base_secs),
            Duration::from_secs(config.reconnect_max_secs),
        );

        Self {
            config,
            coordinator,
            relay,
            stun_families,
            dialer,
            channel: None,
            connecting: None,
            outbox: VecDeque::new(),
            backoff,
            reconnect_at: None,
            version_mismatch: false,
            hosting: None,
            join_key: String::new(),
            connection_type: ConnectionType::Unknown,
            next_update: None,
            game_list: GameList::new(),
            listing_in_progress: false,
            listing_queued: false,
            attempts: AttemptTable::new(),
            events: Vec::new(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Join-key assigned by the service; empty unless registered
    pub fn join_key(&self) -> &str {
        &self.join_key
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub fn game_list(&self) -> &GameList {
        &self.game_list
    }

    pub fn game_list_mut(&mut self) -> &mut GameList {
        &mut self.game_list
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    pub fn is_hosting(&self) -> bool {
        self.hosting.is_some()
    }

    pub fn is_listing(&self) -> bool {
        self.listing_in_progress
    }

    /// Joins that have not finished yet
    pub fn pending_joins(&self) -> usize {
        self.attempts.len()
    }

    /// Messages queued until the control connection opens
    pub fn queued_messages(&self) -> usize {
        self.outbox.len()
    }

    /// When the next automatic reconnect is due, if one is scheduled
    pub fn next_reconnect(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    pub fn dialer_mut(&mut self) -> &mut D {
        &mut self.dialer
    }

    /// Start hosting: register with the service, connecting first if needed
    pub fn register(&mut self, visibility: Visibility, port: u16, info: GameInfo) {
        log::info!("[coordinator] registering game on port {} ({:?})", port, visibility);

        self.version_mismatch = false;
        self.backoff.reset();
        self.reconnect_at = None;
        self.hosting = Some(Hosting { visibility, port, info });

        let Some(register) = self.register_message() else {
            return;
        };
        if self.channel.is_some() {
            self.send_message(register);
        } else {
            self.outbox.retain(|m| !matches!(m, ClientMessage::Register { .. }));
            self.outbox.push_front(register);
            self.ensure_connecting();
        }
    }

    /// Replace the snapshot sent with the next update
    pub fn update_game_info(&mut self, info: GameInfo) {
        if let Some(hosting) = self.hosting.as_mut() {
            hosting.info = info;
        }
    }

    /// Push the current game info to the service. Does nothing unless
    /// registered; returns whether an update was sent.
    pub fn send_server_update(&mut self) -> bool {
        if self.join_key.is_empty() || self.channel.is_none() {
            return false;
        }
        let Some(hosting) = &self.hosting else {
            return false;
        };

        let update = ClientMessage::Update { info: hosting.info.clone() };
        self.send_message(update);
        self.next_update = Some(Instant::now() + self.config.update_interval());
        true
    }

    /// Request a listing pass. A request made while a pass is running is
    /// held until that pass ends.
    pub fn get_listing(&mut self) {
        if self.version_mismatch {
            log::warn!("[coordinator] not requesting listing: protocol version rejected");
            return;
        }
        if self.listing_in_progress {
            self.listing_queued = true;
            return;
        }
        self.listing_in_progress = true;
        self.send_message(ClientMessage::Listing);
    }

    /// Begin joining the game behind `join_key`. `callback` receives the
    /// result exactly once, from inside a later `send_receive`.
    pub fn connect_to_server<F>(&mut self, join_key: &str, callback: F) -> Result<(), JoinError>
    where
        F: FnOnce(JoinResult) + 'static,
    {
        if self.version_mismatch {
            return Err(JoinError::ProtocolVersion);
        }
        self.attempts.begin_join(join_key, Box::new(callback), Instant::now())?;
        log::info!("[coordinator] joining +{}", join_key);
        self.send_message(ClientMessage::Connect { join_key: join_key.to_string() });
        Ok(())
    }

    /// Abandon a join; its callback is never called
    pub fn cancel_join(&mut self, join_key: &str) -> bool {
        let cancelled = self.attempts.cancel(&mut self.dialer, join_key);
        self.forward_attempt_output();
        cancelled
    }

    /// Withdraw our advertisement and close the control connection
    pub fn stop_hosting(&mut self) {
        if self.hosting.take().is_none() {
            return;
        }
        log::info!("[coordinator] no longer hosting");
        self.outbox
            .retain(|m| !matches!(m, ClientMessage::Register { .. } | ClientMessage::Update { .. }));
        self.reconnect_at = None;
        self.close_connection();
    }

    /// Tear everything down without calling any join callback
    pub fn shutdown(&mut self) {
        self.attempts.shutdown(&mut self.dialer);
        self.dialer.kill_all();
        self.channel = None;
        self.connecting = None;
        self.outbox.clear();
        self.reconnect_at = None;
        self.hosting = None;
        self.join_key.clear();
        self.connection_type = ConnectionType::Unknown;
        self.next_update = None;
        self.listing_in_progress = false;
        self.listing_queued = false;
        self.events.clear();
        log::info!("[coordinator] shut down");
    }

    /// Events produced since the last call
    pub fn take_events(&mut self) -> Vec<CoordinatorEvent> {
        self.events.extend(self.attempts.take_events());
        std::mem::take(&mut self.events)
    }

    /// Do one tick of work: reap finished connects, reconnect if due,
    /// handle a bounded batch of incoming packets, pump STUN relays,
    /// expire attempts, send the periodic update and flush the send queue
    pub fn send_receive(&mut self) {
        let now = Instant::now();

        for (id, outcome) in self.dialer.poll() {
            if self.connecting == Some(id) {
                self.connecting = None;
                self.on_control_connect(outcome);
            } else if !self.attempts.on_dial_outcome(&mut self.dialer, id, outcome) {
                log::trace!("[connect] {} finished for an attempt that is gone", id);
            }
        }

        if self.channel.is_none() && self.connecting.is_none() {
            if let Some(at) = self.reconnect_at {
                if now >= at {
                    self.reconnect_at = None;
                    self.start_connect();
                }
            }
        }

        self.receive_packets(now);

        self.attempts.send_receive();
        self.attempts
            .check_timeouts(&mut self.dialer, now, self.config.join_timeout());

        if self.next_update.is_some_and(|at| now >= at) {
            self.send_server_update();
        }

        self.forward_attempt_output();

        if let Some(channel) = self.channel.as_mut() {
            if channel.send_packets() == SendStatus::Closed {
                log::warn!("[coordinator] connection lost while sending");
                self.close_connection();
            }
        }
    }

    fn receive_packets(&mut self, now: Instant) {
        for _ in 0..self.config.max_packets_per_tick {
            let Some(channel) = self.channel.as_mut() else {
                return;
            };

            match channel.receive_packet() {
                Ok(Some(mut packet)) => match ServiceMessage::from_packet(&mut packet) {
                    Ok(message) => self.handle_message(message, now),
                    Err(e) => {
                        log::warn!("[coordinator] invalid packet type {}: {}", packet.packet_type(), e);
                        self.close_connection();
                        return;
                    }
                },
                Ok(None) => return,
                Err(ChannelError::Closed) => {
                    log::warn!("[coordinator] connection closed by service");
                    self.close_connection();
                    return;
                }
                Err(ChannelError::Malformed(e)) => {
                    log::warn!("[coordinator] malformed packet: {}", e);
                    self.close_connection();
                    return;
                }
            }
        }
    }

    fn handle_message(&mut self, message: ServiceMessage, now: Instant) {
        log::trace!("[coordinator] received {}", message.name());

        match message {
            ServiceMessage::RegisterAck { join_key, connection_type } => {
                log::info!("[coordinator] registered as +{} ({:?})", join_key, connection_type);
                if connection_type == ConnectionType::Isolated {
                    log::warn!("[coordinator] game is not reachable from the internet");
                }
                self.backoff.reset();
                self.join_key = join_key.clone();
                self.connection_type = connection_type;
                self.next_update = Some(now + self.config.update_interval());
                self.events.push(CoordinatorEvent::Registered { join_key, connection_type });
            }
            ServiceMessage::Listing { games } => {
                if games.is_empty() {
                    self.finish_listing();
                    return;
                }
                for game in games {
                    self.game_list.update_from_listing(game, &self.config.revision);
                }
            }
            ServiceMessage::Connecting { token, join_key } => {
                self.attempts.on_connecting(&token, &join_key);
            }
            ServiceMessage::ConnectFailed { token } => {
                self.attempts.on_connect_failed(&mut self.dialer, &token);
            }
            ServiceMessage::DirectConnect { token, host, port } => {
                self.attempts.on_direct_connect(&mut self.dialer, &token, &host, port);
            }
            ServiceMessage::StunRequest { token } => {
                self.attempts.on_stun_request(
                    &mut self.dialer,
                    &self.relay,
                    &self.stun_families,
                    &token,
                    self.hosting.is_some(),
                    now,
                );
            }
            ServiceMessage::StunConnect { token, family, host, port } => {
                self.attempts
                    .on_stun_connect(&mut self.dialer, &token, family, &host, port);
            }
            ServiceMessage::Error { kind, detail } => self.handle_error(kind, detail),
        }
    }

    fn handle_error(&mut self, kind: ServiceErrorKind, detail: String) {
        match kind {
            ServiceErrorKind::ProtocolVersion => {
                log::error!("[coordinator] service rejected our protocol version: {}", detail);
                self.version_mismatch = true;
                self.attempts
                    .fail_awaiting(&mut self.dialer, JoinError::ProtocolVersion);
                self.attempts.fail_requested(JoinError::ProtocolVersion);
                self.close_connection();
            }
            ServiceErrorKind::RegistrationFailed => {
                log::error!("[coordinator] registration failed: {}", detail);
                self.hosting = None;
                self.events.push(CoordinatorEvent::RegistrationRejected { detail });
                self.close_connection();
            }
            ServiceErrorKind::InvalidJoinKey => {
                let error = JoinError::InvalidJoinKey(detail.clone());
                if !self.attempts.fail_join_key(&mut self.dialer, &detail, error) {
                    log::warn!("[coordinator] invalid join-key {} for no pending join", detail);
                }
            }
            ServiceErrorKind::General => {
                log::error!("[coordinator] service error: {}", detail);
                self.close_connection();
            }
        }
    }

    fn finish_listing(&mut self) {
        let removed = self.game_list.remove_expired();
        log::debug!(
            "[gamelist] listing pass {} done: {} servers, {} expired",
            self.game_list.version(),
            self.game_list.len(),
            removed
        );
        self.listing_in_progress = false;
        self.events.push(CoordinatorEvent::ListingChanged);

        if self.listing_queued {
            self.listing_queued = false;
            self.get_listing();
        }
    }

    /// Send now if connected, otherwise queue and start connecting
    fn send_message(&mut self, message: ClientMessage) {
        let Some(channel) = self.channel.as_mut() else {
            if let ClientMessage::ConnectFailed { token } = &message {
                // Tokens do not outlive the connection they were issued on.
                log::debug!("[coordinator] dropping CONNECT_FAILED {} while disconnected", token);
                return;
            }
            self.outbox.push_back(message);
            self.ensure_connecting();
            return;
        };

        log::trace!("[coordinator] sending {}", message.name());
        if let Err(e) = channel.send_packet(message.to_packet()) {
            log::warn!("[coordinator] cannot send {}: {}", message.name(), e);
            return;
        }

        match &message {
            ClientMessage::Connect { join_key } => self.attempts.mark_sent(join_key),
            ClientMessage::Listing => {
                self.game_list.begin_pass();
            }
            _ => {}
        }
    }

    fn forward_attempt_output(&mut self) {
        for message in self.attempts.take_outgoing() {
            self.send_message(message);
        }
        self.events.extend(self.attempts.take_events());
    }

    fn register_message(&self) -> Option<ClientMessage> {
        self.hosting.as_ref().map(|h| ClientMessage::Register {
            visibility: h.visibility,
            port: h.port,
            info: h.info.clone(),
        })
    }

    fn should_reconnect(&self) -> bool {
        self.hosting.is_some() && !self.version_mismatch
    }

    fn ensure_connecting(&mut self) {
        if self.channel.is_some() || self.connecting.is_some() || self.version_mismatch {
            return;
        }
        self.reconnect_at = None;
        self.start_connect();
    }

    fn start_connect(&mut self) {
        log::info!("[coordinator] connecting to {}", self.coordinator);
        self.connecting = Some(self.dialer.dial(self.coordinator.clone(), DialOptions::default()));
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.backoff.next_delay();
        self.reconnect_at = Instant::now().checked_add(delay);
        match self.reconnect_at {
            Some(_) => log::warn!("[coordinator] reconnecting in {} seconds", delay.as_secs()),
            None => log::error!("[coordinator] reconnect delay of {} seconds is out of range", delay.as_secs()),
        }
    }

    fn on_control_connect(&mut self, outcome: ConnectOutcome) {
        let stream = match outcome {
            ConnectOutcome::Connected { stream, .. } => stream,
            ConnectOutcome::Failed(e) => {
                self.on_control_unreachable(e.to_string());
                return;
            }
        };

        match PacketChannel::from_tcp(stream) {
            Ok(channel) => {
                log::info!("[coordinator] connected to {}", self.coordinator);
                self.channel = Some(channel);
                while let Some(message) = self.outbox.pop_front() {
                    self.send_message(message);
                }
            }
            Err(e) => self.on_control_unreachable(e.to_string()),
        }
    }

    fn on_control_unreachable(&mut self, reason: String) {
        log::warn!("[coordinator] cannot reach {}: {}", self.coordinator, reason);
        if self.should_reconnect() {
            self.schedule_reconnect();
            return;
        }

        self.outbox.clear();
        self.listing_in_progress = false;
        self.listing_queued = false;
        self.attempts.fail_requested(JoinError::ServiceUnreachable(reason));
        self.forward_attempt_output();
    }

    /// Drop the control connection and everything scoped to it
    fn close_connection(&mut self) {
        let was_open = self.channel.take().is_some();
        if let Some(id) = self.connecting.take() {
            self.dialer.kill(id);
        }

        self.join_key.clear();
        self.connection_type = ConnectionType::Unknown;
        self.next_update = None;
        self.listing_in_progress = false;
        self.listing_queued = false;

        self.attempts
            .fail_awaiting(&mut self.dialer, JoinError::ControlConnectionLost);
        if was_open {
            log::info!("[coordinator] disconnected from {}", self.coordinator);
            self.events.push(CoordinatorEvent::Disconnected);
        }

        if self.should_reconnect() {
            if let Some(register) = self.register_message() {
                self.outbox.retain(|m| !matches!(m, ClientMessage::Register { .. }));
                self.outbox.push_front(register);
            }
            self.schedule_reconnect();
        } else {
            self.outbox.clear();
            self.attempts.fail_requested(JoinError::ControlConnectionLost);
        }
        self.forward_attempt_output();
    }
}
