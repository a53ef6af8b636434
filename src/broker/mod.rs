//! In-process mock MQTT broker.
//!
//! One thread owns a mio poll, the listener, and every accepted channel.
//! Sessions are volatile: subscriptions use exact topic matching, granted
//! QoS is capped at 1, and nothing survives a restart. Outbound deliveries
//! to a subscriber ride the channel's in-flight and resend machinery, gated
//! by a per-session cap on unacknowledged messages.
//!
//! Credential policy: `ignore_credentials` accepts everything; a presented
//! username is checked against the whitelist (mismatch or unknown user is
//! `BadCredentials`); missing credentials are accepted only with
//! `allow_anonymous`, otherwise `NotAuthorized`.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::channel::{BrokerRole, Channel, ChannelError, MessageHandler};
use crate::core::stats::{MessageStats, StatsSnapshot};
use crate::core::time::now_millis;
use crate::protocol::packet::PROTOCOL_VERSION;
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, PubAck, PubComp, PubRec, PubRel, Publish, QoS, SubAck,
    Subscribe, UnsubAck, Unsubscribe,
};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CHANNEL: usize = 2;

/// Broker configuration, one field per CLI flag.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Port to bind; 0 selects an ephemeral port.
    pub port: u16,
    /// Interval between resends of unacknowledged messages; zero disables
    /// resend.
    pub resend_interval: Duration,
    /// Maximum in-flight acknowledgeable messages per client session.
    pub max_in_flight: u16,
    /// Accept connections that present no credentials.
    pub allow_anonymous: bool,
    /// Accept any connection regardless of what it presents.
    pub ignore_credentials: bool,
    /// Username to password whitelist.
    pub credentials: HashMap<String, String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port: 1883,
            resend_interval: Duration::from_secs(15),
            max_in_flight: u16::MAX,
            allow_anonymous: false,
            ignore_credentials: false,
            credentials: HashMap::new(),
        }
    }
}

/// Configuration errors, surfaced synchronously before the broker starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid credential entry {0:?}: expected user:pass")]
    InvalidCredential(String),
}

/// Parse a `user:pass[,user:pass...]` whitelist. The `:` separator is the
/// only accepted form; entries with `;` are rejected.
pub fn parse_credentials(spec: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut credentials = HashMap::new();
    for entry in spec.split(',') {
        if entry.contains(';') {
            return Err(ConfigError::InvalidCredential(entry.to_string()));
        }
        let Some((user, pass)) = entry.split_once(':') else {
            return Err(ConfigError::InvalidCredential(entry.to_string()));
        };
        if user.is_empty() || pass.is_empty() {
            return Err(ConfigError::InvalidCredential(entry.to_string()));
        }
        credentials.insert(user.to_string(), pass.to_string());
    }
    Ok(credentials)
}

/// Startup failures.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to bind port {port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error("selector setup failed: {0}")]
    Io(#[from] io::Error),
}

enum ControlMessage {
    Stop,
}

/// Handle to a running broker. Dropping it stops the broker.
pub struct BrokerHandle {
    port: u16,
    control: Sender<ControlMessage>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
    stats: Arc<MessageStats>,
}

impl BrokerHandle {
    /// The actually-bound port, useful with an ephemeral bind.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Tear down the listener and every client channel, then join the loop
    /// thread. Connections to the recorded port fail afterwards.
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.control.send(ControlMessage::Stop);
            let _ = self.waker.wake();
            let _ = thread.join();
        }
    }

    /// Block until the broker loop exits.
    pub fn wait(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bind the listener and start the broker loop on its own thread.
pub fn start(config: BrokerConfig) -> Result<BrokerHandle, BrokerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let mut listener = TcpListener::bind(addr).map_err(|source| BrokerError::Bind {
        port: config.port,
        source,
    })?;
    let port = listener.local_addr()?.port();

    let poll = Poll::new()?;
    poll.registry()
        .register(&mut listener, LISTENER, Interest::READABLE)?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
    let (control_tx, control_rx) = crossbeam_channel::unbounded();
    let stats = Arc::new(MessageStats::new());

    let resend_interval_ms = config.resend_interval.as_millis() as u64;
    let broker = BrokerLoop {
        poll,
        listener,
        control: control_rx,
        channels: HashMap::new(),
        state: BrokerState {
            config,
            sessions: HashMap::new(),
        },
        next_token: FIRST_CHANNEL,
        resend_interval_ms,
        stats: Arc::clone(&stats),
    };
    info!(port, "mock broker listening");

    let thread = std::thread::Builder::new()
        .name("quill-mock-broker".to_string())
        .spawn(move || broker.run())
        .map_err(BrokerError::Io)?;

    Ok(BrokerHandle {
        port,
        control: control_tx,
        waker,
        thread: Some(thread),
        stats,
    })
}

/// A queued delivery waiting for in-flight capacity.
struct Delivery {
    topic: String,
    payload: Bytes,
    qos: QoS,
}

/// Per-connection broker session.
struct Session {
    client_id: Option<String>,
    authenticated: bool,
    /// Exact topic to granted QoS.
    subscriptions: HashMap<String, QoS>,
    /// Deliveries waiting for in-flight capacity.
    pending: VecDeque<Delivery>,
    /// Acknowledgeable deliveries currently on the wire to this client.
    in_flight_to_client: usize,
    next_id: u16,
}

impl Session {
    fn new() -> Self {
        Self {
            client_id: None,
            authenticated: false,
            subscriptions: HashMap::new(),
            pending: VecDeque::new(),
            in_flight_to_client: 0,
            next_id: 0,
        }
    }

    /// Broker-assigned message ids, 1..=65535 with wraparound.
    fn next_message_id(&mut self) -> u16 {
        self.next_id = if self.next_id == u16::MAX {
            1
        } else {
            self.next_id + 1
        };
        self.next_id
    }
}

struct BrokerState {
    config: BrokerConfig,
    sessions: HashMap<Token, Session>,
}

impl BrokerState {
    fn evaluate_connect(&self, connect: &Connect) -> ConnectReturnCode {
        if connect.protocol_version != PROTOCOL_VERSION {
            return ConnectReturnCode::UnacceptableProtocolVersion;
        }
        if self.config.ignore_credentials {
            return ConnectReturnCode::Accepted;
        }
        match &connect.username {
            Some(username) => {
                let password = connect.password.as_deref().unwrap_or("");
                match self.config.credentials.get(username) {
                    Some(expected) if expected == password => ConnectReturnCode::Accepted,
                    _ => ConnectReturnCode::BadCredentials,
                }
            }
            None if self.config.allow_anonymous => ConnectReturnCode::Accepted,
            None => ConnectReturnCode::NotAuthorized,
        }
    }
}

/// Hand a queued or fresh delivery to the subscriber's channel, or park it
/// while the session is at its in-flight cap. QoS 0 bypasses the cap.
fn deliver(session: &mut Session, channel: &mut Channel, delivery: Delivery, max_in_flight: usize) {
    if delivery.qos == QoS::AtMostOnce {
        match Publish::new(&delivery.topic, QoS::AtMostOnce, None, delivery.payload, false) {
            Ok(publish) => {
                channel.send(publish.into(), None);
            }
            Err(err) => warn!(%err, "failed to encode delivery"),
        }
        return;
    }
    if session.in_flight_to_client >= max_in_flight {
        session.pending.push_back(delivery);
        return;
    }
    let id = session.next_message_id();
    match Publish::new(&delivery.topic, delivery.qos, Some(id), delivery.payload, false) {
        Ok(publish) => {
            session.in_flight_to_client += 1;
            channel.send(publish.into(), None);
        }
        Err(err) => warn!(%err, "failed to encode delivery"),
    }
}

/// Handler wired into every channel entry point for the duration of one
/// event. `current` is the token of the channel being driven; it is out of
/// `peers` while borrowed, so self-deliveries go through the argument.
struct BrokerHandler<'a> {
    state: &'a mut BrokerState,
    peers: &'a mut HashMap<Token, Channel>,
    current: Token,
}

impl BrokerHandler<'_> {
    fn session(&mut self) -> Option<&mut Session> {
        self.state.sessions.get_mut(&self.current)
    }

    fn authenticated(&mut self) -> bool {
        self.session().map(|s| s.authenticated).unwrap_or(false)
    }
}

impl MessageHandler for BrokerHandler<'_> {
    fn connect(&mut self, channel: &mut Channel, packet: Connect) -> Result<()> {
        let code = self.state.evaluate_connect(&packet);
        if code == ConnectReturnCode::Accepted {
            if let Some(session) = self.session() {
                session.authenticated = true;
                session.client_id = Some(packet.client_id.clone());
            }
            debug!(client_id = %packet.client_id, "client accepted");
        } else {
            debug!(client_id = %packet.client_id, ?code, "client rejected");
        }
        channel.send(ConnAck::new(code).into(), None);
        Ok(())
    }

    fn subscribe(&mut self, channel: &mut Channel, packet: Subscribe) -> Result<()> {
        if !self.authenticated() {
            return Ok(());
        }
        let mut granted = Vec::with_capacity(packet.topics.len());
        if let Some(session) = self.session() {
            for (topic, qos) in &packet.topics {
                // the mock broker routes at QoS 1 at most
                let grant = (*qos).min(QoS::AtLeastOnce);
                session.subscriptions.insert(topic.clone(), grant);
                granted.push(grant);
            }
        }
        channel.send(SubAck::new(packet.message_id, granted)?.into(), None);
        Ok(())
    }

    fn unsubscribe(&mut self, channel: &mut Channel, packet: Unsubscribe) -> Result<()> {
        if !self.authenticated() {
            return Ok(());
        }
        if let Some(session) = self.session() {
            for topic in &packet.topics {
                session.subscriptions.remove(topic);
            }
        }
        channel.send(UnsubAck::new(packet.message_id).into(), None);
        Ok(())
    }

    fn publish(&mut self, channel: &mut Channel, packet: Publish) -> Result<()> {
        if !self.authenticated() {
            return Ok(());
        }
        let max_in_flight = usize::from(self.state.config.max_in_flight);
        let targets: Vec<(Token, QoS)> = self
            .state
            .sessions
            .iter()
            .filter_map(|(token, session)| {
                session
                    .subscriptions
                    .get(&packet.topic)
                    .map(|granted| (*token, (*granted).min(packet.qos)))
            })
            .collect();

        for (token, qos) in targets {
            let delivery = Delivery {
                topic: packet.topic.clone(),
                payload: packet.payload.clone(),
                qos,
            };
            let Some(session) = self.state.sessions.get_mut(&token) else {
                continue;
            };
            let target = if token == self.current {
                Some(&mut *channel)
            } else {
                self.peers.get_mut(&token)
            };
            if let Some(target) = target {
                deliver(session, target, delivery, max_in_flight);
            }
        }

        match (packet.qos, packet.message_id) {
            (QoS::AtLeastOnce, Some(id)) => {
                channel.send(PubAck::new(id).into(), None);
            }
            (QoS::ExactlyOnce, Some(id)) => {
                channel.send(PubRec::new(id).into(), None);
            }
            _ => {}
        }
        Ok(())
    }

    fn pub_rel(&mut self, channel: &mut Channel, packet: PubRel) -> Result<()> {
        channel.send(PubComp::new(packet.message_id).into(), None);
        Ok(())
    }

    fn pub_ack(&mut self, channel: &mut Channel, _packet: PubAck) -> Result<()> {
        // a delivery slot opened up; hand out queued work
        let max_in_flight = usize::from(self.state.config.max_in_flight);
        if let Some(session) = self.state.sessions.get_mut(&self.current) {
            session.in_flight_to_client = session.in_flight_to_client.saturating_sub(1);
            while session.in_flight_to_client < max_in_flight {
                let Some(delivery) = session.pending.pop_front() else {
                    break;
                };
                deliver(session, channel, delivery, max_in_flight);
            }
        }
        Ok(())
    }

    fn channel_closed(
        &mut self,
        _channel: &mut Channel,
        cause: Option<&ChannelError>,
    ) -> Result<()> {
        if let Some(session) = self.state.sessions.remove(&self.current) {
            debug!(client_id = ?session.client_id, ?cause, "session ended");
        }
        Ok(())
    }
}

struct BrokerLoop {
    poll: Poll,
    listener: TcpListener,
    control: Receiver<ControlMessage>,
    channels: HashMap<Token, Channel>,
    state: BrokerState,
    next_token: usize,
    resend_interval_ms: u64,
    stats: Arc<MessageStats>,
}

impl BrokerLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(256);
        loop {
            let now = now_millis();
            let delay = self.housekeep_all(now);
            if self.stop_requested() {
                break;
            }

            let timeout = Duration::from_millis(delay.clamp(10, 5_000));
            if let Err(err) = self.poll.poll(&mut events, Some(timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(%err, "broker poll failed");
                break;
            }

            let now = now_millis();
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_ready(),
                    WAKER => {}
                    token => self.channel_event(
                        token,
                        event.is_readable(),
                        event.is_writable(),
                        now,
                    ),
                }
            }
            if self.stop_requested() {
                break;
            }
        }
        self.shutdown();
    }

    fn stop_requested(&self) -> bool {
        matches!(self.control.try_recv(), Ok(ControlMessage::Stop))
    }

    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    debug!(%addr, ?token, "accepted client connection");
                    let mut handler = BrokerHandler {
                        state: &mut self.state,
                        peers: &mut self.channels,
                        current: token,
                    };
                    match Channel::accepted(
                        stream,
                        Box::new(BrokerRole::new()),
                        self.poll.registry(),
                        token,
                        self.resend_interval_ms,
                        Arc::clone(&self.stats),
                        &mut handler,
                    ) {
                        Ok(channel) => {
                            self.state.sessions.insert(token, Session::new());
                            self.channels.insert(token, channel);
                        }
                        Err(err) => warn!(%addr, %err, "failed to set up accepted channel"),
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(%err, "accept failed");
                    break;
                }
            }
        }
    }

    fn channel_event(&mut self, token: Token, readable: bool, writable: bool, now: u64) {
        let Some(mut channel) = self.channels.remove(&token) else {
            return;
        };
        let mut handler = BrokerHandler {
            state: &mut self.state,
            peers: &mut self.channels,
            current: token,
        };
        if writable && channel.write(now, &mut handler) && readable {
            channel.read(now, &mut handler);
        } else if !writable && readable {
            channel.read(now, &mut handler);
        }
        if let Some(err) = channel.take_deferred_error() {
            channel.close(Some(err), &mut handler);
        }
        if channel.is_open() {
            self.channels.insert(token, channel);
        }
    }

    fn housekeep_all(&mut self, now: u64) -> u64 {
        let mut min_delay = u64::MAX;
        let tokens: Vec<Token> = self.channels.keys().copied().collect();
        for token in tokens {
            let Some(mut channel) = self.channels.remove(&token) else {
                continue;
            };
            let mut handler = BrokerHandler {
                state: &mut self.state,
                peers: &mut self.channels,
                current: token,
            };
            if let Some(err) = channel.take_deferred_error() {
                channel.close(Some(err), &mut handler);
            }
            let delay = channel.housekeep(now, &mut handler);
            if channel.is_open() {
                min_delay = min_delay.min(delay);
                self.channels.insert(token, channel);
            }
        }
        min_delay
    }

    fn shutdown(mut self) {
        debug!("mock broker shutting down");
        let tokens: Vec<Token> = self.channels.keys().copied().collect();
        for token in tokens {
            let Some(mut channel) = self.channels.remove(&token) else {
                continue;
            };
            let mut handler = BrokerHandler {
                state: &mut self.state,
                peers: &mut self.channels,
                current: token,
            };
            channel.close(None, &mut handler);
        }
        let _ = self.poll.registry().deregister(&mut self.listener);
        info!("mock broker stopped");
    }
}
