//! Blocking MQTT client.
//!
//! A thin synchronous façade over one outgoing [`Channel`] driven by a
//! background loop thread. Each request couples a send to a completion
//! handle and blocks the caller until the broker acknowledges it; received
//! publishes surface on a queue the caller drains with
//! [`BlockingClient::recv_publish`] and acknowledges explicitly. There is no
//! reconnect logic: when the channel closes the client is finished.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use mio::{Events, Poll, Token, Waker};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::channel::{
    Channel, ChannelError, ClientRole, Completion, CompletionError, MessageHandler,
};
use crate::core::stats::MessageStats;
use crate::core::time::now_millis;
use crate::protocol::{
    Connect, ConnectReturnCode, Disconnect, Packet, ProtocolError, PubAck, PubComp, PubRec,
    PubRel, Publish, QoS, Subscribe, Unsubscribe,
};

const CHANNEL: Token = Token(0);
const WAKER: Token = Token(1);

/// Options for [`BlockingClient::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive_secs: u16,
    pub credentials: Option<(String, String)>,
    /// Interval between resends of unacknowledged messages; zero disables
    /// resend.
    pub resend_interval: Duration,
    /// How long blocking calls wait for their acknowledgement.
    pub timeout: Duration,
}

impl ConnectOptions {
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            clean_session: true,
            keep_alive_secs: 300,
            credentials: None,
            resend_interval: Duration::from_secs(15),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }
}

/// Client-side failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("client setup failed: {0}")]
    Setup(#[source] ChannelError),
    #[error("request failed: {0}")]
    Failed(#[source] ChannelError),
    #[error("request was cancelled")]
    Cancelled,
    #[error("timed out waiting for acknowledgement")]
    TimedOut,
    #[error("broker sent an unexpected acknowledgement")]
    UnexpectedAck,
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl From<CompletionError> for ClientError {
    fn from(err: CompletionError) -> Self {
        match err {
            CompletionError::Failed(cause) => Self::Failed(cause),
            CompletionError::Cancelled => Self::Cancelled,
            CompletionError::TimedOut => Self::TimedOut,
        }
    }
}

enum Command {
    Send {
        packet: Packet,
        completion: Option<Completion>,
    },
    Shutdown,
}

/// Synchronous MQTT 3.1 client backed by a selector thread.
pub struct BlockingClient {
    commands: Sender<Command>,
    waker: Arc<Waker>,
    publishes: Receiver<Publish>,
    thread: Option<JoinHandle<()>>,
    next_id: AtomicU16,
    timeout: Duration,
}

impl BlockingClient {
    /// Open a connection and complete the MQTT session handshake. Returns
    /// the client together with the broker's ConnAck return code; on any
    /// code other than `Accepted` the channel is already closed.
    pub fn connect(
        addr: SocketAddr,
        options: ConnectOptions,
    ) -> Result<(Self, ConnectReturnCode), ClientError> {
        let poll = Poll::new()
            .map_err(|err| ClientError::Setup(err.into()))?;
        let waker = Arc::new(
            Waker::new(poll.registry(), WAKER).map_err(|err| ClientError::Setup(err.into()))?,
        );
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let (publish_tx, publish_rx) = crossbeam_channel::unbounded();

        let (username, password) = match &options.credentials {
            Some((username, password)) => (Some(username.as_str()), Some(password.as_str())),
            None => (None, None),
        };
        let connect_packet = Connect::new(
            &options.client_id,
            options.clean_session,
            options.keep_alive_secs,
            username,
            password,
            None,
        )?;

        let mut handler = ClientHandler {
            publishes: publish_tx,
        };
        let connection_complete = Completion::new();
        let channel = Channel::connecting(
            addr,
            Box::new(ClientRole::new()),
            poll.registry(),
            CHANNEL,
            options.resend_interval.as_millis() as u64,
            Some(connection_complete),
            Arc::new(MessageStats::new()),
            &mut handler,
        )
        .map_err(ClientError::Setup)?;

        let client_loop = ClientLoop {
            poll,
            channel,
            commands: command_rx,
            handler,
        };
        let thread = std::thread::Builder::new()
            .name("quill-client".to_string())
            .spawn(move || client_loop.run())
            .map_err(|err| ClientError::Setup(err.into()))?;

        let client = Self {
            commands: command_tx,
            waker,
            publishes: publish_rx,
            thread: Some(thread),
            next_id: AtomicU16::new(1),
            timeout: options.timeout,
        };

        let conn_ack = Completion::new();
        client.dispatch(connect_packet.into(), Some(conn_ack.clone()))?;
        match conn_ack.wait(client.timeout)? {
            Some(Packet::ConnAck(ack)) => Ok((client, ack.return_code)),
            _ => Err(ClientError::UnexpectedAck),
        }
    }

    /// Subscribe and block for the granted QoS list.
    pub fn subscribe(&self, topics: &[(&str, QoS)]) -> Result<Vec<QoS>, ClientError> {
        let packet = Subscribe::new(self.next_message_id(), topics)?;
        let completion = Completion::new();
        self.dispatch(packet.into(), Some(completion.clone()))?;
        match completion.wait(self.timeout)? {
            Some(Packet::SubAck(ack)) => Ok(ack.granted),
            _ => Err(ClientError::UnexpectedAck),
        }
    }

    /// Unsubscribe and block for the UnsubAck.
    pub fn unsubscribe(&self, topics: &[&str]) -> Result<(), ClientError> {
        let packet = Unsubscribe::new(self.next_message_id(), topics)?;
        let completion = Completion::new();
        self.dispatch(packet.into(), Some(completion.clone()))?;
        completion.wait(self.timeout)?;
        Ok(())
    }

    /// Publish and block until the transfer is acknowledged: socket drain
    /// for QoS 0, PubAck for QoS 1, PubRec for QoS 2 (the release handshake
    /// continues in the background).
    pub fn publish(&self, topic: &str, qos: QoS, payload: &[u8]) -> Result<(), ClientError> {
        let message_id = (qos != QoS::AtMostOnce).then(|| self.next_message_id());
        let packet = Publish::new(topic, qos, message_id, Bytes::copy_from_slice(payload), false)?;
        let completion = Completion::new();
        self.dispatch(packet.into(), Some(completion.clone()))?;
        completion.wait(self.timeout)?;
        Ok(())
    }

    /// Next delivery routed to this client, if one arrives within `timeout`.
    pub fn recv_publish(&self, timeout: Duration) -> Option<Publish> {
        self.publishes.recv_timeout(timeout).ok()
    }

    /// Acknowledge a received QoS 1 delivery.
    pub fn ack(&self, publish: &Publish) -> Result<(), ClientError> {
        if let Some(id) = publish.message_id {
            self.dispatch(PubAck::new(id).into(), None)?;
        }
        Ok(())
    }

    /// Send Disconnect and wait for the channel to wind down.
    pub fn disconnect(&mut self) -> Result<(), ClientError> {
        let completion = Completion::new();
        self.dispatch(Disconnect::new().into(), Some(completion.clone()))?;
        let _ = completion.wait(self.timeout);
        self.join();
        Ok(())
    }

    /// Drop the connection without the Disconnect handshake. Pending
    /// completions are cancelled.
    pub fn close(&mut self) {
        if self.thread.is_some() {
            let _ = self.commands.send(Command::Shutdown);
            let _ = self.waker.wake();
            self.join();
        }
    }

    fn dispatch(&self, packet: Packet, completion: Option<Completion>) -> Result<(), ClientError> {
        self.commands
            .send(Command::Send { packet, completion })
            .map_err(|_| ClientError::Failed(ChannelError::Closed))?;
        let _ = self.waker.wake();
        Ok(())
    }

    fn next_message_id(&self) -> u16 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for BlockingClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handler for the client side: publishes go to the caller's queue and the
/// QoS 2 receive handshake is answered inline.
struct ClientHandler {
    publishes: Sender<Publish>,
}

impl MessageHandler for ClientHandler {
    fn publish(&mut self, _channel: &mut Channel, packet: Publish) -> Result<()> {
        if self.publishes.send(packet).is_err() {
            warn!("dropping delivery: client receiver is gone");
        }
        Ok(())
    }

    fn pub_rec(&mut self, channel: &mut Channel, packet: PubRec) -> Result<()> {
        channel.send(PubRel::new(packet.message_id).into(), None);
        Ok(())
    }

    fn pub_rel(&mut self, channel: &mut Channel, packet: PubRel) -> Result<()> {
        channel.send(PubComp::new(packet.message_id).into(), None);
        Ok(())
    }

    fn channel_closed(
        &mut self,
        _channel: &mut Channel,
        cause: Option<&ChannelError>,
    ) -> Result<()> {
        debug!(?cause, "client channel closed");
        Ok(())
    }
}

struct ClientLoop {
    poll: Poll,
    channel: Channel,
    commands: Receiver<Command>,
    handler: ClientHandler,
}

impl ClientLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(64);
        'outer: loop {
            let now = now_millis();
            let delay = self.channel.housekeep(now, &mut self.handler);
            if !self.channel.is_open() || !self.drain_commands() {
                break;
            }

            let timeout = Duration::from_millis(delay.clamp(10, 5_000));
            if let Err(err) = self.poll.poll(&mut events, Some(timeout)) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(%err, "client poll failed");
                break;
            }

            let now = now_millis();
            for event in events.iter() {
                if event.token() != CHANNEL {
                    continue;
                }
                if event.is_writable() {
                    if self.channel.is_connection_pending()
                        && !self.channel.finish_connect(&mut self.handler)
                    {
                        break 'outer;
                    }
                    self.channel.write(now, &mut self.handler);
                }
                if event.is_readable() {
                    self.channel.read(now, &mut self.handler);
                }
            }
            if let Some(err) = self.channel.take_deferred_error() {
                self.channel.close(Some(err), &mut self.handler);
            }
            if !self.channel.is_open() {
                break;
            }
        }

        if self.channel.is_open() {
            self.channel.close(None, &mut self.handler);
        }
        // anything enqueued after the close resolves as closed
        while let Ok(Command::Send { completion, .. }) = self.commands.try_recv() {
            if let Some(completion) = completion {
                completion.fail(ChannelError::Closed);
            }
        }
    }

    /// Returns `false` when a shutdown was requested.
    fn drain_commands(&mut self) -> bool {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Send { packet, completion } => {
                    self.channel.send(packet, completion);
                }
                Command::Shutdown => return false,
            }
        }
        true
    }
}
