//! Per-connection MQTT channel engine.
//!
//! A [`Channel`] drives one non-blocking TCP connection: it frames and
//! parses inbound control packets, drains an outbound FIFO through an
//! in-progress send slot, tracks acknowledgeable packets in flight, resends
//! overdue ones with the duplicate flag set, and runs keep-alive through the
//! injected [`ChannelRole`]. A single selector thread owns a channel and is
//! the only caller of its entry points; cross-thread interaction happens
//! through [`Completion`] handles, which are internally synchronized.
//!
//! Time is injected: every operation that consults "now" takes it in
//! milliseconds from the outer loop. The handler is owned by the loop and
//! passed into each entry point rather than stored on the channel.
//!
//! Entry points return `false` once the channel has closed; close runs
//! exactly once and resolves every still-pending completion (failed when a
//! cause is given, cancelled on a clean close) before the single
//! `channel_closed` upcall.

mod completion;
mod error;
mod handler;
mod role;

pub use completion::{Completion, CompletionError};
pub use error::ChannelError;
pub use handler::MessageHandler;
pub use role::{BrokerRole, ChannelRole, ClientRole, KeepAlive, PingReply};

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, error, warn};

use crate::core::stats::MessageStats;
use crate::protocol::{ConnectReturnCode, Packet, PingReq, PingResp};

/// Lookahead when collecting due resends, so one housekeeping pass batches
/// entries that would otherwise each wake the loop.
const RESEND_BATCH_WINDOW_MS: u64 = 1000;

/// A packet owned by the channel until it fully drains and, for ackables,
/// until its acknowledgement arrives.
struct Outbound {
    packet: Packet,
    cursor: usize,
    /// Wall time of the first transmission; not updated on resend.
    original_send_time: u64,
    /// When this packet becomes eligible for resend, if it is ackable and
    /// resend is enabled.
    next_send_time: u64,
    completion: Option<Completion>,
}

impl Outbound {
    fn new(packet: Packet, completion: Option<Completion>) -> Self {
        Self {
            packet,
            cursor: 0,
            original_send_time: 0,
            next_send_time: 0,
            completion,
        }
    }
}

/// Inbound framing state.
enum ReadPhase {
    /// Accumulating the two-byte prelude: fixed header byte plus the first
    /// remaining-length byte.
    Prelude,
    /// The first length byte had its continuation bit set; reading up to
    /// three more length bytes, one at a time.
    ExtLength,
    /// Filling the body buffer, which already holds the full fixed header so
    /// the packet can be resent byte-identical.
    Body { buf: Vec<u8>, filled: usize },
}

enum ReadStep {
    Progress,
    WouldBlock,
    Eof,
    Failed(io::Error),
    Frame(Vec<u8>),
}

/// One MQTT connection and all of its bookkeeping.
pub struct Channel {
    stream: TcpStream,
    registry: Registry,
    token: Token,
    /// Whether this channel currently holds a selector registration.
    attached: bool,
    /// The interest set the poll is actually watching; `None` when the
    /// desired set is empty and the stream is parked outside the poll.
    polled_interest: Option<Interest>,
    connect_pending: bool,
    read_paused: bool,
    close_called: bool,
    connected: bool,

    role: Box<dyn ChannelRole>,
    resend_interval_ms: u64,
    ping_interval_ms: u64,
    last_received_time: u64,
    last_sent_time: u64,

    header: [u8; 5],
    header_len: usize,
    phase: ReadPhase,

    in_progress: Option<Outbound>,
    write_queue: VecDeque<Outbound>,
    in_flight: HashMap<u16, Outbound>,
    /// Scratch space for one housekeeping pass; empty between calls.
    resend_staging: Vec<Outbound>,

    connection_complete: Option<Completion>,
    conn_ack_received: Option<Completion>,

    stats: Arc<MessageStats>,
    deferred_error: Option<ChannelError>,
}

impl Channel {
    /// Wrap an already-accepted socket. Registers read interest and emits
    /// `channel_opened` immediately.
    pub fn accepted(
        stream: TcpStream,
        role: Box<dyn ChannelRole>,
        registry: &Registry,
        token: Token,
        resend_interval_ms: u64,
        stats: Arc<MessageStats>,
        handler: &mut dyn MessageHandler,
    ) -> Result<Self, ChannelError> {
        let mut channel = Self::bare(stream, role, registry, token, resend_interval_ms, stats)?;
        if let Err(err) = channel
            .registry
            .register(&mut channel.stream, token, Interest::READABLE)
        {
            let cause = ChannelError::from(err);
            channel.close(Some(cause.clone()), handler);
            return Err(cause);
        }
        channel.attached = true;
        channel.polled_interest = Some(Interest::READABLE);
        debug!(channel = %channel.describe(), "channel opened");
        let result = handler.channel_opened(&mut channel);
        channel.absorb("channel_opened", result.err());
        Ok(channel)
    }

    /// Start an outgoing connection. Registers write interest so the loop
    /// learns when the TCP connect resolves, at which point it must call
    /// [`Channel::finish_connect`].
    pub fn connecting(
        addr: SocketAddr,
        role: Box<dyn ChannelRole>,
        registry: &Registry,
        token: Token,
        resend_interval_ms: u64,
        connection_complete: Option<Completion>,
        stats: Arc<MessageStats>,
        handler: &mut dyn MessageHandler,
    ) -> Result<Self, ChannelError> {
        let stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(err) => {
                let cause = ChannelError::ConnectFailed(err.to_string());
                if let Some(completion) = &connection_complete {
                    completion.fail(cause.clone());
                }
                return Err(cause);
            }
        };
        let mut channel = Self::bare(stream, role, registry, token, resend_interval_ms, stats)?;
        channel.connect_pending = true;
        channel.connection_complete = connection_complete;
        if let Err(err) = channel
            .registry
            .register(&mut channel.stream, token, Interest::WRITABLE)
        {
            let cause = ChannelError::from(err);
            channel.close(Some(cause.clone()), handler);
            return Err(cause);
        }
        channel.attached = true;
        channel.polled_interest = Some(Interest::WRITABLE);
        debug!(peer = %addr, "connecting client channel");
        Ok(channel)
    }

    fn bare(
        stream: TcpStream,
        role: Box<dyn ChannelRole>,
        registry: &Registry,
        token: Token,
        resend_interval_ms: u64,
        stats: Arc<MessageStats>,
    ) -> Result<Self, ChannelError> {
        Ok(Self {
            stream,
            registry: registry.try_clone().map_err(ChannelError::from)?,
            token,
            attached: false,
            polled_interest: None,
            connect_pending: false,
            read_paused: false,
            close_called: false,
            connected: false,
            role,
            resend_interval_ms,
            ping_interval_ms: 0,
            last_received_time: 0,
            last_sent_time: 0,
            header: [0u8; 5],
            header_len: 0,
            phase: ReadPhase::Prelude,
            in_progress: None,
            write_queue: VecDeque::new(),
            in_flight: HashMap::new(),
            resend_staging: Vec::new(),
            connection_complete: None,
            conn_ack_received: None,
            stats,
            deferred_error: None,
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_open(&self) -> bool {
        !self.close_called
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_connection_pending(&self) -> bool {
        self.connect_pending
    }

    pub fn send_queue_depth(&self) -> usize {
        self.write_queue.len() + usize::from(self.in_progress.is_some())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn remote_addr(&self) -> String {
        self.stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "n/a".to_string())
    }

    pub fn local_addr(&self) -> String {
        self.stream
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "n/a".to_string())
    }

    fn describe(&self) -> String {
        format!("{}->{}", self.local_addr(), self.remote_addr())
    }

    /// An interest-update failure recorded outside an entry point that could
    /// close the channel itself. The loop closes the channel with it.
    pub fn take_deferred_error(&mut self) -> Option<ChannelError> {
        self.deferred_error.take()
    }

    /// Stop reading from the socket without closing; inbound bytes queue in
    /// the kernel until [`Channel::resume_read`].
    pub fn pause_read(&mut self) {
        self.read_paused = true;
        self.update_interest();
    }

    pub fn resume_read(&mut self) {
        self.read_paused = false;
        self.update_interest();
    }

    /// Complete a pending outgoing TCP connect. Returns `false` once the
    /// channel has closed.
    pub fn finish_connect(&mut self, handler: &mut dyn MessageHandler) -> bool {
        if self.close_called {
            return false;
        }
        if !self.connect_pending {
            return true;
        }

        let error = match self.stream.take_error() {
            Ok(Some(err)) | Err(err) => Some(err),
            Ok(None) => match self.stream.peer_addr() {
                Ok(_) => None,
                Err(err)
                    if err.kind() == io::ErrorKind::NotConnected
                        || err.kind() == io::ErrorKind::WouldBlock =>
                {
                    // still in progress; wait for the next writable event
                    return true;
                }
                Err(err) => Some(err),
            },
        };
        if let Some(err) = error {
            let cause = ChannelError::ConnectFailed(err.to_string());
            self.close(Some(cause), handler);
            // the caller is still blocked on the connect and holds no channel
            // reference, so nothing else will resolve these
            self.cancel_pending();
            return false;
        }

        self.connect_pending = false;
        self.update_interest();
        if let Some(completion) = self.connection_complete.take() {
            completion.complete();
        }
        debug!(channel = %self.describe(), "finished connecting");
        let result = handler.channel_opened(self);
        self.absorb("channel_opened", result.err());
        true
    }

    /// Queue a packet for transmission, optionally coupling it to a
    /// completion handle. For Connect the completion becomes the channel's
    /// conn-ack-received command and resolves when the ConnAck arrives; for
    /// ackable packets it resolves when the matching ack arrives; for
    /// everything else it resolves when the packet drains to the socket.
    ///
    /// Must be called on the selector thread; other threads route sends
    /// through the loop's command queue.
    pub fn send(&mut self, packet: Packet, completion: Option<Completion>) -> bool {
        if self.close_called {
            if let Some(completion) = completion {
                completion.fail(ChannelError::Closed);
            }
            return false;
        }
        let mut outbound = Outbound::new(packet, completion);
        if matches!(outbound.packet, Packet::Connect(_)) {
            self.conn_ack_received = outbound.completion.take();
        }
        debug!(
            channel = %self.describe(),
            packet = ?outbound.packet.packet_type(),
            "queueing send"
        );
        self.submit(outbound);
        true
    }

    fn submit(&mut self, mut outbound: Outbound) {
        outbound.cursor = 0;
        if self.in_progress.is_some() {
            self.write_queue.push_back(outbound);
        } else {
            self.in_progress = Some(outbound);
            self.update_interest();
        }
    }

    /// Drain the in-progress send and whatever queues behind it until the
    /// socket stops taking bytes. Returns `false` once the channel has
    /// closed.
    pub fn write(&mut self, now: u64, handler: &mut dyn MessageHandler) -> bool {
        if self.close_called {
            return false;
        }
        while let Some(mut outbound) = self.in_progress.take() {
            while outbound.cursor < outbound.packet.bytes().len() {
                match self.stream.write(&outbound.packet.bytes()[outbound.cursor..]) {
                    Ok(0) => {
                        self.in_progress = Some(outbound);
                        return true;
                    }
                    Ok(n) => outbound.cursor += n,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        self.in_progress = Some(outbound);
                        return true;
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        self.in_progress = Some(outbound);
                        self.close(Some(err.into()), handler);
                        return false;
                    }
                }
            }
            if !self.finish_send(now, outbound, handler) {
                return false;
            }
        }
        self.update_interest();
        true
    }

    /// Bookkeeping for one fully-drained packet. Returns `false` when the
    /// packet's type requires the channel to close.
    fn finish_send(
        &mut self,
        now: u64,
        mut outbound: Outbound,
        handler: &mut dyn MessageHandler,
    ) -> bool {
        self.last_sent_time = self.last_sent_time.max(now);
        debug!(
            channel = %self.describe(),
            packet = ?outbound.packet.packet_type(),
            "sent"
        );
        let result = handler.message_sent(self, &outbound.packet);
        self.absorb("message_sent", result.err());
        let duplicate = outbound.packet.is_duplicate();
        self.stats.message_sent(duplicate);
        if !duplicate {
            outbound.original_send_time = now;
        }

        match &outbound.packet {
            Packet::Connect(connect) => {
                self.ping_interval_ms = u64::from(connect.keep_alive_secs) * 1000;
            }
            Packet::ConnAck(ack) => {
                if ack.return_code == ConnectReturnCode::Accepted {
                    if !self.connected {
                        self.connected = true;
                        self.role.connected(self.ping_interval_ms);
                    }
                } else {
                    if let Some(completion) = outbound.completion.take() {
                        completion.complete();
                    }
                    self.close(None, handler);
                    return false;
                }
            }
            Packet::Disconnect(_) => {
                if let Some(completion) = outbound.completion.take() {
                    completion.complete();
                }
                self.close(None, handler);
                return false;
            }
            _ => {}
        }

        if let Some(id) = outbound.packet.ack_id() {
            if self.resend_interval_ms > 0 {
                outbound.next_send_time = now + self.resend_interval_ms;
            }
            // one entry per id; a higher layer reusing a live id overwrites
            self.in_flight.insert(id, outbound);
        } else if !matches!(outbound.packet, Packet::Connect(_)) {
            if let Some(completion) = outbound.completion.take() {
                completion.complete();
            }
        }

        self.in_progress = self.write_queue.pop_front();
        true
    }

    /// Consume readable bytes, dispatching every completed packet. Returns
    /// `false` once the channel has closed.
    pub fn read(&mut self, now: u64, handler: &mut dyn MessageHandler) -> bool {
        if self.close_called {
            return false;
        }
        if self.read_paused {
            return true;
        }
        loop {
            match self.pump() {
                ReadStep::Progress => {}
                ReadStep::WouldBlock => return true,
                ReadStep::Eof => {
                    self.close(None, handler);
                    return false;
                }
                ReadStep::Failed(err) => {
                    self.close(Some(err.into()), handler);
                    return false;
                }
                ReadStep::Frame(frame) => {
                    if !self.dispatch(now, frame, handler) {
                        self.close(None, handler);
                        return false;
                    }
                    if self.read_paused {
                        return true;
                    }
                }
            }
        }
    }

    /// Advance the framing state machine by one socket operation.
    fn pump(&mut self) -> ReadStep {
        match &mut self.phase {
            ReadPhase::Prelude => {
                if self.header_len < 2 {
                    match self.stream.read(&mut self.header[self.header_len..2]) {
                        Ok(0) => return ReadStep::Eof,
                        Ok(n) => self.header_len += n,
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            return ReadStep::WouldBlock
                        }
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                            return ReadStep::Progress
                        }
                        Err(err) => return ReadStep::Failed(err),
                    }
                    if self.header_len < 2 {
                        return ReadStep::Progress;
                    }
                }
                let len_byte = self.header[1];
                if len_byte == 0 {
                    let frame = self.header[..2].to_vec();
                    self.reset_framing();
                    return ReadStep::Frame(frame);
                }
                if len_byte & 0x80 == 0 {
                    self.begin_body(usize::from(len_byte & 0x7F));
                } else {
                    self.phase = ReadPhase::ExtLength;
                }
                ReadStep::Progress
            }
            ReadPhase::ExtLength => {
                let idx = self.header_len;
                match self.stream.read(&mut self.header[idx..idx + 1]) {
                    Ok(0) => return ReadStep::Eof,
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return ReadStep::WouldBlock
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                        return ReadStep::Progress
                    }
                    Err(err) => return ReadStep::Failed(err),
                }
                self.header_len += 1;
                if self.header[idx] & 0x80 == 0 {
                    let remaining = self.remaining_from_header();
                    self.begin_body(remaining);
                } else if self.header_len == self.header.len() {
                    return ReadStep::Failed(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "remaining length field exceeds four bytes",
                    ));
                }
                ReadStep::Progress
            }
            ReadPhase::Body { buf, filled } => {
                if *filled < buf.len() {
                    match self.stream.read(&mut buf[*filled..]) {
                        Ok(0) => return ReadStep::Eof,
                        Ok(n) => *filled += n,
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            return ReadStep::WouldBlock
                        }
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                            return ReadStep::Progress
                        }
                        Err(err) => return ReadStep::Failed(err),
                    }
                }
                if *filled == buf.len() {
                    let frame = std::mem::take(buf);
                    self.reset_framing();
                    return ReadStep::Frame(frame);
                }
                ReadStep::Progress
            }
        }
    }

    fn remaining_from_header(&self) -> usize {
        let mut value = 0usize;
        let mut multiplier = 1usize;
        for &byte in &self.header[1..self.header_len] {
            value += usize::from(byte & 0x7F) * multiplier;
            multiplier <<= 7;
        }
        value
    }

    /// Allocate the body buffer, pre-seeded with the accumulated fixed
    /// header so the assembled frame is wire-identical.
    fn begin_body(&mut self, remaining: usize) {
        let mut buf = vec![0u8; self.header_len + remaining];
        buf[..self.header_len].copy_from_slice(&self.header[..self.header_len]);
        let filled = self.header_len;
        self.phase = ReadPhase::Body { buf, filled };
    }

    fn reset_framing(&mut self) {
        self.header_len = 0;
        self.phase = ReadPhase::Prelude;
    }

    /// Parse one assembled frame and run its per-type side effects and
    /// handler upcall. Returns `false` when the packet requires the channel
    /// to close.
    fn dispatch(&mut self, now: u64, frame: Vec<u8>, handler: &mut dyn MessageHandler) -> bool {
        self.last_received_time = self.last_received_time.max(now);

        let packet = match Packet::decode(frame) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(channel = %self.describe(), %err, "failed to parse inbound packet");
                return !self.close_called;
            }
        };
        debug!(
            channel = %self.describe(),
            packet = ?packet.packet_type(),
            "received"
        );
        self.stats.message_received(packet.is_duplicate());

        match packet {
            Packet::Connect(connect) => {
                self.ping_interval_ms = u64::from(connect.keep_alive_secs) * 1000;
                let result = handler.connect(self, connect);
                self.absorb("connect", result.err());
                true
            }
            Packet::ConnAck(ack) => {
                let accepted = ack.return_code == ConnectReturnCode::Accepted;
                if let Some(completion) = self.conn_ack_received.take() {
                    completion.succeed(Packet::ConnAck(ack.clone()));
                }
                if accepted && !self.connected {
                    self.connected = true;
                    self.role.connected(self.ping_interval_ms);
                }
                let result = handler.conn_ack(self, ack);
                self.absorb("conn_ack", result.err());
                accepted
            }
            Packet::Publish(publish) => {
                let result = handler.publish(self, publish);
                self.absorb("publish", result.err());
                true
            }
            Packet::PubAck(ack) => {
                self.ack_received(now, Packet::PubAck(ack.clone()));
                let result = handler.pub_ack(self, ack);
                self.absorb("pub_ack", result.err());
                true
            }
            Packet::PubRec(ack) => {
                self.ack_received(now, Packet::PubRec(ack.clone()));
                let result = handler.pub_rec(self, ack);
                self.absorb("pub_rec", result.err());
                true
            }
            Packet::PubRel(rel) => {
                let result = handler.pub_rel(self, rel);
                self.absorb("pub_rel", result.err());
                true
            }
            Packet::PubComp(ack) => {
                self.ack_received(now, Packet::PubComp(ack.clone()));
                let result = handler.pub_comp(self, ack);
                self.absorb("pub_comp", result.err());
                true
            }
            Packet::Subscribe(subscribe) => {
                let result = handler.subscribe(self, subscribe);
                self.absorb("subscribe", result.err());
                true
            }
            Packet::SubAck(ack) => {
                self.ack_received(now, Packet::SubAck(ack.clone()));
                let result = handler.sub_ack(self, ack);
                self.absorb("sub_ack", result.err());
                true
            }
            Packet::Unsubscribe(unsubscribe) => {
                let result = handler.unsubscribe(self, unsubscribe);
                self.absorb("unsubscribe", result.err());
                true
            }
            Packet::UnsubAck(ack) => {
                self.ack_received(now, Packet::UnsubAck(ack.clone()));
                let result = handler.unsub_ack(self, ack);
                self.absorb("unsub_ack", result.err());
                true
            }
            Packet::PingReq(_) => {
                if self.role.on_ping_req(now) == PingReply::SendPingResp {
                    self.submit(Outbound::new(PingResp::new().into(), None));
                }
                true
            }
            Packet::PingResp(_) => {
                self.role.on_ping_resp(now);
                true
            }
            Packet::Disconnect(disconnect) => {
                let result = handler.disconnect(self, disconnect);
                self.absorb("disconnect", result.err());
                false
            }
        }
    }

    /// An acknowledgement arrived: retire the in-flight entry it names and
    /// resolve its completion with the ack as the result. Unknown ids are
    /// ignored.
    fn ack_received(&mut self, now: u64, ack: Packet) {
        let Some(id) = ack.message_id() else { return };
        if let Some(acked) = self.in_flight.remove(&id) {
            if matches!(acked.packet, Packet::Publish(_)) {
                self.stats
                    .message_acked(now.saturating_sub(acked.original_send_time));
            }
            if let Some(completion) = acked.completion {
                completion.succeed(ack);
            }
        }
    }

    /// Resend overdue ackables and run keep-alive. Returns the delay in
    /// milliseconds until this channel next needs attention, `u64::MAX` when
    /// nothing is scheduled.
    pub fn housekeep(&mut self, now: u64, handler: &mut dyn MessageHandler) -> u64 {
        if self.close_called {
            return u64::MAX;
        }
        let mut next_deadline = u64::MAX;

        if self.resend_interval_ms > 0 {
            let horizon = now + RESEND_BATCH_WINDOW_MS;
            let due: Vec<u16> = self
                .in_flight
                .iter()
                .filter(|(_, outbound)| outbound.next_send_time <= horizon)
                .map(|(id, _)| *id)
                .collect();
            for id in due {
                if let Some(mut outbound) = self.in_flight.remove(&id) {
                    outbound.packet.set_duplicate();
                    self.resend_staging.push(outbound);
                }
            }
            for outbound in self.in_flight.values() {
                next_deadline = next_deadline.min(outbound.next_send_time - now);
            }
            if !self.resend_staging.is_empty() {
                debug!(
                    channel = %self.describe(),
                    count = self.resend_staging.len(),
                    "resending unacknowledged messages"
                );
                for outbound in std::mem::take(&mut self.resend_staging) {
                    self.submit(outbound);
                }
            }
        }

        match self
            .role
            .keep_alive(now, self.last_received_time, self.last_sent_time)
        {
            KeepAlive::Disabled => {}
            KeepAlive::Wait { next_in } => next_deadline = next_deadline.min(next_in),
            KeepAlive::SendPing { next_in } => {
                self.submit(Outbound::new(PingReq::new().into(), None));
                next_deadline = next_deadline.min(next_in);
            }
            KeepAlive::CloseIdle => {
                debug!(channel = %self.describe(), "closing idle channel");
                self.close(None, handler);
                return u64::MAX;
            }
        }

        next_deadline
    }

    /// Close the channel. Runs at most once; with a cause every pending
    /// completion fails with it, without one they are cancelled. The
    /// `channel_closed` upcall fires exactly once.
    pub fn close(&mut self, cause: Option<ChannelError>, handler: &mut dyn MessageHandler) {
        if let Some(cause) = &cause {
            self.fail_pending(cause);
        }
        if self.close_called {
            return;
        }
        self.close_called = true;
        debug!(channel = %self.describe(), cause = ?cause, "closing");
        if cause.is_none() {
            self.cancel_pending();
        }
        if self.connected {
            self.role.disconnected();
        }
        self.connected = false;
        if self.polled_interest.take().is_some() {
            let _ = self.registry.deregister(&mut self.stream);
        }
        self.attached = false;
        let _ = self.stream.shutdown(Shutdown::Both);
        let result = handler.channel_closed(self, cause.as_ref());
        self.absorb("channel_closed", result.err());
    }

    /// Detach from the selector without closing the socket, for registration
    /// transfer to another loop.
    pub fn deregister(&mut self, handler: &mut dyn MessageHandler) {
        if self.polled_interest.take().is_some() {
            let _ = self.registry.deregister(&mut self.stream);
        }
        self.attached = false;
        debug!(channel = %self.describe(), "deregistered");
        let result = handler.channel_detached(self);
        self.absorb("channel_detached", result.err());
    }

    /// Attach to a new selector after [`Channel::deregister`]. Attaching an
    /// already-attached channel is a usage error.
    pub fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        handler: &mut dyn MessageHandler,
    ) -> Result<(), ChannelError> {
        if self.attached {
            return Err(ChannelError::AlreadyRegistered);
        }
        if self.close_called {
            return Err(ChannelError::Closed);
        }
        self.registry = registry.try_clone().map_err(ChannelError::from)?;
        self.token = token;
        self.read_paused = false;
        let interest = if self.in_progress.is_some() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if let Err(err) = self.registry.register(&mut self.stream, token, interest) {
            let cause = ChannelError::from(err);
            self.close(Some(cause.clone()), handler);
            return Err(cause);
        }
        self.attached = true;
        self.polled_interest = Some(interest);
        debug!(channel = %self.describe(), "registered with new selector");
        let result = handler.channel_attached(self);
        self.absorb("channel_attached", result.err());
        Ok(())
    }

    /// Cancel every pending completion without closing the channel.
    pub fn cancel_pending(&self) {
        for completion in self.pending_completions() {
            completion.cancel();
        }
    }

    fn fail_pending(&self, cause: &ChannelError) {
        for completion in self.pending_completions() {
            completion.fail(cause.clone());
        }
    }

    fn pending_completions(&self) -> impl Iterator<Item = &Completion> {
        self.connection_complete
            .iter()
            .chain(self.conn_ack_received.iter())
            .chain(self.in_progress.iter().filter_map(|o| o.completion.as_ref()))
            .chain(self.write_queue.iter().filter_map(|o| o.completion.as_ref()))
            .chain(
                self.resend_staging
                    .iter()
                    .filter_map(|o| o.completion.as_ref()),
            )
            .chain(self.in_flight.values().filter_map(|o| o.completion.as_ref()))
    }

    fn desired_interest(&self) -> Option<Interest> {
        if self.close_called {
            return None;
        }
        if self.connect_pending {
            return Some(Interest::WRITABLE);
        }
        let mut interest = (!self.read_paused).then_some(Interest::READABLE);
        if self.in_progress.is_some() {
            interest = Some(match interest {
                Some(interest) => interest | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        interest
    }

    /// Reconcile the poll's interest set with the channel state: write
    /// interest iff a send is in progress, read interest iff reads are not
    /// paused, nothing once closed.
    fn update_interest(&mut self) {
        if !self.attached || self.close_called {
            return;
        }
        let desired = self.desired_interest();
        if desired == self.polled_interest {
            return;
        }
        let result = match (self.polled_interest, desired) {
            (Some(_), Some(interest)) => {
                self.registry
                    .reregister(&mut self.stream, self.token, interest)
            }
            (None, Some(interest)) => {
                self.registry.register(&mut self.stream, self.token, interest)
            }
            (Some(_), None) => self.registry.deregister(&mut self.stream),
            (None, None) => Ok(()),
        };
        match result {
            Ok(()) => self.polled_interest = desired,
            Err(err) => {
                warn!(channel = %self.describe(), %err, "failed to update poll interest");
                let _ = self
                    .deferred_error
                    .get_or_insert_with(|| ChannelError::from(err));
            }
        }
    }

    fn absorb(&self, upcall: &str, err: Option<anyhow::Error>) {
        if let Some(err) = err {
            error!(channel = %self.describe(), upcall, %err, "message handler failed");
        }
    }

    #[cfg(test)]
    fn polled_interest(&self) -> Option<Interest> {
        self.polled_interest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        ConnAck, Connect, Disconnect, PubAck, Publish, QoS, SubAck, Subscribe,
    };
    use bytes::Bytes;
    use mio::{Events, Poll};
    use std::net::TcpListener;
    use std::time::Duration;

    /// Handler that records every upcall for assertions.
    #[derive(Default)]
    struct Recording {
        opened: usize,
        closed: Vec<Option<ChannelError>>,
        sent: Vec<crate::protocol::PacketType>,
        connects: Vec<Connect>,
        conn_acks: Vec<ConnAck>,
        publishes: Vec<Publish>,
        pub_acks: Vec<PubAck>,
        subscribes: Vec<Subscribe>,
        disconnects: usize,
    }

    impl MessageHandler for Recording {
        fn channel_opened(&mut self, _channel: &mut Channel) -> anyhow::Result<()> {
            self.opened += 1;
            Ok(())
        }

        fn channel_closed(
            &mut self,
            _channel: &mut Channel,
            cause: Option<&ChannelError>,
        ) -> anyhow::Result<()> {
            self.closed.push(cause.cloned());
            Ok(())
        }

        fn message_sent(&mut self, _channel: &mut Channel, packet: &Packet) -> anyhow::Result<()> {
            self.sent.push(packet.packet_type());
            Ok(())
        }

        fn connect(&mut self, _channel: &mut Channel, packet: Connect) -> anyhow::Result<()> {
            self.connects.push(packet);
            Ok(())
        }

        fn conn_ack(&mut self, _channel: &mut Channel, packet: ConnAck) -> anyhow::Result<()> {
            self.conn_acks.push(packet);
            Ok(())
        }

        fn publish(&mut self, _channel: &mut Channel, packet: Publish) -> anyhow::Result<()> {
            self.publishes.push(packet);
            Ok(())
        }

        fn pub_ack(&mut self, _channel: &mut Channel, packet: PubAck) -> anyhow::Result<()> {
            self.pub_acks.push(packet);
            Ok(())
        }

        fn subscribe(&mut self, _channel: &mut Channel, packet: Subscribe) -> anyhow::Result<()> {
            self.subscribes.push(packet);
            Ok(())
        }

        fn disconnect(
            &mut self,
            _channel: &mut Channel,
            _packet: Disconnect,
        ) -> anyhow::Result<()> {
            self.disconnects += 1;
            Ok(())
        }
    }

    struct Fixture {
        _poll: Poll,
        channel: Channel,
        peer: std::net::TcpStream,
        handler: Recording,
    }

    fn fixture_with(role: Box<dyn ChannelRole>, resend_interval_ms: u64) -> Fixture {
        let poll = Poll::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let local = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (peer, _) = listener.accept().unwrap();
        local.set_nonblocking(true).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let mut handler = Recording::default();
        let channel = Channel::accepted(
            TcpStream::from_std(local),
            role,
            poll.registry(),
            Token(7),
            resend_interval_ms,
            Arc::new(MessageStats::new()),
            &mut handler,
        )
        .unwrap();

        Fixture {
            _poll: poll,
            channel,
            peer,
            handler,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Box::new(BrokerRole::new()), 0)
    }

    /// Drive `read` until the predicate holds, retrying while the kernel
    /// delivers the peer's bytes.
    fn read_until(fx: &mut Fixture, now: u64, pred: impl Fn(&Recording) -> bool) {
        for _ in 0..500 {
            if pred(&fx.handler) {
                return;
            }
            fx.channel.read(now, &mut fx.handler);
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("peer bytes never arrived");
    }

    fn drain_writes(fx: &mut Fixture, now: u64) {
        for _ in 0..500 {
            fx.channel.write(now, &mut fx.handler);
            if fx.channel.send_queue_depth() == 0 || !fx.channel.is_open() {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("send queue never drained");
    }

    fn peer_read_exact(fx: &mut Fixture, len: usize) -> Vec<u8> {
        use std::io::Read as _;
        let mut buf = vec![0u8; len];
        fx.peer.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn frames_packets_across_arbitrary_chunks() {
        let mut fx = fixture();
        assert_eq!(fx.handler.opened, 1);

        let mut stream = Vec::new();
        stream.extend_from_slice(
            Packet::from(Connect::new("clientId", true, 300, None, None, None).unwrap()).bytes(),
        );
        stream.extend_from_slice(
            Packet::from(
                Publish::new(
                    "grand/foo/bar",
                    QoS::AtLeastOnce,
                    Some(3),
                    Bytes::from_static(b"onyx"),
                    false,
                )
                .unwrap(),
            )
            .bytes(),
        );
        stream.extend_from_slice(Packet::from(Subscribe::new(4, &[("a", QoS::AtMostOnce)]).unwrap()).bytes());

        // feed one byte at a time so every framing transition is exercised
        for chunk in stream.chunks(1) {
            fx.peer.write_all(chunk).unwrap();
            fx.channel.read(10, &mut fx.handler);
        }
        read_until(&mut fx, 10, |h| {
            h.connects.len() == 1 && h.publishes.len() == 1 && h.subscribes.len() == 1
        });

        assert_eq!(fx.handler.connects[0].client_id, "clientId");
        assert_eq!(fx.handler.publishes[0].topic, "grand/foo/bar");
        assert_eq!(&fx.handler.publishes[0].payload[..], b"onyx");
        assert_eq!(fx.handler.subscribes[0].message_id, 4);
        assert!(fx.channel.is_open());
    }

    #[test]
    fn frames_multibyte_remaining_length() {
        let mut fx = fixture();
        let payload = vec![0x55u8; 300];
        let publish = Publish::new(
            "t",
            QoS::AtLeastOnce,
            Some(9),
            Bytes::from(payload.clone()),
            false,
        )
        .unwrap();
        fx.peer.write_all(Packet::from(publish).bytes()).unwrap();

        read_until(&mut fx, 5, |h| h.publishes.len() == 1);
        assert_eq!(&fx.handler.publishes[0].payload[..], &payload[..]);
    }

    #[test]
    fn peer_eof_closes_without_cause() {
        let mut fx = fixture();
        drop(fx.peer);

        for _ in 0..500 {
            if !fx.channel.read(1, &mut fx.handler) {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!fx.channel.is_open());
        assert_eq!(fx.handler.closed, vec![None]);
        // subsequent entry points report closed
        assert!(!fx.channel.read(2, &mut fx.handler));
        assert!(!fx.channel.write(2, &mut fx.handler));
        assert_eq!(fx.handler.closed.len(), 1);
    }

    #[test]
    fn parse_failure_keeps_channel_open() {
        let mut fx = fixture();
        // reserved type 0 parses as an error but the frame is consumed
        fx.peer.write_all(&[0x00, 0x00]).unwrap();
        fx.peer
            .write_all(Packet::from(PubAck::new(1)).bytes())
            .unwrap();

        read_until(&mut fx, 3, |h| h.pub_acks.len() == 1);
        assert!(fx.channel.is_open());
    }

    #[test]
    fn send_drains_and_completes_non_ackable() {
        let mut fx = fixture();
        let completion = Completion::new();
        let packet = Packet::from(SubAck::new(5, vec![QoS::AtLeastOnce]).unwrap());
        let expected = packet.bytes().to_vec();
        assert!(fx.channel.send(packet, Some(completion.clone())));
        assert!(fx.channel.polled_interest().unwrap().is_writable());

        drain_writes(&mut fx, 100);
        assert_eq!(peer_read_exact(&mut fx, expected.len()), expected);
        assert!(completion.wait(Duration::from_secs(1)).unwrap().is_none());
        assert_eq!(fx.handler.sent, vec![crate::protocol::PacketType::SubAck]);
        // write interest disarmed once the slot is empty
        assert!(!fx.channel.polled_interest().unwrap().is_writable());
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut fx = fixture();
        for id in 1..=3u16 {
            fx.channel.send(Packet::from(PubAck::new(id)), None);
        }
        drain_writes(&mut fx, 100);

        let bytes = peer_read_exact(&mut fx, 12);
        assert_eq!(bytes[3], 1);
        assert_eq!(bytes[7], 2);
        assert_eq!(bytes[11], 3);
    }

    #[test]
    fn ackable_completion_resolves_on_ack() {
        let mut fx = fixture();
        let completion = Completion::new();
        let publish = Publish::new(
            "t",
            QoS::AtLeastOnce,
            Some(21),
            Bytes::from_static(b"x"),
            false,
        )
        .unwrap();
        fx.channel
            .send(Packet::from(publish), Some(completion.clone()));
        drain_writes(&mut fx, 1_000);

        assert_eq!(fx.channel.in_flight_count(), 1);
        assert!(!completion.is_resolved());

        fx.peer
            .write_all(Packet::from(PubAck::new(21)).bytes())
            .unwrap();
        read_until(&mut fx, 1_250, |h| h.pub_acks.len() == 1);

        assert_eq!(fx.channel.in_flight_count(), 0);
        let result = completion.wait(Duration::from_secs(1)).unwrap().unwrap();
        assert!(matches!(result, Packet::PubAck(ref a) if a.message_id == 21));

        let snapshot = fx.channel.stats.snapshot();
        assert_eq!(snapshot.acks_received, 1);
        assert_eq!(snapshot.max_ack_latency_ms, 250);
    }

    #[test]
    fn unknown_ack_id_is_ignored() {
        let mut fx = fixture();
        fx.peer
            .write_all(Packet::from(PubAck::new(99)).bytes())
            .unwrap();
        read_until(&mut fx, 1, |h| h.pub_acks.len() == 1);
        assert!(fx.channel.is_open());
        assert_eq!(fx.channel.in_flight_count(), 0);
    }

    #[test]
    fn resend_sets_duplicate_and_keeps_original_send_time() {
        let mut fx = fixture_with(Box::new(BrokerRole::new()), 5_000);
        let completion = Completion::new();
        let publish = Publish::new(
            "t",
            QoS::AtLeastOnce,
            Some(8),
            Bytes::from_static(b"p"),
            false,
        )
        .unwrap();
        let original = Packet::from(publish);
        let frame_len = original.bytes().len();
        fx.channel.send(original, Some(completion.clone()));
        drain_writes(&mut fx, 1_000);
        let first = peer_read_exact(&mut fx, frame_len);
        assert_eq!(first[0], 0x32);

        // not yet due: deadline points at the remaining wait
        let deadline = fx.channel.housekeep(2_000, &mut fx.handler);
        assert_eq!(deadline, 4_000);
        assert_eq!(fx.channel.in_flight_count(), 1);

        // due (within the batch window): staged, flagged and resubmitted
        fx.channel.housekeep(6_000, &mut fx.handler);
        drain_writes(&mut fx, 6_000);
        let second = peer_read_exact(&mut fx, frame_len);
        assert_eq!(second[0], 0x3A, "resend carries the duplicate flag");
        assert_eq!(&second[1..], &first[1..]);
        assert!(!completion.is_resolved());

        let snapshot = fx.channel.stats.snapshot();
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.duplicates_sent, 1);

        // ack after the resend still records latency from the first send
        fx.peer
            .write_all(Packet::from(PubAck::new(8)).bytes())
            .unwrap();
        read_until(&mut fx, 7_000, |h| h.pub_acks.len() == 1);
        assert!(completion.is_resolved());
        assert_eq!(fx.channel.stats.snapshot().max_ack_latency_ms, 6_000);
    }

    #[test]
    fn close_with_cause_fails_all_pending_completions() {
        let mut fx = fixture_with(Box::new(BrokerRole::new()), 5_000);
        let queued = Completion::new();
        let in_flight = Completion::new();

        let first = Publish::new("t", QoS::AtLeastOnce, Some(1), Bytes::new(), false).unwrap();
        fx.channel
            .send(Packet::from(first), Some(in_flight.clone()));
        drain_writes(&mut fx, 10);
        assert_eq!(fx.channel.in_flight_count(), 1);

        let second = Publish::new("t", QoS::AtLeastOnce, Some(2), Bytes::new(), false).unwrap();
        fx.channel.send(Packet::from(second), Some(queued.clone()));

        let cause = ChannelError::Io {
            kind: io::ErrorKind::ConnectionReset,
            message: "reset".to_string(),
        };
        fx.channel.close(Some(cause.clone()), &mut fx.handler);

        assert_eq!(
            in_flight.wait(Duration::from_millis(10)).unwrap_err(),
            CompletionError::Failed(cause.clone())
        );
        assert_eq!(
            queued.wait(Duration::from_millis(10)).unwrap_err(),
            CompletionError::Failed(cause.clone())
        );
        assert_eq!(fx.handler.closed, vec![Some(cause)]);
        assert!(!fx.channel.is_open());

        // close is idempotent
        fx.channel.close(None, &mut fx.handler);
        assert_eq!(fx.handler.closed.len(), 1);
    }

    #[test]
    fn clean_close_cancels_pending_completions() {
        let mut fx = fixture();
        let pending = Completion::new();
        let publish = Publish::new("t", QoS::AtLeastOnce, Some(3), Bytes::new(), false).unwrap();
        fx.channel.send(Packet::from(publish), Some(pending.clone()));

        fx.channel.close(None, &mut fx.handler);
        assert_eq!(
            pending.wait(Duration::from_millis(10)).unwrap_err(),
            CompletionError::Cancelled
        );
    }

    #[test]
    fn send_after_close_fails_completion() {
        let mut fx = fixture();
        fx.channel.close(None, &mut fx.handler);

        let completion = Completion::new();
        assert!(!fx
            .channel
            .send(Packet::from(PubAck::new(1)), Some(completion.clone())));
        assert_eq!(
            completion.wait(Duration::from_millis(10)).unwrap_err(),
            CompletionError::Failed(ChannelError::Closed)
        );
    }

    #[test]
    fn client_conn_ack_resolves_command_and_connects() {
        let mut fx = fixture_with(Box::new(ClientRole::new()), 0);
        let conn_ack = Completion::new();
        let connect = Connect::new("c", true, 20, None, None, None).unwrap();
        fx.channel
            .send(Packet::from(connect), Some(conn_ack.clone()));
        drain_writes(&mut fx, 50);
        assert!(!fx.channel.is_connected());

        fx.peer
            .write_all(Packet::from(ConnAck::new(ConnectReturnCode::Accepted)).bytes())
            .unwrap();
        read_until(&mut fx, 60, |h| h.conn_acks.len() == 1);

        assert!(fx.channel.is_connected());
        let result = conn_ack.wait(Duration::from_secs(1)).unwrap().unwrap();
        assert!(
            matches!(result, Packet::ConnAck(ref a) if a.return_code == ConnectReturnCode::Accepted)
        );
    }

    #[test]
    fn rejected_conn_ack_resolves_command_then_closes() {
        let mut fx = fixture_with(Box::new(ClientRole::new()), 0);
        let conn_ack = Completion::new();
        let connect = Connect::new("c", true, 20, None, None, None).unwrap();
        fx.channel
            .send(Packet::from(connect), Some(conn_ack.clone()));
        drain_writes(&mut fx, 50);

        fx.peer
            .write_all(Packet::from(ConnAck::new(ConnectReturnCode::NotAuthorized)).bytes())
            .unwrap();
        for _ in 0..500 {
            if !fx.channel.read(60, &mut fx.handler) {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        assert!(!fx.channel.is_open());
        assert!(!fx.channel.is_connected());
        let result = conn_ack.wait(Duration::from_secs(1)).unwrap().unwrap();
        assert!(
            matches!(result, Packet::ConnAck(ref a) if a.return_code == ConnectReturnCode::NotAuthorized)
        );
        assert_eq!(fx.handler.conn_acks.len(), 1);
    }

    #[test]
    fn client_keep_alive_sends_ping_after_silence() {
        let mut fx = fixture_with(Box::new(ClientRole::new()), 0);
        let connect = Connect::new("c", true, 20, None, None, None).unwrap();
        fx.channel.send(Packet::from(connect), None);
        drain_writes(&mut fx, 1_000);
        let _connect_bytes = peer_read_exact(&mut fx, 17);

        fx.peer
            .write_all(Packet::from(ConnAck::new(ConnectReturnCode::Accepted)).bytes())
            .unwrap();
        read_until(&mut fx, 1_100, |h| h.conn_acks.len() == 1);

        // interval is 20s; nothing due shortly after the connack
        let deadline = fx.channel.housekeep(2_000, &mut fx.handler);
        assert!(deadline <= 20_000);
        assert_eq!(fx.channel.send_queue_depth(), 0);

        // a full interval of outbound silence triggers a ping
        fx.channel.housekeep(21_100, &mut fx.handler);
        drain_writes(&mut fx, 21_100);
        assert_eq!(peer_read_exact(&mut fx, 2), [0xC0, 0x00]);
    }

    #[test]
    fn broker_answers_ping_req() {
        let mut fx = fixture();
        fx.peer.write_all(&[0xC0, 0x00]).unwrap();
        for _ in 0..500 {
            fx.channel.read(5, &mut fx.handler);
            fx.channel.write(5, &mut fx.handler);
            if fx.channel.send_queue_depth() == 0 && fx.channel.stats.snapshot().messages_sent == 1
            {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(peer_read_exact(&mut fx, 2), [0xD0, 0x00]);
    }

    #[test]
    fn idle_broker_channel_closes_after_grace() {
        let mut fx = fixture();
        // negotiate a 10s keep-alive: connect received, connack accepted sent
        fx.peer
            .write_all(Packet::from(Connect::new("c", true, 10, None, None, None).unwrap()).bytes())
            .unwrap();
        read_until(&mut fx, 1_000, |h| h.connects.len() == 1);
        fx.channel
            .send(Packet::from(ConnAck::new(ConnectReturnCode::Accepted)), None);
        drain_writes(&mut fx, 1_000);
        assert!(fx.channel.is_connected());

        // within the 1.5x grace window the channel stays up
        let deadline = fx.channel.housekeep(10_000, &mut fx.handler);
        assert_eq!(deadline, 6_000);
        assert!(fx.channel.is_open());

        fx.channel.housekeep(16_001, &mut fx.handler);
        assert!(!fx.channel.is_open());
        assert_eq!(fx.handler.closed, vec![None]);
    }

    #[test]
    fn paused_reads_leave_bytes_in_kernel() {
        let mut fx = fixture();
        fx.channel.pause_read();
        fx.peer
            .write_all(Packet::from(PubAck::new(4)).bytes())
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert!(fx.channel.read(1, &mut fx.handler));
        assert!(fx.handler.pub_acks.is_empty());

        fx.channel.resume_read();
        read_until(&mut fx, 2, |h| h.pub_acks.len() == 1);
    }

    #[test]
    fn disconnect_from_peer_closes_after_upcall() {
        let mut fx = fixture();
        fx.peer.write_all(&[0xE0, 0x00]).unwrap();
        for _ in 0..500 {
            if !fx.channel.read(5, &mut fx.handler) {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(fx.handler.disconnects, 1);
        assert!(!fx.channel.is_open());
        assert_eq!(fx.handler.closed, vec![None]);
    }

    #[test]
    fn sending_disconnect_closes_after_drain() {
        let mut fx = fixture();
        let completion = Completion::new();
        fx.channel
            .send(Packet::from(Disconnect::new()), Some(completion.clone()));
        for _ in 0..500 {
            if !fx.channel.write(5, &mut fx.handler) {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!fx.channel.is_open());
        assert!(completion.wait(Duration::from_secs(1)).unwrap().is_none());
        assert_eq!(peer_read_exact(&mut fx, 2), [0xE0, 0x00]);
    }

    #[test]
    fn register_transfer_rejects_double_attach() {
        let mut fx = fixture();
        let other = Poll::new().unwrap();
        assert_eq!(
            fx.channel
                .register(other.registry(), Token(9), &mut fx.handler)
                .unwrap_err(),
            ChannelError::AlreadyRegistered
        );

        fx.channel.deregister(&mut fx.handler);
        fx.channel
            .register(other.registry(), Token(9), &mut fx.handler)
            .unwrap();
        assert_eq!(fx.channel.token(), Token(9));
        assert!(fx.channel.is_open());
    }

    #[test]
    fn outgoing_connect_failure_fails_connection_complete() {
        // a port with nothing listening: bind then drop to reserve-and-free
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let mut poll = Poll::new().unwrap();
        let mut handler = Recording::default();
        let connection_complete = Completion::new();
        let channel = Channel::connecting(
            addr,
            Box::new(ClientRole::new()),
            poll.registry(),
            Token(1),
            0,
            Some(connection_complete.clone()),
            Arc::new(MessageStats::new()),
            &mut handler,
        );
        let Ok(mut channel) = channel else {
            // synchronous refusal also fails the completion
            assert!(connection_complete.wait(Duration::from_secs(1)).is_err());
            return;
        };

        let mut events = Events::with_capacity(8);
        for _ in 0..100 {
            poll.poll(&mut events, Some(Duration::from_millis(50))).unwrap();
            let mut resolved = false;
            for event in events.iter() {
                if event.token() == Token(1) {
                    resolved = !channel.finish_connect(&mut handler) || channel.is_connected();
                }
            }
            if resolved || !channel.is_open() {
                break;
            }
        }

        assert!(!channel.is_open());
        assert!(matches!(
            connection_complete
                .wait(Duration::from_secs(1))
                .unwrap_err(),
            CompletionError::Failed(ChannelError::ConnectFailed(_))
        ));
        assert_eq!(handler.closed.len(), 1);
        assert!(matches!(
            handler.closed[0],
            Some(ChannelError::ConnectFailed(_))
        ));
    }
}
