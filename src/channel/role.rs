//! Client/broker split of the shared channel engine.
//!
//! The two sides differ only in keep-alive behavior and in what the
//! connected/disconnected transitions mean, so the concrete channel injects
//! a [`ChannelRole`] rather than specializing the engine. Role methods
//! return instructions the engine interprets (send a ping, answer a ping,
//! close an idle connection); they never touch the socket themselves.

/// What the keep-alive subsystem wants done, and when to check back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAlive {
    /// No ping interval negotiated; never wake for keep-alive.
    Disabled,
    /// Nothing to do for another `next_in` milliseconds.
    Wait { next_in: u64 },
    /// Transmit a PingReq now, then check back in `next_in` milliseconds.
    SendPing { next_in: u64 },
    /// The peer has been silent too long; close the channel.
    CloseIdle,
}

/// Response to an inbound PingReq.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingReply {
    Ignore,
    SendPingResp,
}

/// Per-role behavior injected into the channel engine.
pub trait ChannelRole: Send {
    /// An accepted ConnAck was sent or received. Called at most once per
    /// channel lifetime, with the negotiated ping interval in milliseconds.
    fn connected(&mut self, ping_interval_ms: u64);

    /// The channel closed after having been connected. Called at most once
    /// and only after `connected`.
    fn disconnected(&mut self);

    /// Keep-alive evaluation during housekeeping. `last_received` and
    /// `last_sent` are the channel's activity timestamps in milliseconds.
    fn keep_alive(&mut self, now: u64, last_received: u64, last_sent: u64) -> KeepAlive;

    /// An inbound PingReq arrived.
    fn on_ping_req(&mut self, now: u64) -> PingReply;

    /// An inbound PingResp arrived.
    fn on_ping_resp(&mut self, now: u64);
}

/// The peer must hear from us every ping interval, and we expect traffic
/// from the broker within 1.5 intervals.
#[derive(Debug, Default)]
pub struct ClientRole {
    ping_interval_ms: u64,
}

impl ClientRole {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChannelRole for ClientRole {
    fn connected(&mut self, ping_interval_ms: u64) {
        self.ping_interval_ms = ping_interval_ms;
    }

    fn disconnected(&mut self) {
        self.ping_interval_ms = 0;
    }

    fn keep_alive(&mut self, now: u64, last_received: u64, last_sent: u64) -> KeepAlive {
        if self.ping_interval_ms == 0 {
            return KeepAlive::Disabled;
        }
        let idle_limit = self.ping_interval_ms + self.ping_interval_ms / 2;
        let since_received = now.saturating_sub(last_received);
        if since_received > idle_limit {
            return KeepAlive::CloseIdle;
        }
        let until_idle = idle_limit - since_received;
        let since_sent = now.saturating_sub(last_sent);
        if since_sent >= self.ping_interval_ms {
            return KeepAlive::SendPing {
                next_in: self.ping_interval_ms.min(until_idle),
            };
        }
        KeepAlive::Wait {
            next_in: (self.ping_interval_ms - since_sent).min(until_idle),
        }
    }

    fn on_ping_req(&mut self, _now: u64) -> PingReply {
        PingReply::SendPingResp
    }

    fn on_ping_resp(&mut self, _now: u64) {}
}

/// The broker never pings; it answers PingReq and drops clients that stay
/// silent past 1.5 negotiated intervals.
#[derive(Debug, Default)]
pub struct BrokerRole {
    ping_interval_ms: u64,
}

impl BrokerRole {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChannelRole for BrokerRole {
    fn connected(&mut self, ping_interval_ms: u64) {
        self.ping_interval_ms = ping_interval_ms;
    }

    fn disconnected(&mut self) {
        self.ping_interval_ms = 0;
    }

    fn keep_alive(&mut self, now: u64, last_received: u64, _last_sent: u64) -> KeepAlive {
        if self.ping_interval_ms == 0 {
            return KeepAlive::Disabled;
        }
        let idle_limit = self.ping_interval_ms + self.ping_interval_ms / 2;
        let since_received = now.saturating_sub(last_received);
        if since_received > idle_limit {
            return KeepAlive::CloseIdle;
        }
        KeepAlive::Wait {
            next_in: idle_limit - since_received,
        }
    }

    fn on_ping_req(&mut self, _now: u64) -> PingReply {
        PingReply::SendPingResp
    }

    fn on_ping_resp(&mut self, _now: u64) {}
}
