//! Upcalls a channel makes into its owning collaborator.
//!
//! The loop that drives a set of channels owns the handler and passes it into
//! every channel entry point; the channel never stores it. Upcalls run on the
//! selector thread and must not block. Errors returned from a handler are
//! logged and absorbed by the channel; they close the channel only if the
//! socket is already unhealthy.

use anyhow::Result;

use crate::protocol::{
    ConnAck, Connect, Disconnect, Packet, PubAck, PubComp, PubRec, PubRel, Publish, SubAck,
    Subscribe, UnsubAck, Unsubscribe,
};

use super::{Channel, ChannelError};

/// Receiver of channel lifecycle events and parsed packets. All methods
/// default to no-ops so implementations override only what they consume.
#[allow(unused_variables)]
pub trait MessageHandler {
    /// The channel finished opening: an outgoing connect completed or an
    /// accepted socket was wrapped.
    fn channel_opened(&mut self, channel: &mut Channel) -> Result<()> {
        Ok(())
    }

    /// The channel was attached to a selector via registration transfer.
    fn channel_attached(&mut self, channel: &mut Channel) -> Result<()> {
        Ok(())
    }

    /// The channel was detached from its selector without closing.
    fn channel_detached(&mut self, channel: &mut Channel) -> Result<()> {
        Ok(())
    }

    /// The channel closed. Fires exactly once per channel; `cause` is `None`
    /// for a clean close or peer EOF.
    fn channel_closed(&mut self, channel: &mut Channel, cause: Option<&ChannelError>) -> Result<()> {
        Ok(())
    }

    /// A packet fully drained to the socket.
    fn message_sent(&mut self, channel: &mut Channel, packet: &Packet) -> Result<()> {
        Ok(())
    }

    fn connect(&mut self, channel: &mut Channel, packet: Connect) -> Result<()> {
        Ok(())
    }

    fn conn_ack(&mut self, channel: &mut Channel, packet: ConnAck) -> Result<()> {
        Ok(())
    }

    fn publish(&mut self, channel: &mut Channel, packet: Publish) -> Result<()> {
        Ok(())
    }

    fn pub_ack(&mut self, channel: &mut Channel, packet: PubAck) -> Result<()> {
        Ok(())
    }

    fn pub_rec(&mut self, channel: &mut Channel, packet: PubRec) -> Result<()> {
        Ok(())
    }

    fn pub_rel(&mut self, channel: &mut Channel, packet: PubRel) -> Result<()> {
        Ok(())
    }

    fn pub_comp(&mut self, channel: &mut Channel, packet: PubComp) -> Result<()> {
        Ok(())
    }

    fn subscribe(&mut self, channel: &mut Channel, packet: Subscribe) -> Result<()> {
        Ok(())
    }

    fn sub_ack(&mut self, channel: &mut Channel, packet: SubAck) -> Result<()> {
        Ok(())
    }

    fn unsubscribe(&mut self, channel: &mut Channel, packet: Unsubscribe) -> Result<()> {
        Ok(())
    }

    fn unsub_ack(&mut self, channel: &mut Channel, packet: UnsubAck) -> Result<()> {
        Ok(())
    }

    fn disconnect(&mut self, channel: &mut Channel, packet: Disconnect) -> Result<()> {
        Ok(())
    }
}
