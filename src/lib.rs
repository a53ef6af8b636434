#![deny(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: some functions are inherently complex
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Variable naming: domain terms often similar
#![allow(clippy::similar_names)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Struct field patterns
#![allow(clippy::struct_excessive_bools)]
// Numeric casts: intentional in protocol code
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_lossless)]
// Control flow style
#![allow(clippy::if_not_else)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_match_else)]
#![allow(clippy::match_wildcard_for_single_variants)]
// Passing style
#![allow(clippy::needless_pass_by_value)]
// Option/Result patterns
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::map_unwrap_or)]
// Large types
#![allow(clippy::large_enum_variant)]
#![allow(clippy::result_large_err)]
// Iteration style
#![allow(clippy::explicit_iter_loop)]

//! Quill - MQTT 3.1 endpoint library.
//!
//! The core is a per-connection channel engine driving one non-blocking TCP
//! socket through a readiness-based selector: wire-format framing, QoS 1/2
//! acknowledgement bookkeeping, keep-alive, timer-driven resend, and
//! completion handles that couple sends to awaitable results.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::stats` - message counters and ack latency tracking
//! - `core::time` - millisecond time sourcing for the outer loops
//!
//! ## Protocol
//! - `protocol::codec` - field readers/writers and the remaining-length
//!   varint
//! - `protocol::packet` - the fourteen MQTT 3.1 control packets
//!
//! ## Channel
//! - `channel` - the per-connection engine, completion handles, the handler
//!   upcall contract, and the client/broker role split
//!
//! ## Collaborators
//! - `broker` - in-process mock broker and its selector loop
//! - `client` - blocking client façade
//! - `cli` - the `quill mock-broker` command surface

pub mod broker;
pub mod channel;
pub mod cli;
pub mod client;
pub mod core;
pub mod protocol;

// Re-exports for the common surfaces
pub use self::core::stats::{MessageStats, StatsSnapshot};
pub use broker::{BrokerConfig, BrokerHandle};
pub use channel::{
    BrokerRole, Channel, ChannelError, ChannelRole, ClientRole, Completion, CompletionError,
    KeepAlive, MessageHandler, PingReply,
};
pub use client::{BlockingClient, ClientError, ConnectOptions};
pub use protocol::{ConnectReturnCode, Packet, PacketType, ProtocolError, QoS};
