//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};

/// Quill - MQTT 3.1 endpoint toolkit.
#[derive(Parser)]
#[command(name = "quill")]
#[command(version)]
#[command(about = "MQTT 3.1 channel engine and mock broker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an in-process mock MQTT broker
    MockBroker(MockBrokerArgs),
}

#[derive(Args)]
pub struct MockBrokerArgs {
    /// TCP port to bind; 0 selects an ephemeral port
    #[arg(short = 'p', long = "port", default_value_t = 1883)]
    pub port: u16,

    /// Seconds between resends of unacknowledged messages; 0 disables resend
    #[arg(short = 't', long = "resend-interval", value_name = "SECONDS", default_value_t = 15)]
    pub resend_interval_secs: u64,

    /// Maximum in-flight acknowledgeable messages per client session
    #[arg(short = 'm', long = "max-in-flight", value_name = "COUNT", default_value_t = u16::MAX)]
    pub max_in_flight: u16,

    /// Accept connections that present no credentials
    #[arg(short = 'a', long = "allow-anonymous")]
    pub allow_anonymous: bool,

    /// Credential whitelist
    #[arg(short = 'u', long = "credentials", value_name = "USER:PASS[,USER:PASS...]")]
    pub credentials: Option<String>,

    /// Accept any client regardless of the credentials it sends
    #[arg(short = 'i', long = "ignore-credentials")]
    pub ignore_credentials: bool,
}
