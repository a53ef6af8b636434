//! CLI command implementations.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::broker::{self, BrokerConfig};

use super::args::MockBrokerArgs;

/// Start the mock broker and block until it exits.
pub fn run_mock_broker(args: MockBrokerArgs) -> Result<()> {
    let credentials = match &args.credentials {
        Some(spec) => broker::parse_credentials(spec).context("invalid -u credential list")?,
        None => Default::default(),
    };
    let config = BrokerConfig {
        port: args.port,
        resend_interval: Duration::from_secs(args.resend_interval_secs),
        max_in_flight: args.max_in_flight,
        allow_anonymous: args.allow_anonymous,
        ignore_credentials: args.ignore_credentials,
        credentials,
    };

    let handle = broker::start(config).context("failed to start mock broker")?;
    handle.wait();
    Ok(())
}
