#![deny(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! Quill - unified CLI entrypoint.
//!
//! Usage:
//!   quill mock-broker -p 1883 -t 15 -a
//!   quill mock-broker -p 0 -u user1:pass1,user2:pass2

use anyhow::Result;
use clap::Parser;
use quill::cli::{run_mock_broker, Cli, Commands};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("QUILL_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::MockBroker(args) => run_mock_broker(args),
    }
}
