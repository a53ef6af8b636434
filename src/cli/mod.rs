//! Command-line interface.

pub mod args;
pub mod commands;

pub use args::{Cli, Commands, MockBrokerArgs};
pub use commands::run_mock_broker;
