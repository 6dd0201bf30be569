//! CLI commands for the trading engine.

pub mod check_config;
pub mod run;

pub use check_config::{run_check_config, CheckConfigArgs};
pub use run::{run_session, RunArgs};
