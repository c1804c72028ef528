//! Command-line and environment configuration for both roles.
//!
//! Every option can be given as a flag or through the environment variable
//! named next to it.  Values are checked once by `validate` before anything
//! is started.

use std::path::PathBuf;

use clap::Args;
use log::LevelFilter;
use thiserror::Error;

use crate::ledger::DEFAULT_WINNING_NUMBER;
use crate::packer::{BatchLimits, PackError, DEFAULT_MAX_BYTES, DEFAULT_MAX_COUNT};

pub const DEFAULT_SERVER_ADDRESS: &str = "0.0.0.0:12345";
pub const DEFAULT_AGENCIES: usize = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("agencies must be at least 1")]
    NoAgencies,
    #[error("agency id must not be 0")]
    ZeroAgencyId,
    #[error(transparent)]
    Limits(#[from] PackError),
}

/// Logging configuration shared by both roles.
#[derive(Debug, Args, Clone)]
pub struct LogArgs {
    /// Default log level; `RUST_LOG` takes precedence when set.
    #[arg(long, env = "LOGGING_LEVEL", default_value = "info", global = true)]
    pub log_level: LevelFilter,
}

/// Arguments for the `server` command.
#[derive(Debug, Args, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    #[arg(long, env = "SERVER_ADDRESS", default_value = DEFAULT_SERVER_ADDRESS)]
    pub bind: String,

    /// Number of agencies the draw waits for.
    #[arg(long, env = "AGENCIES", default_value_t = DEFAULT_AGENCIES)]
    pub agencies: usize,

    /// Number that wins the draw.
    #[arg(long, env = "WINNING_NUMBER", default_value_t = DEFAULT_WINNING_NUMBER)]
    pub winning_number: u32,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agencies == 0 {
            return Err(ConfigError::NoAgencies);
        }
        Ok(())
    }
}

/// Arguments for the `client` command.
#[derive(Debug, Args, Clone)]
pub struct ClientConfig {
    /// Agency id stamped on every wager.
    #[arg(long, env = "CLI_ID")]
    pub id: u32,

    /// Server address to connect to.
    #[arg(long, env = "SERVER_ADDRESS")]
    pub server: String,

    /// Maximum wagers per batch.
    #[arg(long, env = "BATCH_MAX_AMOUNT", default_value_t = DEFAULT_MAX_COUNT)]
    pub batch_max_amount: usize,

    /// Maximum size of one batch frame, in bytes.
    #[arg(long, env = "BATCH_MAX_BYTES", default_value_t = DEFAULT_MAX_BYTES)]
    pub batch_max_bytes: usize,

    /// CSV file with this agency's wagers.
    #[arg(long, env = "BETS_FILE", default_value = "./agency.csv")]
    pub bets: PathBuf,
}

impl ClientConfig {
    pub fn limits(&self) -> Result<BatchLimits, PackError> {
        BatchLimits::new(self.batch_max_amount, self.batch_max_bytes)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id == 0 {
            return Err(ConfigError::ZeroAgencyId);
        }
        self.limits()?;
        Ok(())
    }
}
