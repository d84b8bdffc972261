//! Error types for curfew.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CurfewError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Firewall error: {0}")]
    Firewall(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Invalid IPv4 address: {0}")]
    InvalidIp(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
