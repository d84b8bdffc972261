//! Inbound command decoding and dispatch.
//!
//! Payloads arrive as JSON objects in one of two shapes:
//!
//! ```text
//! {"ip": "<IPv4 or 0.0.0.0>", "status": "block" | "unblock"}
//! {"command": "schedule_enable" | "schedule_disable"}
//! ```
//!
//! Anything else is dropped with a warning. The router holds no mutable
//! state of its own.

use bytes::Bytes;
use serde::Deserialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::enforcer::{Action, RuleEnforcer};
use crate::schedule::ScheduleController;
use crate::utils::payload_preview;
use crate::validation::{is_wildcard, validate_ipv4};

/// Which addresses a block command applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every address in the registry (`0.0.0.0` on the wire)
    All,
    Address(Ipv4Addr),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::All => f.write_str("all targets"),
            Target::Address(a) => write!(f, "{}", a),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleAction {
    Enable,
    Disable,
}

/// A decoded inbound command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Block { target: Target, action: Action },
    Schedule(ScheduleAction),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("unknown status '{status}' for {target}")]
    UnknownStatus { target: String, status: String },

    #[error("missing 'ip' or 'status'")]
    MissingFields,

    #[error("invalid IPv4 address '{0}'")]
    InvalidIp(String),
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    command: Option<String>,
}

/// Decode a raw payload. `command` wins when both shapes are present.
pub fn decode(payload: &[u8]) -> Result<Command, DecodeError> {
    let raw: RawMessage = serde_json::from_slice(payload)?;

    if let Some(command) = raw.command {
        return match command.as_str() {
            "schedule_enable" => Ok(Command::Schedule(ScheduleAction::Enable)),
            "schedule_disable" => Ok(Command::Schedule(ScheduleAction::Disable)),
            _ => Err(DecodeError::UnknownCommand(command)),
        };
    }

    let (Some(ip), Some(status)) = (raw.ip, raw.status) else {
        return Err(DecodeError::MissingFields);
    };

    let addr = validate_ipv4(&ip).map_err(|_| DecodeError::InvalidIp(ip.clone()))?;
    let target = if is_wildcard(addr) {
        Target::All
    } else {
        Target::Address(addr)
    };

    let action = match status.to_ascii_lowercase().as_str() {
        "block" => Action::Block,
        "unblock" => Action::Unblock,
        _ => {
            return Err(DecodeError::UnknownStatus {
                target: target.to_string(),
                status,
            })
        }
    };

    Ok(Command::Block { target, action })
}

/// Dispatches decoded commands to the enforcer and the scheduler.
pub struct CommandRouter {
    enforcer: Arc<RuleEnforcer>,
    schedule: Arc<ScheduleController>,
    hold_during_window: bool,
}

impl CommandRouter {
    pub fn new(
        enforcer: Arc<RuleEnforcer>,
        schedule: Arc<ScheduleController>,
        hold_during_window: bool,
    ) -> Self {
        Self {
            enforcer,
            schedule,
            hold_during_window,
        }
    }

    /// Decode and dispatch one payload. Bad input is logged and dropped.
    pub async fn handle(&self, payload: &[u8]) {
        info!("Received message: {}", payload_preview(payload));
        match decode(payload) {
            Ok(command) => self.dispatch(command).await,
            Err(e) => warn!("Discarding message: {}", e),
        }
    }

    pub async fn dispatch(&self, command: Command) {
        match command {
            Command::Schedule(ScheduleAction::Enable) => self.schedule.start().await,
            Command::Schedule(ScheduleAction::Disable) => {
                self.schedule.stop().await;
                info!("Unblocking all devices due to schedule disable");
                self.enforcer.unblock_all().await;
            }
            Command::Block { target, action } => {
                if action == Action::Unblock
                    && self.hold_during_window
                    && self.schedule.holds_block().await
                {
                    warn!(
                        "Schedule is active and within block period ({}), keeping {} blocked",
                        self.schedule.window(),
                        target
                    );
                    return;
                }

                match target {
                    Target::All => {
                        self.enforcer.apply_all(action).await;
                    }
                    Target::Address(addr) => {
                        if let Err(e) = self.enforcer.apply(action, addr).await {
                            error!("Could not {} {}: {:#}", action, addr, e);
                        }
                    }
                }
            }
        }
    }

    /// Handle queued payloads one at a time until every sender is gone.
    pub async fn serve(&self, mut inbox: mpsc::Receiver<Bytes>) {
        while let Some(payload) = inbox.recv().await {
            self.handle(&payload).await;
        }
        debug!("Message queue closed");
    }
}
