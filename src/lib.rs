//! # curfew - MQTT-driven DNS curfew for Linux gateways
//!
//! A small daemon for home gateways: it subscribes to one MQTT topic and
//! turns the commands it receives into iptables rules that drop DNS
//! traffic (UDP/TCP port 53) from selected client devices, either on demand
//! or on a daily schedule.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          curfew                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap)              run · status · apply · version     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Config (serde_yaml)   broker, targets, schedule, filter    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  BrokerConnection (rumqttc, mutual TLS)                     │
//! │    └── reconnect state machine, resubscribe on connect      │
//! │            │ bounded queue                                  │
//! │            ▼                                                │
//! │  CommandRouter  ──► ScheduleController (daily timer)        │
//! │            │                 │                              │
//! │            ▼                 ▼                              │
//! │  RuleEnforcer (single lock) ──► PacketFilter (iptables)     │
//! │            │                                                │
//! │            └── TargetRegistry (target file, SIGHUP reload)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Commands
//!
//! ```text
//! {"ip": "10.0.0.5", "status": "block"}     block one device
//! {"ip": "0.0.0.0",  "status": "unblock"}   unblock every target
//! {"command": "schedule_enable"}            arm the daily window
//! {"command": "schedule_disable"}           disarm it and unblock all
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use curfew::config::Config;
//! use curfew::enforcer::{IptablesFilter, RuleEnforcer};
//! use curfew::targets::TargetRegistry;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("/etc/curfew/config.yaml")?;
//!     let registry = Arc::new(TargetRegistry::load(&config.targets_file)?);
//!     let filter = IptablesFilter::from_config(&config.filter);
//!     let enforcer = RuleEnforcer::new(Box::new(filter), registry);
//!
//!     let report = enforcer.block_all().await;
//!     println!("{} of {} targets blocked", report.succeeded(), report.attempted);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`broker`] - MQTT session over mutual TLS with reconnect
//! - [`cli`] - Command-line interface definitions
//! - [`cmd_abstraction`] - External command execution (mockable)
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration parsing and validation
//! - [`enforcer`] - Rule enforcement and the iptables backend
//! - [`error`] - Typed errors
//! - [`fs_abstraction`] - Filesystem access (mockable)
//! - [`lock`] - Single-instance lock file
//! - [`router`] - Payload decoding and command dispatch
//! - [`schedule`] - Daily blocking window and its timer
//! - [`signal`] - Shutdown and reload signal handling
//! - [`targets`] - Target address registry
//! - [`utils`] - Small helpers (truncation, payload previews)
//! - [`validation`] - Input validation

pub mod broker;
pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod enforcer;
pub mod error;
pub mod fs_abstraction;
pub mod lock;
pub mod router;
pub mod schedule;
pub mod signal;
pub mod targets;
pub mod utils;
pub mod validation;

pub use cli::{Cli, Commands};
pub use config::Config;
