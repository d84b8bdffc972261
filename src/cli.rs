//! CLI argument parsing with clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{Config, DEFAULT_CONFIG_PATH};

#[derive(Parser)]
#[command(name = "curfew")]
#[command(author, version, about = "MQTT-driven DNS curfew for Linux gateways")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect to the broker and enforce commands until stopped
    Run(RunArgs),

    /// Show targets, schedule window and active blocks
    Status,

    /// Dispatch a single command payload locally, without a broker
    Apply {
        /// JSON payload, e.g. '{"ip":"0.0.0.0","status":"block"}'
        payload: String,
    },

    /// Show version
    Version,
}

/// Overrides applied on top of the config file.
#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// Broker endpoint hostname
    #[arg(short, long)]
    pub endpoint: Option<String>,

    /// Client certificate (PEM)
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(short, long)]
    pub key: Option<PathBuf>,

    /// Root CA certificate (PEM)
    #[arg(long)]
    pub ca_file: Option<PathBuf>,

    /// MQTT client ID
    #[arg(long)]
    pub client_id: Option<String>,

    /// Topic to subscribe to
    #[arg(short, long)]
    pub topic: Option<String>,

    /// Broker port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Target address list
    #[arg(long)]
    pub targets: Option<PathBuf>,
}

impl RunArgs {
    /// Overwrite config values with whatever was given on the command line.
    pub fn apply_to(&self, config: &mut Config) {
        let broker = &mut config.broker;
        if let Some(endpoint) = &self.endpoint {
            broker.endpoint = endpoint.clone();
        }
        if let Some(cert) = &self.cert {
            broker.cert = cert.clone();
        }
        if let Some(key) = &self.key {
            broker.key = key.clone();
        }
        if let Some(ca_file) = &self.ca_file {
            broker.ca_file = ca_file.clone();
        }
        if let Some(client_id) = &self.client_id {
            broker.client_id = client_id.clone();
        }
        if let Some(topic) = &self.topic {
            broker.topic = topic.clone();
        }
        if let Some(port) = self.port {
            broker.port = port;
        }
        if let Some(targets) = &self.targets {
            config.targets_file = targets.clone();
        }
    }
}
