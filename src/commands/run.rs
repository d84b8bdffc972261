//! Daemon command: subscribe to the broker and enforce what arrives.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::broker::BrokerConnection;
use crate::cli::RunArgs;
use crate::commands::Stack;
use crate::config::Config;
use crate::enforcer::{check_root, IptablesFilter};
use crate::fs_abstraction::real_fs;
use crate::lock::LockGuard;
use crate::signal::{spawn_reload_on_hangup, ShutdownGuard};

/// Payloads waiting for the dispatcher. When full, new messages are dropped.
const DISPATCH_QUEUE: usize = 64;

/// Load config, apply CLI overrides and check everything needed to connect.
pub fn prepare_config(args: &RunArgs, config_path: &Path) -> Result<Config> {
    let mut config = Config::load_or_default(config_path)?;
    args.apply_to(&mut config);
    config.validate()?;
    config.broker.validate_for_connect()?;
    Ok(config)
}

/// Run the daemon until SIGINT/SIGTERM or a fatal broker error.
pub async fn run(args: &RunArgs, config_path: &Path) -> Result<()> {
    let config = prepare_config(args, config_path)?;

    if !config.filter.use_sudo {
        check_root()?;
    }
    let _lock = LockGuard::acquire()?;

    let filter = IptablesFilter::from_config(&config.filter);
    let stack = Stack::assemble(&config, Box::new(filter))?;
    info!("Block schedule window: {}", stack.schedule.window());

    let mut broker = BrokerConnection::connect(&config.broker, real_fs())
        .context("Failed to prepare broker session")?;

    let shutdown = ShutdownGuard::new();
    let reload = spawn_reload_on_hangup(Arc::clone(&stack.registry), shutdown.token());

    let (tx, rx) = mpsc::channel(DISPATCH_QUEUE);
    broker.subscribe(&config.broker.topic, tx)?;

    let router = Arc::clone(&stack.router);
    let dispatcher = tokio::spawn(async move { router.serve(rx).await });

    let outcome = broker.run(shutdown.token()).await;

    // The broker owned the only sender; the dispatcher drains and exits.
    shutdown.request_shutdown();
    if let Err(e) = dispatcher.await {
        error!("Dispatcher ended abnormally: {}", e);
    }
    stack.schedule.stop().await;
    if let Some(handle) = reload {
        let _ = handle.await;
    }

    match outcome {
        Ok(()) => {
            info!("Shutdown complete, filter rules left in place");
            Ok(())
        }
        Err(e) => Err(e).context("Broker session failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(yaml: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_prepare_config_requires_endpoint() {
        let file = write_config("targets_file: /tmp/targets.txt\n");
        let err = prepare_config(&RunArgs::default(), file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("endpoint"));
    }

    #[test]
    fn test_prepare_config_cli_overrides_file() {
        let file = write_config(
            "broker:\n  endpoint: from-file.example.com\n  topic: block/device\n",
        );
        let args = RunArgs {
            endpoint: Some("from-cli.example.com".to_string()),
            topic: Some("block/den".to_string()),
            ..RunArgs::default()
        };
        let config = prepare_config(&args, file.path()).unwrap();
        assert_eq!(config.broker.endpoint, "from-cli.example.com");
        assert_eq!(config.broker.topic, "block/den");
    }

    #[test]
    fn test_prepare_config_rejects_bad_override() {
        let file = write_config("broker:\n  endpoint: broker.example.com\n");
        let args = RunArgs {
            port: Some(0),
            ..RunArgs::default()
        };
        assert!(prepare_config(&args, file.path()).is_err());
    }
}
