//! Apply command: dispatch one payload locally, without a broker.
//!
//! Schedule state does not outlive the process, so `schedule_enable` here
//! only blocks immediately when inside the window.

use anyhow::{Context, Result};
use std::path::Path;

use crate::commands::Stack;
use crate::config::Config;
use crate::enforcer::{check_root, IptablesFilter};
use crate::lock::LockGuard;
use crate::router::decode;

/// Run the apply command
pub async fn run(payload: &str, config_path: &Path) -> Result<()> {
    // Reject bad input before touching privileges or the lock.
    let command = decode(payload.as_bytes()).context("Invalid payload")?;

    let config = Config::load_or_default(config_path)?;
    if !config.filter.use_sudo {
        check_root()?;
    }
    let _lock = LockGuard::acquire()?;

    let filter = IptablesFilter::from_config(&config.filter);
    let stack = Stack::assemble(&config, Box::new(filter))?;
    stack.router.dispatch(command).await;
    stack.schedule.stop().await;

    match stack.enforcer.blocked().await {
        Ok(blocked) if blocked.is_empty() => println!("No addresses blocked"),
        Ok(blocked) => {
            println!("Blocked addresses:");
            for addr in blocked {
                println!("  - {}", addr);
            }
        }
        Err(e) => println!("Could not list blocked addresses: {:#}", e),
    }
    Ok(())
}
