//! Rule enforcement: the only path through which the packet filter is mutated.
//!
//! [`RuleEnforcer`] owns the [`PacketFilter`] backend behind a single async
//! mutex. Single-address operations and whole-registry sweeps all take that
//! lock, so a sweep runs to completion before any other mutation starts and
//! a manual command can never interleave with a scheduled one.

mod iptables;

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub use iptables::{IptablesFilter, RuleSpec};

use crate::error::CurfewError;
use crate::targets::TargetRegistry;

/// What to do with an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Block,
    Unblock,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Block => f.write_str("block"),
            Action::Unblock => f.write_str("unblock"),
        }
    }
}

/// Trait for packet-filter backends.
///
/// Implementations must be idempotent: `ensure_blocked` never adds a rule
/// that already exists and `ensure_unblocked` on an address without rules
/// is a no-op.
#[async_trait]
pub trait PacketFilter: Send + Sync {
    /// Make sure every blocking rule for `addr` exists.
    /// Returns the number of rules inserted.
    async fn ensure_blocked(&self, addr: Ipv4Addr) -> Result<usize>;

    /// Remove every blocking rule for `addr`.
    /// Returns the number of rules removed.
    async fn ensure_unblocked(&self, addr: Ipv4Addr) -> Result<usize>;

    /// Addresses that currently have at least one blocking rule.
    async fn blocked(&self) -> Result<Vec<Ipv4Addr>>;
}

#[async_trait]
impl<T: PacketFilter + ?Sized> PacketFilter for Arc<T> {
    async fn ensure_blocked(&self, addr: Ipv4Addr) -> Result<usize> {
        (**self).ensure_blocked(addr).await
    }

    async fn ensure_unblocked(&self, addr: Ipv4Addr) -> Result<usize> {
        (**self).ensure_unblocked(addr).await
    }

    async fn blocked(&self) -> Result<Vec<Ipv4Addr>> {
        (**self).blocked().await
    }
}

/// Outcome of a whole-registry sweep.
#[derive(Debug, Clone)]
pub struct SweepReport {
    pub action: Action,
    /// Addresses attempted
    pub attempted: usize,
    /// Addresses whose rules actually changed
    pub changed: usize,
    /// Addresses that failed, with the error message
    pub failed: Vec<(Ipv4Addr, String)>,
}

impl SweepReport {
    fn new(action: Action) -> Self {
        Self {
            action,
            attempted: 0,
            changed: 0,
            failed: Vec::new(),
        }
    }

    /// Whether at least one address failed.
    pub fn is_partial_failure(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.attempted - self.failed.len()
    }
}

/// Serializes all access to the packet filter.
pub struct RuleEnforcer {
    filter: Mutex<Box<dyn PacketFilter>>,
    registry: Arc<TargetRegistry>,
}

impl RuleEnforcer {
    pub fn new(filter: Box<dyn PacketFilter>, registry: Arc<TargetRegistry>) -> Self {
        Self {
            filter: Mutex::new(filter),
            registry,
        }
    }

    /// Ensure `addr` is blocked. Returns `true` if rules were added.
    pub async fn block(&self, addr: Ipv4Addr) -> Result<bool> {
        self.apply(Action::Block, addr).await
    }

    /// Ensure `addr` is unblocked. Returns `true` if rules were removed.
    pub async fn unblock(&self, addr: Ipv4Addr) -> Result<bool> {
        self.apply(Action::Unblock, addr).await
    }

    /// Apply `action` to a single address.
    pub async fn apply(&self, action: Action, addr: Ipv4Addr) -> Result<bool> {
        let filter = self.filter.lock().await;
        apply_one(&**filter, action, addr).await
    }

    /// Block every address in the registry.
    pub async fn block_all(&self) -> SweepReport {
        self.apply_all(Action::Block).await
    }

    /// Unblock every address in the registry.
    pub async fn unblock_all(&self) -> SweepReport {
        self.apply_all(Action::Unblock).await
    }

    /// Apply `action` to every registry member while holding the filter
    /// lock for the whole sweep. A failing address does not stop the sweep.
    pub async fn apply_all(&self, action: Action) -> SweepReport {
        let filter = self.filter.lock().await;
        let targets = self.registry.snapshot();
        let mut report = SweepReport::new(action);

        if targets.is_empty() {
            warn!("No target addresses configured, nothing to {}", action);
            return report;
        }

        info!("Applying {} to all {} targets", action, targets.len());
        for addr in targets {
            report.attempted += 1;
            match apply_one(&**filter, action, addr).await {
                Ok(true) => report.changed += 1,
                Ok(false) => {}
                Err(e) => report.failed.push((addr, format!("{:#}", e))),
            }
        }

        if report.is_partial_failure() {
            error!(
                "{} all partially failed: {}/{} addresses failed",
                action,
                report.failed.len(),
                report.attempted
            );
        } else {
            info!(
                "{} all complete: {} targets ({} changed)",
                action, report.attempted, report.changed
            );
        }
        report
    }

    /// Addresses currently blocked, derived from the filter table.
    pub async fn blocked(&self) -> Result<Vec<Ipv4Addr>> {
        let filter = self.filter.lock().await;
        filter.blocked().await
    }
}

async fn apply_one(filter: &dyn PacketFilter, action: Action, addr: Ipv4Addr) -> Result<bool> {
    let result = match action {
        Action::Block => filter.ensure_blocked(addr).await,
        Action::Unblock => filter.ensure_unblocked(addr).await,
    };

    match result {
        Ok(0) => {
            match action {
                Action::Block => info!("Client {} is already blocked", addr),
                Action::Unblock => info!("Client {} has no blocking rules", addr),
            }
            Ok(false)
        }
        Ok(n) => {
            match action {
                Action::Block => info!("Client {} BLOCKED ({} rules added)", addr, n),
                Action::Unblock => info!("Client {} UNBLOCKED ({} rules removed)", addr, n),
            }
            Ok(true)
        }
        Err(e) => {
            error!("Failed to {} {}: {:#}", action, addr, e);
            Err(e)
        }
    }
}

/// Check if running as root (effective UID == 0)
///
/// Modifying the filter table needs CAP_NET_ADMIN; UID 0 covers the common
/// case of running as a system service.
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid() has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        return Err(CurfewError::Permission(
            "This daemon modifies firewall rules and must run as root.\n\
             Alternatively, set filter.use_sudo: true in the config."
                .to_string(),
        )
        .into());
    }
    Ok(())
}
