//! iptables backend implementation.
//!
//! Each blocked client gets one DROP rule per (protocol, port) pair, e.g.
//! with the default DNS-only shape:
//!
//! ```text
//! -A INPUT -s 10.0.0.5/32 -p udp -m udp --dport 53 -j DROP
//! -A INPUT -s 10.0.0.5/32 -p tcp -m tcp --dport 53 -j DROP
//! ```
//!
//! Rules are checked with `-C` before being inserted with `-I`, and removed
//! with `-D` until iptables reports that no matching rule is left. Every
//! call passes `-w 5` so a held xtables lock fails the call after five
//! seconds instead of hanging it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

use super::PacketFilter;
use crate::cmd_abstraction::{CommandExecutor, CommandOutput, RealCommandExecutor};
use crate::config::FilterConfig;
use crate::error::CurfewError;

/// Upper bound on `-D` passes per rule, in case something keeps re-adding it.
const MAX_DELETE_PASSES: usize = 64;

/// Seconds iptables waits for the xtables lock before giving up.
const XTABLES_WAIT_SECS: &str = "5";

/// Shape of the rules installed for one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub chain: String,
    pub protocols: Vec<String>,
    pub ports: Vec<u16>,
}

impl RuleSpec {
    pub fn from_config(config: &FilterConfig) -> Self {
        Self {
            chain: config.chain.clone(),
            protocols: config.protocols.clone(),
            ports: config.ports.clone(),
        }
    }

    /// Every (protocol, port) pair a client is blocked on.
    fn matches(&self) -> impl Iterator<Item = (&str, u16)> + '_ {
        self.protocols
            .iter()
            .flat_map(move |p| self.ports.iter().map(move |port| (p.as_str(), *port)))
    }

    /// Rule body shared by -C / -I / -D.
    fn rule_args(&self, addr: Ipv4Addr, proto: &str, port: u16) -> Vec<String> {
        vec![
            "-s".to_string(),
            addr.to_string(),
            "-p".to_string(),
            proto.to_string(),
            "--dport".to_string(),
            port.to_string(),
            "-j".to_string(),
            "DROP".to_string(),
        ]
    }
}

impl Default for RuleSpec {
    fn default() -> Self {
        Self::from_config(&FilterConfig::default())
    }
}

/// iptables packet filter driven through a [`CommandExecutor`].
///
/// Commands run on tokio's blocking pool, so a slow iptables never stalls
/// the broker session or the scheduler.
pub struct IptablesFilter<E: CommandExecutor = RealCommandExecutor> {
    inner: Arc<Iptables<E>>,
}

struct Iptables<E> {
    executor: E,
    program: String,
    use_sudo: bool,
    spec: RuleSpec,
}

impl IptablesFilter<RealCommandExecutor> {
    pub fn from_config(config: &FilterConfig) -> Self {
        Self::with_executor(RealCommandExecutor::new(), config)
    }
}

impl<E: CommandExecutor> IptablesFilter<E> {
    pub fn with_executor(executor: E, config: &FilterConfig) -> Self {
        Self {
            inner: Arc::new(Iptables {
                executor,
                program: config.iptables_path.clone(),
                use_sudo: config.use_sudo,
                spec: RuleSpec::from_config(config),
            }),
        }
    }
}

impl<E: CommandExecutor + 'static> IptablesFilter<E> {
    async fn offload<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Iptables<E>) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || job(inner.as_ref()))
            .await
            .context("iptables worker did not finish")?
    }
}

impl<E: CommandExecutor> Iptables<E> {
    /// Run iptables with a bounded wait for the xtables lock, through sudo
    /// when configured.
    fn run(&self, op: &str, rest: Vec<String>) -> Result<CommandOutput> {
        let mut args = Vec::with_capacity(rest.len() + 4);
        let cmd = if self.use_sudo {
            args.push(self.program.clone());
            "sudo"
        } else {
            self.program.as_str()
        };
        args.push("-w".to_string());
        args.push(XTABLES_WAIT_SECS.to_string());
        args.push(op.to_string());
        args.extend(rest);

        debug!("Running {} {}", cmd, args.join(" "));
        self.executor.execute(cmd, &args)
    }

    fn rule_command(&self, op: &str, addr: Ipv4Addr, proto: &str, port: u16) -> Result<CommandOutput> {
        let mut rest = vec![self.spec.chain.clone()];
        rest.extend(self.spec.rule_args(addr, proto, port));
        self.run(op, rest)
    }

    fn rule_exists(&self, addr: Ipv4Addr, proto: &str, port: u16) -> Result<bool> {
        let output = self.rule_command("-C", addr, proto, port)?;
        if output.success {
            Ok(true)
        } else if output.rule_missing() {
            Ok(false)
        } else {
            Err(failure("check", addr, &output).into())
        }
    }

    fn insert_rule(&self, addr: Ipv4Addr, proto: &str, port: u16) -> Result<()> {
        let output = self.rule_command("-I", addr, proto, port)?;
        if output.success {
            Ok(())
        } else {
            Err(failure("insert", addr, &output).into())
        }
    }

    /// Delete one copy of the rule. `Ok(false)` once none is left.
    fn delete_rule(&self, addr: Ipv4Addr, proto: &str, port: u16) -> Result<bool> {
        let output = self.rule_command("-D", addr, proto, port)?;
        if output.success {
            Ok(true)
        } else if output.rule_missing() {
            Ok(false)
        } else {
            Err(failure("delete", addr, &output).into())
        }
    }

    fn list_rules(&self) -> Result<String> {
        let output = self.run("-S", vec![self.spec.chain.clone()])?;
        if !output.success {
            return Err(CurfewError::Firewall(format!(
                "listing chain {} failed: {}",
                self.spec.chain,
                output.stderr.trim()
            ))
            .into());
        }
        Ok(output.stdout)
    }

    fn block(&self, addr: Ipv4Addr) -> Result<usize> {
        let mut inserted = 0;
        for (proto, port) in self.spec.matches() {
            if !self.rule_exists(addr, proto, port)? {
                self.insert_rule(addr, proto, port)?;
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn unblock(&self, addr: Ipv4Addr) -> Result<usize> {
        let mut removed = 0;
        for (proto, port) in self.spec.matches() {
            let mut passes = 0;
            while self.delete_rule(addr, proto, port)? {
                removed += 1;
                passes += 1;
                if passes >= MAX_DELETE_PASSES {
                    return Err(CurfewError::Firewall(format!(
                        "rule for {} ({}/{}) still present after {} deletions",
                        addr, proto, port, passes
                    ))
                    .into());
                }
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl<E: CommandExecutor + 'static> PacketFilter for IptablesFilter<E> {
    async fn ensure_blocked(&self, addr: Ipv4Addr) -> Result<usize> {
        self.offload(move |ipt| ipt.block(addr)).await
    }

    async fn ensure_unblocked(&self, addr: Ipv4Addr) -> Result<usize> {
        self.offload(move |ipt| ipt.unblock(addr)).await
    }

    async fn blocked(&self) -> Result<Vec<Ipv4Addr>> {
        self.offload(|ipt| Ok(parse_blocked(&ipt.list_rules()?, &ipt.spec)))
            .await
    }
}

fn failure(what: &str, addr: Ipv4Addr, output: &CommandOutput) -> CurfewError {
    CurfewError::Firewall(format!(
        "iptables {} for {} failed (exit {}): {}",
        what,
        addr,
        output
            .code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string()),
        output.stderr.trim()
    ))
}

/// Extract blocked client addresses from `iptables -S <chain>` output.
///
/// Only rules matching our shape count: a single-host source, a protocol
/// and destination port we manage, and a DROP target.
pub fn parse_blocked(output: &str, spec: &RuleSpec) -> Vec<Ipv4Addr> {
    let mut blocked = BTreeSet::new();

    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 || tokens[0] != "-A" || tokens[1] != spec.chain {
            continue;
        }

        let value_of = |flag: &str| {
            tokens
                .windows(2)
                .find(|w| w[0] == flag)
                .map(|w| w[1])
        };

        if value_of("-j") != Some("DROP") {
            continue;
        }
        let Some(proto) = value_of("-p") else { continue };
        if !spec.protocols.iter().any(|p| p == proto) {
            continue;
        }
        let Some(port) = value_of("--dport").and_then(|p| p.parse::<u16>().ok()) else {
            continue;
        };
        if !spec.ports.contains(&port) {
            continue;
        }
        let Some(source) = value_of("-s") else { continue };
        let host = source.strip_suffix("/32").unwrap_or(source);
        if let Ok(addr) = host.parse::<Ipv4Addr>() {
            blocked.insert(addr);
        }
    }

    blocked.into_iter().collect()
}
