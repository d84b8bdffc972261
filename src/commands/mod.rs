//! CLI command implementations.

pub mod apply;
pub mod run;
pub mod status;

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::Config;
use crate::enforcer::{PacketFilter, RuleEnforcer};
use crate::router::CommandRouter;
use crate::schedule::ScheduleController;
use crate::targets::TargetRegistry;

/// The enforcement components, wired together from one config.
pub struct Stack {
    pub registry: Arc<TargetRegistry>,
    pub enforcer: Arc<RuleEnforcer>,
    pub schedule: Arc<ScheduleController>,
    pub router: Arc<CommandRouter>,
}

impl Stack {
    /// Load the target list and wire the enforcer, scheduler and router
    /// around `filter`. An unreadable target file is fatal.
    pub fn assemble(config: &Config, filter: Box<dyn PacketFilter>) -> Result<Self> {
        let registry = Arc::new(
            TargetRegistry::load(&config.targets_file).context("Failed to load target list")?,
        );
        Self::with_registry(config, filter, registry)
    }

    pub fn with_registry(
        config: &Config,
        filter: Box<dyn PacketFilter>,
        registry: Arc<TargetRegistry>,
    ) -> Result<Self> {
        let window = config.schedule.window()?;
        let enforcer = Arc::new(RuleEnforcer::new(filter, Arc::clone(&registry)));
        let schedule = Arc::new(ScheduleController::new(window, Arc::clone(&enforcer)));
        let router = Arc::new(CommandRouter::new(
            Arc::clone(&enforcer),
            Arc::clone(&schedule),
            config.schedule.hold_during_window,
        ));

        Ok(Self {
            registry,
            enforcer,
            schedule,
            router,
        })
    }
}
