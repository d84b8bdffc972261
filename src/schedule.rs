//! Daily blocking window and the timer that enforces it.
//!
//! [`ScheduleController`] is a two-state machine (`Disabled` / `Enabled`).
//! While enabled it owns one background timer task that fires two named
//! events per day: [`ScheduleEvent::Block`] at `block_at` and
//! [`ScheduleEvent::Unblock`] at `unblock_at`. Events go through the same
//! [`RuleEnforcer`] sweeps as manual commands.
//!
//! The timer never sleeps longer than [`MAX_TIMER_SLEEP`] before reading
//! the wall clock again, so NTP steps, DST changes and suspend are picked
//! up within that bound.

use chrono::{Duration as ChronoDuration, Local, NaiveDateTime, NaiveTime};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::enforcer::{Action, RuleEnforcer};

/// Longest single sleep before the timer re-reads the wall clock.
pub const MAX_TIMER_SLEEP: Duration = Duration::from_secs(30);

/// Source of local wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// The system's local time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Daily interval `[block_at, unblock_at)` during which clients are blocked.
///
/// When `block_at > unblock_at` the window spans midnight. Equal ends make
/// an empty window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindow {
    block_at: NaiveTime,
    unblock_at: NaiveTime,
}

impl ScheduleWindow {
    pub fn new(block_at: NaiveTime, unblock_at: NaiveTime) -> Self {
        Self {
            block_at,
            unblock_at,
        }
    }

    pub fn block_at(&self) -> NaiveTime {
        self.block_at
    }

    pub fn unblock_at(&self) -> NaiveTime {
        self.unblock_at
    }

    /// Whether `time` falls inside the block interval.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.block_at > self.unblock_at {
            time >= self.block_at || time < self.unblock_at
        } else {
            self.block_at <= time && time < self.unblock_at
        }
    }

    /// The next event strictly after `now` and how long until it fires.
    ///
    /// With an empty window both events share one time and `Unblock` wins.
    pub fn next_event(&self, now: NaiveDateTime) -> (ScheduleEvent, Duration) {
        let to_block = until_next(now, self.block_at);
        let to_unblock = until_next(now, self.unblock_at);
        if to_block < to_unblock {
            (ScheduleEvent::Block, to_block)
        } else {
            (ScheduleEvent::Unblock, to_unblock)
        }
    }

    /// The latest event whose time of day lies in `(since, now]`.
    ///
    /// `None` when nothing was crossed or the clock went backwards. Spans
    /// longer than a day only look at the final day.
    pub fn last_crossed(&self, since: NaiveDateTime, now: NaiveDateTime) -> Option<ScheduleEvent> {
        if now <= since {
            return None;
        }

        let mut cursor = since.max(now - ChronoDuration::days(1));
        let mut crossed = None;
        loop {
            let (event, wait) = self.next_event(cursor);
            let Ok(wait) = ChronoDuration::from_std(wait) else {
                break;
            };
            let at = cursor + wait;
            if at > now {
                break;
            }
            crossed = Some(event);
            cursor = at;
        }
        crossed
    }
}

impl fmt::Display for ScheduleWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.block_at.format("%H:%M"),
            self.unblock_at.format("%H:%M")
        )
    }
}

/// Time from `now` until the next occurrence of `at` (always > 0).
pub fn until_next(now: NaiveDateTime, at: NaiveTime) -> Duration {
    let mut next = now.date().and_time(at);
    if next <= now {
        next += ChronoDuration::days(1);
    }
    (next - now).to_std().unwrap_or(Duration::ZERO)
}

/// One of the two daily timer events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleEvent {
    Block,
    Unblock,
}

impl ScheduleEvent {
    pub fn action(&self) -> Action {
        match self {
            ScheduleEvent::Block => Action::Block,
            ScheduleEvent::Unblock => Action::Unblock,
        }
    }
}

enum State {
    Disabled,
    Enabled {
        disarm: watch::Sender<bool>,
        timer: JoinHandle<()>,
    },
}

/// Turns scheduled blocking on and off.
pub struct ScheduleController {
    window: ScheduleWindow,
    enforcer: Arc<RuleEnforcer>,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl ScheduleController {
    pub fn new(window: ScheduleWindow, enforcer: Arc<RuleEnforcer>) -> Self {
        Self::with_clock(window, enforcer, Arc::new(SystemClock))
    }

    pub fn with_clock(
        window: ScheduleWindow,
        enforcer: Arc<RuleEnforcer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            window,
            enforcer,
            clock,
            state: Mutex::new(State::Disabled),
        }
    }

    pub fn window(&self) -> ScheduleWindow {
        self.window
    }

    /// Whether the current time lies inside the window.
    pub fn in_window(&self) -> bool {
        self.window.contains(self.clock.now().time())
    }

    pub async fn is_enabled(&self) -> bool {
        matches!(*self.state.lock().await, State::Enabled { .. })
    }

    /// Scheduling is enabled and the window is active right now.
    pub async fn holds_block(&self) -> bool {
        self.is_enabled().await && self.in_window()
    }

    /// Enable scheduling. A no-op when already enabled.
    ///
    /// When the current time is inside the window every target is blocked
    /// before this returns; then the daily timer is armed.
    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        if matches!(*state, State::Enabled { .. }) {
            info!("Schedule is already enabled");
            return;
        }

        info!("ENABLING scheduled blocking ({})", self.window);
        if self.in_window() {
            info!("Currently within block period, blocking all devices now");
            self.enforcer.block_all().await;
        } else {
            info!("Not in block period, devices stay as they are until the scheduled time");
        }

        let (disarm, disarmed) = watch::channel(false);
        let timer = tokio::spawn(run_timer(
            self.window,
            self.enforcer.clone(),
            self.clock.clone(),
            disarmed,
        ));
        *state = State::Enabled { disarm, timer };
    }

    /// Disable scheduling. A no-op when already disabled.
    ///
    /// Waits for an event that is already firing to finish, so no scheduled
    /// sweep runs after this returns. Rules are left as they are.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, State::Disabled) {
            State::Disabled => info!("Schedule is already disabled"),
            State::Enabled { disarm, timer } => {
                info!("DISABLING scheduled blocking");
                let _ = disarm.send(true);
                if let Err(e) = timer.await {
                    warn!("Schedule timer ended abnormally: {}", e);
                }
            }
        }
    }
}

async fn run_timer(
    window: ScheduleWindow,
    enforcer: Arc<RuleEnforcer>,
    clock: Arc<dyn Clock>,
    mut disarmed: watch::Receiver<bool>,
) {
    info!(
        "Scheduler armed: BLOCK at {}, UNBLOCK at {}",
        window.block_at().format("%H:%M"),
        window.unblock_at().format("%H:%M")
    );

    let mut last = clock.now();
    loop {
        let (event, wait) = window.next_event(last);
        debug!("Next scheduled event {:?} in {:?}", event, wait);

        tokio::select! {
            _ = tokio::time::sleep(wait.min(MAX_TIMER_SLEEP)) => {}
            _ = disarmed.changed() => break,
        }
        if *disarmed.borrow() {
            break;
        }

        let now = clock.now();
        if now < last {
            warn!("Wall clock stepped back from {} to {}", last, now);
        } else if let Some(event) = window.last_crossed(last, now) {
            let at = match event {
                ScheduleEvent::Block => window.block_at(),
                ScheduleEvent::Unblock => window.unblock_at(),
            };
            info!("SCHEDULED {:?} triggered at {}", event, at.format("%H:%M"));
            enforcer.apply_all(event.action()).await;
        }
        last = now;
    }

    info!("Scheduler disarmed");
}
