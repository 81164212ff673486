use crate::config::ActivityConfig;
use std::time::Duration;
use tokio::time::Instant;

/// Which deadline is currently showing a countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Warning {
    Lock,
    Logout,
}

/// What the monitor has to do after evaluating the deadlines at one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    Quiet,
    WarnLock { remaining_secs: u64 },
    WarnLogout { remaining_secs: u64 },
    Lock,
    Logout,
}

/// Idle clocks behind the lock and logout deadlines.
///
/// Pure bookkeeping: every method takes the current instant so the deadline logic can
/// be driven without a runtime.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    config: ActivityConfig,
    lock_anchor: Instant,
    logout_anchor: Instant,
    warning: Option<Warning>,
    suspended: bool,
    resets: u64,
}

impl ActivityTracker {
    #[must_use]
    pub const fn new(config: ActivityConfig, now: Instant) -> Self {
        Self {
            config,
            lock_anchor: now,
            logout_anchor: now,
            warning: None,
            suspended: false,
            resets: 0,
        }
    }

    /// Restarts both deadlines. Returns `true` when a warning countdown was cancelled.
    pub fn touch(&mut self, now: Instant) -> bool {
        self.lock_anchor = now;
        self.logout_anchor = now;
        self.resets += 1;
        self.warning.take().is_some()
    }

    /// Re-arms the lock deadline alone, leaving the logout backstop running.
    pub fn reset_lock_clock(&mut self, now: Instant) {
        self.lock_anchor = now;
        if self.warning == Some(Warning::Lock) {
            self.warning = None;
        }
    }

    /// Stops both deadlines, e.g. while the screen is locked.
    pub fn suspend(&mut self) {
        self.suspended = true;
        self.warning = None;
    }

    /// Restarts both deadlines from `now` after a suspension.
    pub fn resume(&mut self, now: Instant) {
        self.suspended = false;
        self.touch(now);
    }

    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        self.suspended
    }

    #[must_use]
    pub const fn warning(&self) -> Option<Warning> {
        self.warning
    }

    /// How many times the idle clock has been restarted.
    #[must_use]
    pub const fn resets(&self) -> u64 {
        self.resets
    }

    #[must_use]
    pub fn lock_deadline(&self) -> Instant {
        self.lock_anchor + self.config.lock_timeout()
    }

    #[must_use]
    pub fn logout_deadline(&self) -> Instant {
        self.logout_anchor + self.config.logout_timeout()
    }

    /// Time left before locking, `None` while suspended.
    #[must_use]
    pub fn time_until_lock(&self, now: Instant) -> Option<Duration> {
        if self.suspended {
            return None;
        }
        Some(self.lock_deadline().saturating_duration_since(now))
    }

    #[must_use]
    pub fn time_until_logout(&self, now: Instant) -> Option<Duration> {
        if self.suspended {
            return None;
        }
        Some(self.logout_deadline().saturating_duration_since(now))
    }

    /// Evaluates both deadlines at `now`.
    ///
    /// The logout backstop wins over the lock deadline when both are due or warning.
    /// Reaching the logout deadline suspends the tracker; what happens after a lock is
    /// decided by the caller through [`suspend`](Self::suspend) or
    /// [`reset_lock_clock`](Self::reset_lock_clock).
    pub fn tick(&mut self, now: Instant) -> TickAction {
        if self.suspended {
            return TickAction::Quiet;
        }

        if now >= self.logout_deadline() {
            self.suspend();
            return TickAction::Logout;
        }
        if now >= self.lock_deadline() {
            self.warning = None;
            return TickAction::Lock;
        }

        let logout_left = self.logout_deadline() - now;
        if logout_left <= self.config.logout_warning() {
            self.warning = Some(Warning::Logout);
            return TickAction::WarnLogout {
                remaining_secs: whole_seconds(logout_left),
            };
        }

        let lock_left = self.lock_deadline() - now;
        if lock_left <= self.config.lock_warning() {
            self.warning = Some(Warning::Lock);
            return TickAction::WarnLock {
                remaining_secs: whole_seconds(lock_left),
            };
        }

        TickAction::Quiet
    }
}

fn whole_seconds(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}
