use crate::activity::{ActivityTracker, TickAction};
use crate::config::ActivityConfig;
use async_trait::async_trait;
use color_eyre::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, trace, warn};

/// Resolution of the monitor and of its warning countdowns.
pub const TICK: Duration = Duration::from_secs(1);

/// Result of asking the lock state machine to lock the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTrigger {
    Engaged,
    Refused,
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    /// Called once per second inside the lock warning window.
    async fn on_lock_warning(&self, _remaining_secs: u64) {}

    /// Called once per second inside the logout warning window.
    async fn on_logout_warning(&self, _remaining_secs: u64) {}

    /// A running warning countdown was cancelled by activity.
    async fn on_warning_cleared(&self) {}

    async fn on_lock(&self) -> LockTrigger;

    async fn on_logout(&self);
}

/// Watches for inactivity and drives the lock and logout deadlines.
pub struct ActivityMonitor {
    tracker: Arc<Mutex<ActivityTracker>>,
    pending: Arc<AtomicBool>,
    handler: Arc<dyn ActivityHandler>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ActivityMonitor {
    /// # Errors
    ///
    /// Returns an error if the configuration fails validation.
    pub fn new(config: ActivityConfig, handler: Arc<dyn ActivityHandler>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            tracker: Arc::new(Mutex::new(ActivityTracker::new(config, Instant::now()))),
            pending: Arc::new(AtomicBool::new(false)),
            handler,
            task: Mutex::new(None),
        })
    }

    /// Starts the monitor loop if it is not already running. Both deadlines start now.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn start(&self) {
        let mut task = lock_ignoring_poison(&self.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        {
            let mut tracker = lock_ignoring_poison(&self.tracker);
            if !tracker.is_suspended() {
                tracker.touch(Instant::now());
            }
        }
        self.pending.store(false, Ordering::Release);

        *task = Some(tokio::spawn(run(
            Arc::clone(&self.tracker),
            Arc::clone(&self.pending),
            Arc::clone(&self.handler),
        )));
        info!("Activity monitor started");
    }

    /// Cancels the monitor loop.
    pub fn stop(&self) {
        if let Some(handle) = lock_ignoring_poison(&self.task).take() {
            handle.abort();
            info!("Activity monitor stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        lock_ignoring_poison(&self.task)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Records a user interaction. Bursts are folded into one reset at the next tick;
    /// input is ignored while suspended.
    pub fn record_activity(&self) {
        if lock_ignoring_poison(&self.tracker).is_suspended() {
            trace!("Activity ignored while suspended");
            return;
        }
        self.pending.store(true, Ordering::Release);
    }

    /// Explicit "continue working" from the warning prompt: restarts both deadlines now.
    pub async fn continue_working(&self) {
        let cleared = {
            let mut tracker = lock_ignoring_poison(&self.tracker);
            if tracker.is_suspended() {
                return;
            }
            tracker.touch(Instant::now())
        };
        if cleared {
            debug!("Warning dismissed by user");
            self.handler.on_warning_cleared().await;
        }
    }

    /// Stops both deadlines until [`resume`](Self::resume), e.g. while locked.
    pub fn suspend(&self) {
        lock_ignoring_poison(&self.tracker).suspend();
        self.pending.store(false, Ordering::Release);
        debug!("Activity monitor suspended");
    }

    /// Restarts both deadlines from this moment. Input seen while suspended does not count.
    pub fn resume(&self) {
        self.pending.store(false, Ordering::Release);
        lock_ignoring_poison(&self.tracker).resume(Instant::now());
        debug!("Activity monitor resumed");
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        lock_ignoring_poison(&self.tracker).is_suspended()
    }

    #[must_use]
    pub fn time_until_lock(&self) -> Option<Duration> {
        lock_ignoring_poison(&self.tracker).time_until_lock(Instant::now())
    }

    #[must_use]
    pub fn time_until_logout(&self) -> Option<Duration> {
        lock_ignoring_poison(&self.tracker).time_until_logout(Instant::now())
    }

    /// Number of times the idle clock was restarted.
    #[must_use]
    pub fn activity_resets(&self) -> u64 {
        lock_ignoring_poison(&self.tracker).resets()
    }
}

impl Drop for ActivityMonitor {
    fn drop(&mut self) {
        if let Some(handle) = lock_ignoring_poison(&self.task).take() {
            handle.abort();
        }
    }
}

pub(crate) fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run(tracker: Arc<Mutex<ActivityTracker>>, pending: Arc<AtomicBool>, handler: Arc<dyn ActivityHandler>) {
    let mut ticker = interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let now = Instant::now();

        let (cleared, action) = {
            let mut tracker = lock_ignoring_poison(&tracker);
            let mut cleared = false;
            if pending.swap(false, Ordering::AcqRel) && !tracker.is_suspended() {
                cleared = tracker.touch(now);
            }
            (cleared, tracker.tick(now))
        };

        if cleared {
            debug!("Warning cancelled by activity");
            handler.on_warning_cleared().await;
        }

        match action {
            TickAction::Quiet => {}
            TickAction::WarnLock { remaining_secs } => handler.on_lock_warning(remaining_secs).await,
            TickAction::WarnLogout { remaining_secs } => handler.on_logout_warning(remaining_secs).await,
            TickAction::Lock => {
                info!("Auto-lock triggered due to inactivity");
                match handler.on_lock().await {
                    LockTrigger::Engaged => {
                        debug!("Auto-lock engaged");
                        lock_ignoring_poison(&tracker).suspend();
                    }
                    LockTrigger::Refused => {
                        warn!("Auto-lock refused, logout deadline stays armed");
                        // Re-arm the lock deadline to prevent immediate re-triggering
                        lock_ignoring_poison(&tracker).reset_lock_clock(Instant::now());
                    }
                }
            }
            TickAction::Logout => {
                warn!("Logout triggered due to inactivity");
                handler.on_logout().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use tokio::time::sleep;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Seen {
        LockWarning(u64),
        LogoutWarning(u64),
        Cleared,
        Lock,
        Logout,
    }

    struct Recorder {
        seen: Mutex<Vec<Seen>>,
        trigger: LockTrigger,
    }

    impl Recorder {
        fn new(trigger: LockTrigger) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                trigger,
            })
        }

        fn seen(&self) -> Vec<Seen> {
            self.seen.lock().unwrap().clone()
        }

        fn count(&self, item: &Seen) -> usize {
            self.seen().iter().filter(|s| *s == item).count()
        }

        fn push(&self, item: Seen) {
            self.seen.lock().unwrap().push(item);
        }
    }

    #[async_trait]
    impl ActivityHandler for Recorder {
        async fn on_lock_warning(&self, remaining_secs: u64) {
            self.push(Seen::LockWarning(remaining_secs));
        }

        async fn on_logout_warning(&self, remaining_secs: u64) {
            self.push(Seen::LogoutWarning(remaining_secs));
        }

        async fn on_warning_cleared(&self) {
            self.push(Seen::Cleared);
        }

        async fn on_lock(&self) -> LockTrigger {
            self.push(Seen::Lock);
            self.trigger
        }

        async fn on_logout(&self) {
            self.push(Seen::Logout);
        }
    }

    fn config() -> ActivityConfig {
        ActivityConfig {
            lock_timeout_secs: 10,
            logout_timeout_secs: 30,
            lock_warning_secs: 3,
            logout_warning_secs: 3,
        }
    }

    fn monitor(recorder: &Arc<Recorder>) -> ActivityMonitor {
        let handler: Arc<dyn ActivityHandler> = Arc::clone(recorder) as Arc<dyn ActivityHandler>;
        ActivityMonitor::new(config(), handler).unwrap()
    }

    #[test]
    fn test_rejects_logout_shorter_than_lock() {
        let recorder = Recorder::new(LockTrigger::Engaged);
        let config = ActivityConfig {
            lock_timeout_secs: 60,
            logout_timeout_secs: 30,
            ..config()
        };
        assert!(ActivityMonitor::new(config, recorder).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_is_warned_then_locked() {
        let recorder = Recorder::new(LockTrigger::Engaged);
        let monitor = monitor(&recorder);
        monitor.start();

        sleep(Duration::from_millis(12_500)).await;
        assert_eq!(
            recorder.seen(),
            vec![Seen::LockWarning(3), Seen::LockWarning(2), Seen::LockWarning(1), Seen::Lock]
        );
        assert!(monitor.is_suspended());

        // A successful lock supersedes the logout deadline for this idle period.
        sleep(Duration::from_secs(120)).await;
        assert_eq!(recorder.count(&Seen::Logout), 0);
        assert_eq!(recorder.count(&Seen::Lock), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_lock_falls_back_to_logout() {
        let recorder = Recorder::new(LockTrigger::Refused);
        let monitor = monitor(&recorder);
        monitor.start();

        sleep(Duration::from_millis(30_500)).await;
        assert_eq!(recorder.count(&Seen::Lock), 2);
        assert_eq!(recorder.count(&Seen::Logout), 1);
        assert!(recorder.seen().contains(&Seen::LogoutWarning(3)));

        sleep(Duration::from_secs(120)).await;
        assert_eq!(recorder.count(&Seen::Logout), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_cancels_warning() {
        let recorder = Recorder::new(LockTrigger::Engaged);
        let monitor = monitor(&recorder);
        monitor.start();

        sleep(Duration::from_millis(8_500)).await;
        assert_eq!(recorder.seen(), vec![Seen::LockWarning(3), Seen::LockWarning(2)]);

        monitor.record_activity();
        sleep(Duration::from_secs(4)).await;
        assert_eq!(
            recorder.seen(),
            vec![Seen::LockWarning(3), Seen::LockWarning(2), Seen::Cleared]
        );
        assert!(!monitor.is_suspended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_working_resets_immediately() {
        let recorder = Recorder::new(LockTrigger::Engaged);
        let monitor = monitor(&recorder);
        monitor.start();

        sleep(Duration::from_millis(7_500)).await;
        monitor.continue_working().await;
        assert_eq!(recorder.seen(), vec![Seen::LockWarning(3), Seen::Cleared]);
        assert_eq!(monitor.time_until_lock(), Some(Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_bursts_are_coalesced() {
        let recorder = Recorder::new(LockTrigger::Engaged);
        let monitor = monitor(&recorder);
        monitor.start();
        let baseline = monitor.activity_resets();

        for _ in 0..500 {
            monitor.record_activity();
        }
        sleep(Duration::from_millis(1_500)).await;
        assert_eq!(monitor.activity_resets(), baseline + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_while_locked_is_ignored_and_resume_restarts_clock() {
        let recorder = Recorder::new(LockTrigger::Engaged);
        let monitor = monitor(&recorder);
        monitor.start();

        sleep(Duration::from_millis(10_500)).await;
        assert!(monitor.is_suspended());
        let resets = monitor.activity_resets();

        monitor.record_activity();
        sleep(Duration::from_secs(4)).await;
        assert_eq!(monitor.activity_resets(), resets);

        monitor.resume();
        assert_eq!(monitor.time_until_lock(), Some(Duration::from_secs(10)));
        assert_eq!(monitor.time_until_logout(), Some(Duration::from_secs(30)));

        sleep(Duration::from_secs(11)).await;
        assert_eq!(recorder.count(&Seen::Lock), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_deadlines() {
        let recorder = Recorder::new(LockTrigger::Engaged);
        let monitor = monitor(&recorder);
        monitor.start();
        assert!(monitor.is_running());

        monitor.stop();
        assert!(!monitor.is_running());
        sleep(Duration::from_secs(60)).await;
        assert!(recorder.seen().is_empty());
    }
}
