use crate::config::{CONFIG_FILE_NAME, ConsoleConfig};
use crate::lock::{LockEvent, LockOutcome, LockState, LogoutHandler, LogoutReason, SessionLock, UnlockOutcome};
use crate::monitor::{ActivityHandler, ActivityMonitor, LockTrigger, lock_ignoring_poison};
use crate::session::Session;
use crate::store::{KeyValueStore, LockStore, SqliteStore};
use crate::verifier::{CREDENTIALS_FILE_NAME, CredentialVerifier, LocalVerifier, VerifyError};
use async_trait::async_trait;
use color_eyre::Result;
use reqguard_countdown::{Clock, CountdownEngine, CountdownInput, SystemClock};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const LOCK_STATE_FILE_NAME: &str = "lock_state.sqlite3";

const NOTICE_CAPACITY: usize = 128;

/// Everything a front end needs to render: inactivity warnings and lock transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    LockWarning { remaining_secs: u64 },
    LogoutWarning { remaining_secs: u64 },
    WarningCleared,
    Lock(LockEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    SignedIn,
    Rejected,
    /// The screen is locked; it has to be unlocked instead.
    ScreenLocked,
}

/// Connects the activity monitor's triggers to the lock state machine.
struct LockBridge {
    lock: Arc<SessionLock>,
    notices: broadcast::Sender<Notice>,
}

impl LockBridge {
    fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }
}

#[async_trait]
impl ActivityHandler for LockBridge {
    async fn on_lock_warning(&self, remaining_secs: u64) {
        self.notify(Notice::LockWarning { remaining_secs });
    }

    async fn on_logout_warning(&self, remaining_secs: u64) {
        self.notify(Notice::LogoutWarning { remaining_secs });
    }

    async fn on_warning_cleared(&self) {
        self.notify(Notice::WarningCleared);
    }

    async fn on_lock(&self) -> LockTrigger {
        match self.lock.lock() {
            Ok(LockOutcome::Locked | LockOutcome::AlreadyLocked) => LockTrigger::Engaged,
            Ok(LockOutcome::Refused) => LockTrigger::Refused,
            Err(e) => {
                error!("Auto-lock failed: {e}");
                LockTrigger::Refused
            }
        }
    }

    async fn on_logout(&self) {
        self.lock.logout(LogoutReason::IdleTimeout).await;
    }
}

/// Application root: owns the session, the lock state machine and the activity monitor.
pub struct Console {
    config: ConsoleConfig,
    session: Arc<Session>,
    lock: Arc<SessionLock>,
    verifier: Arc<dyn CredentialVerifier>,
    monitor: Arc<ActivityMonitor>,
    notices: broadcast::Sender<Notice>,
    follower: Mutex<Option<JoinHandle<()>>>,
    clock: Arc<dyn Clock>,
}

impl Console {
    /// Wires the components together and restores any lock left by a previous run.
    ///
    /// The monitor starts suspended; it runs once someone signs in or unlocks.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the lock state cannot be loaded.
    pub fn new(
        config: ConsoleConfig,
        kv: Arc<dyn KeyValueStore>,
        verifier: Arc<dyn CredentialVerifier>,
        logout: Arc<dyn LogoutHandler>,
    ) -> Result<Self> {
        config.validate()?;

        let session = Arc::new(Session::new());
        let lock = Arc::new(SessionLock::new(
            &config.lock,
            LockStore::new(kv),
            Arc::clone(&session),
            Arc::clone(&verifier),
            logout,
        ));
        let restored = lock.restore()?;

        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let bridge = Arc::new(LockBridge {
            lock: Arc::clone(&lock),
            notices: notices.clone(),
        });
        let monitor = Arc::new(ActivityMonitor::new(config.activity.clone(), bridge)?);
        monitor.suspend();

        debug!(locked = restored.is_locked(), "Console ready");
        Ok(Self {
            config,
            session,
            lock,
            verifier,
            monitor,
            notices,
            follower: Mutex::new(None),
            clock: Arc::new(SystemClock),
        })
    }

    /// Opens the console backed by the files in `data_dir`: configuration, SQLite lock
    /// state and local credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the files cannot be opened or parsed.
    pub fn open(data_dir: &Path, logout: Arc<dyn LogoutHandler>) -> Result<Self> {
        let config = ConsoleConfig::load_or_default(&data_dir.join(CONFIG_FILE_NAME))?;
        let store = SqliteStore::open(&data_dir.join(LOCK_STATE_FILE_NAME))?;
        let verifier = LocalVerifier::new(data_dir.join(CREDENTIALS_FILE_NAME));
        Self::new(config, Arc::new(store), Arc::new(verifier), logout)
    }

    /// Clock used by countdowns created through [`countdown`](Self::countdown).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    #[must_use]
    pub fn monitor(&self) -> &ActivityMonitor {
        &self.monitor
    }

    #[must_use]
    pub fn lock_state(&self) -> LockState {
        self.lock.state()
    }

    #[must_use]
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Starts the activity monitor and the lock event follower.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn start(&self) {
        let mut follower = lock_ignoring_poison(&self.follower);
        if follower.as_ref().is_none_or(JoinHandle::is_finished) {
            *follower = Some(tokio::spawn(follow(
                self.lock.subscribe(),
                Arc::clone(&self.lock),
                Arc::clone(&self.monitor),
                self.notices.clone(),
            )));
        }
        drop(follower);
        self.monitor.start();
        info!("Console started");
    }

    pub fn stop(&self) {
        if let Some(handle) = lock_ignoring_poison(&self.follower).take() {
            handle.abort();
        }
        self.monitor.stop();
    }

    /// Signs `identity` in and arms the inactivity deadlines.
    pub async fn login(&self, identity: &str, secret: &str) -> LoginOutcome {
        if self.lock.is_locked() {
            warn!(identity, "Login refused while the screen is locked");
            return LoginOutcome::ScreenLocked;
        }
        match self.verifier.verify(identity, secret).await {
            Ok(verified) => {
                self.session.establish(&verified.identity, &verified.token);
                self.monitor.resume();
                LoginOutcome::SignedIn
            }
            Err(VerifyError::Rejected) => {
                warn!(identity, "Login rejected");
                LoginOutcome::Rejected
            }
            Err(e) => {
                warn!(identity, "Login failed: {e}");
                LoginOutcome::Rejected
            }
        }
    }

    pub fn record_activity(&self) {
        self.monitor.record_activity();
    }

    pub async fn continue_working(&self) {
        self.monitor.continue_working().await;
    }

    /// Locks the screen immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be persisted.
    pub fn lock_now(&self) -> Result<LockOutcome> {
        self.lock.lock()
    }

    /// # Errors
    ///
    /// Returns an error if the lock state cannot be persisted.
    pub async fn unlock(&self, secret: &str) -> Result<UnlockOutcome> {
        self.lock.unlock(secret).await
    }

    /// # Errors
    ///
    /// Returns an error if the lock state cannot be persisted.
    pub fn reset_attempts(&self) -> Result<bool> {
        self.lock.reset_attempts()
    }

    pub async fn logout(&self) {
        self.lock.logout(LogoutReason::Requested).await;
    }

    /// Starts a countdown for a request, using the configured active statuses.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    #[must_use]
    pub fn countdown(&self, input: CountdownInput) -> CountdownEngine {
        CountdownEngine::start(self.config.countdown.clone(), input, Arc::clone(&self.clock))
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn follow(
    mut events: broadcast::Receiver<LockEvent>,
    lock: Arc<SessionLock>,
    monitor: Arc<ActivityMonitor>,
    notices: broadcast::Sender<Notice>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                match &event {
                    LockEvent::Locked { .. } | LockEvent::LoggedOut { .. } => monitor.suspend(),
                    LockEvent::Unlocked { .. } => monitor.resume(),
                    LockEvent::AttemptFailed { .. } | LockEvent::AttemptsReset => {}
                }
                let _ = notices.send(Notice::Lock(event));
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Lock events lagged, resynchronising");
                if lock.is_locked() || !lock.session().is_authenticated() {
                    monitor.suspend();
                } else if monitor.is_suspended() {
                    monitor.resume();
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}
