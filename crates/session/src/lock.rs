use crate::config::LockConfig;
use crate::monitor::lock_ignoring_poison;
use crate::session::Session;
use crate::store::LockStore;
use crate::verifier::{CredentialVerifier, Verified, VerifyError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use reqguard_countdown::{Clock, SystemClock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 5;

const EVENT_CAPACITY: usize = 64;

/// The authentication gate. Only [`SessionLock`] creates or changes one.
///
/// Invariants: `failed_attempts` is zero while unlocked, and a locked state always
/// carries a non-empty identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockState {
    is_locked: bool,
    locked_identity: Option<String>,
    failed_attempts: u32,
    locked_at: Option<DateTime<Utc>>,
}

impl LockState {
    pub(crate) const fn locked(identity: String, failed_attempts: u32, locked_at: Option<DateTime<Utc>>) -> Self {
        Self {
            is_locked: true,
            locked_identity: Some(identity),
            failed_attempts,
            locked_at,
        }
    }

    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.is_locked
    }

    #[must_use]
    pub fn locked_identity(&self) -> Option<&str> {
        self.locked_identity.as_deref()
    }

    #[must_use]
    pub const fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    #[must_use]
    pub const fn locked_at(&self) -> Option<DateTime<Utc>> {
        self.locked_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    /// The user asked to sign out.
    Requested,
    /// Too many failed unlock attempts.
    AttemptsExhausted,
    /// The logout backstop expired without the screen being locked.
    IdleTimeout,
}

/// Published after every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    Locked { identity: String },
    Unlocked { identity: String },
    AttemptFailed { failed_attempts: u32, attempts_remaining: u32 },
    AttemptsReset,
    LoggedOut { reason: LogoutReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Locked,
    AlreadyLocked,
    /// No identity could be resolved; nothing changed.
    Refused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockOutcome {
    Unlocked,
    Rejected { attempts_remaining: u32 },
    /// The attempt ceiling was reached and the session was torn down.
    ForcedLogout,
    /// Locked without a captured identity; not counted as an attempt.
    ///
    /// [`LockState`] values built by [`SessionLock`] always carry an identity, so this
    /// only guards against a state that was never written by this crate.
    MissingIdentity,
    NotLocked,
    /// Another unlock attempt is still waiting for the verifier.
    Busy,
    /// The screen was logged out or locked again while the verifier was answering.
    /// Nothing was applied.
    Stale,
}

/// Side effect of a full logout, typically sending the user back to sign-in.
#[async_trait]
pub trait LogoutHandler: Send + Sync {
    async fn on_logout(&self, reason: LogoutReason);
}

/// Owns the lock state, its persisted mirror and every transition between them.
pub struct SessionLock {
    state: Mutex<LockState>,
    store: LockStore,
    session: Arc<Session>,
    verifier: Arc<dyn CredentialVerifier>,
    logout: Arc<dyn LogoutHandler>,
    events: broadcast::Sender<LockEvent>,
    unlocking: AtomicBool,
    /// Bumped under the state mutex whenever a new lock starts or the lock is torn down.
    generation: AtomicU64,
    max_failed_attempts: u32,
    clock: Arc<dyn Clock>,
}

impl SessionLock {
    #[must_use]
    pub fn new(
        config: &LockConfig,
        store: LockStore,
        session: Arc<Session>,
        verifier: Arc<dyn CredentialVerifier>,
        logout: Arc<dyn LogoutHandler>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(LockState::default()),
            store,
            session,
            verifier,
            logout,
            events,
            unlocking: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            max_failed_attempts: config.max_failed_attempts.max(1),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn guard(&self) -> MutexGuard<'_, LockState> {
        lock_ignoring_poison(&self.state)
    }

    fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn publish(&self, event: LockEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> LockState {
        self.guard().clone()
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.guard().is_locked
    }

    #[must_use]
    pub const fn max_failed_attempts(&self) -> u32 {
        self.max_failed_attempts
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Replaces the in-memory state with whatever the store recorded before a restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or cleaned up.
    pub fn restore(&self) -> Result<LockState> {
        let mut state = self.guard();
        let loaded = self.store.load_lock_state()?;
        if loaded.is_locked {
            info!(
                identity = loaded.locked_identity().unwrap_or_default(),
                attempts = loaded.failed_attempts,
                "Restored locked screen"
            );
        }
        *state = loaded.clone();
        self.bump_generation();
        Ok(loaded)
    }

    /// Locks the screen against the current identity.
    ///
    /// The identity comes from the signed-in session or, failing that, from a lock that
    /// is still on record from before a restart. Without either, the lock is refused.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written; the state is unchanged.
    pub fn lock(&self) -> Result<LockOutcome> {
        let mut state = self.guard();
        if state.is_locked {
            return Ok(LockOutcome::AlreadyLocked);
        }

        let identity = match self.session.identity() {
            Some(identity) => Some(identity),
            None => self.store.persisted_identity()?,
        };
        let Some(identity) = identity else {
            warn!("Refusing to lock: no identity to lock against");
            return Ok(LockOutcome::Refused);
        };

        let next = LockState::locked(identity.clone(), 0, Some(self.clock.now()));
        self.store.persist(&next)?;
        *state = next;
        self.bump_generation();
        drop(state);

        info!(identity = %identity, "Screen locked");
        self.publish(LockEvent::Locked { identity });
        Ok(LockOutcome::Locked)
    }

    /// Tries to unlock with `secret`.
    ///
    /// Any verifier failure counts as a failed attempt; reaching the ceiling logs the
    /// session out. Only one attempt can be outstanding at a time.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written. A failed write never unlocks.
    pub async fn unlock(&self, secret: &str) -> Result<UnlockOutcome> {
        let Some(_in_flight) = InFlight::acquire(&self.unlocking) else {
            debug!("Unlock already in progress");
            return Ok(UnlockOutcome::Busy);
        };

        let (identity, generation) = {
            let state = self.guard();
            if !state.is_locked {
                return Ok(UnlockOutcome::NotLocked);
            }
            match state.locked_identity.clone() {
                Some(identity) => (identity, self.current_generation()),
                None => {
                    warn!("Unlock attempted without a locked identity");
                    return Ok(UnlockOutcome::MissingIdentity);
                }
            }
        };

        match self.verifier.verify(&identity, secret).await {
            Ok(verified) if verified.identity == identity => self.complete_unlock(verified, generation),
            Ok(verified) => {
                warn!(expected = %identity, got = %verified.identity, "Verifier answered for another identity");
                self.record_failure(&VerifyError::Rejected, generation).await
            }
            Err(err) => self.record_failure(&err, generation).await,
        }
    }

    /// Checks, under the state mutex, that the lock an attempt started against is still
    /// the one in place.
    fn attempt_outcome_if_stale(&self, state: &LockState, generation: u64) -> Option<UnlockOutcome> {
        if !state.is_locked {
            return Some(UnlockOutcome::NotLocked);
        }
        if self.current_generation() != generation {
            warn!("Lock changed while the verifier was answering, discarding the attempt");
            return Some(UnlockOutcome::Stale);
        }
        None
    }

    fn complete_unlock(&self, verified: Verified, generation: u64) -> Result<UnlockOutcome> {
        {
            let mut state = self.guard();
            if let Some(outcome) = self.attempt_outcome_if_stale(&state, generation) {
                return Ok(outcome);
            }
            let next = LockState::default();
            self.store.persist(&next)?;
            *state = next;
        }
        self.session.establish(&verified.identity, &verified.token);

        info!(identity = %verified.identity, "Screen unlocked");
        self.publish(LockEvent::Unlocked {
            identity: verified.identity,
        });
        Ok(UnlockOutcome::Unlocked)
    }

    async fn record_failure(&self, err: &VerifyError, generation: u64) -> Result<UnlockOutcome> {
        let attempts = {
            let mut state = self.guard();
            if let Some(outcome) = self.attempt_outcome_if_stale(&state, generation) {
                return Ok(outcome);
            }
            let attempts = state.failed_attempts.saturating_add(1);
            if attempts < self.max_failed_attempts {
                let next = LockState {
                    failed_attempts: attempts,
                    ..state.clone()
                };
                self.store.persist(&next)?;
                *state = next;
            } else {
                self.clear_state(&mut state);
            }
            attempts
        };

        if attempts >= self.max_failed_attempts {
            warn!(attempts, "Failed attempt ceiling reached, forcing logout");
            self.finish_logout(LogoutReason::AttemptsExhausted).await;
            return Ok(UnlockOutcome::ForcedLogout);
        }

        let attempts_remaining = self.max_failed_attempts - attempts;
        warn!(attempts, attempts_remaining, reason = %err, "Unlock attempt failed");
        self.publish(LockEvent::AttemptFailed {
            failed_attempts: attempts,
            attempts_remaining,
        });
        Ok(UnlockOutcome::Rejected { attempts_remaining })
    }

    /// Clears the failed attempt counter of a locked screen. Returns `false` when there
    /// was nothing to clear.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn reset_attempts(&self) -> Result<bool> {
        {
            let mut state = self.guard();
            if !state.is_locked || state.failed_attempts == 0 {
                return Ok(false);
            }
            let next = LockState {
                failed_attempts: 0,
                ..state.clone()
            };
            self.store.persist(&next)?;
            *state = next;
        }
        info!("Failed attempt counter reset");
        self.publish(LockEvent::AttemptsReset);
        Ok(true)
    }

    /// Signs out: clears the session and every lock field, then runs the logout handler.
    pub async fn logout(&self, reason: LogoutReason) {
        self.teardown(reason).await;
    }

    async fn teardown(&self, reason: LogoutReason) {
        {
            let mut state = self.guard();
            self.clear_state(&mut state);
        }
        self.finish_logout(reason).await;
    }

    fn clear_state(&self, state: &mut LockState) {
        // Memory is cleared even when the store write fails.
        if let Err(e) = self.store.clear() {
            error!("Failed to clear persisted lock state: {e}");
        }
        *state = LockState::default();
        self.bump_generation();
    }

    async fn finish_logout(&self, reason: LogoutReason) {
        self.session.clear();

        info!(?reason, "Session logged out");
        self.publish(LockEvent::LoggedOut { reason });
        self.logout.on_logout(reason).await;
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    use super::*;
    use crate::store::{KeyValueStore, MemoryStore, Mutation, keys};
    use reqguard_countdown::RuntimeClock;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Accepts a single password and counts calls.
    struct FixedVerifier {
        password: &'static str,
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl FixedVerifier {
        fn new(password: &'static str) -> Arc<Self> {
            Arc::new(Self {
                password,
                calls: AtomicUsize::new(0),
                gate: None,
            })
        }

        fn gated(password: &'static str, gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                password,
                calls: AtomicUsize::new(0),
                gate: Some(gate),
            })
        }
    }

    #[async_trait]
    impl CredentialVerifier for FixedVerifier {
        async fn verify(&self, identity: &str, secret: &str) -> Result<Verified, VerifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if secret == self.password {
                Ok(Verified {
                    token: format!("token-{}", self.calls.load(Ordering::SeqCst)),
                    identity: identity.to_string(),
                })
            } else if secret == "offline" {
                Err(VerifyError::Unavailable("connection refused".into()))
            } else {
                Err(VerifyError::Rejected)
            }
        }
    }

    #[derive(Default)]
    struct CountingLogout {
        calls: Mutex<Vec<LogoutReason>>,
    }

    impl CountingLogout {
        fn reasons(&self) -> Vec<LogoutReason> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LogoutHandler for CountingLogout {
        async fn on_logout(&self, reason: LogoutReason) {
            self.calls.lock().unwrap().push(reason);
        }
    }

    struct Fixture {
        lock: Arc<SessionLock>,
        kv: Arc<MemoryStore>,
        session: Arc<Session>,
        logout: Arc<CountingLogout>,
        verifier: Arc<FixedVerifier>,
    }

    fn fixture_with(verifier: Arc<FixedVerifier>, kv: Arc<MemoryStore>) -> Fixture {
        let session = Arc::new(Session::new());
        let logout = Arc::new(CountingLogout::default());
        let lock = SessionLock::new(
            &LockConfig::default(),
            LockStore::new(Arc::clone(&kv) as Arc<dyn KeyValueStore>),
            Arc::clone(&session),
            Arc::clone(&verifier) as Arc<dyn CredentialVerifier>,
            Arc::clone(&logout) as Arc<dyn LogoutHandler>,
        );
        Fixture {
            lock: Arc::new(lock),
            kv,
            session,
            logout,
            verifier,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(FixedVerifier::new("hunter2"), Arc::new(MemoryStore::new()))
    }

    fn locked_fixture() -> Fixture {
        let f = fixture();
        f.session.establish("alice", "token-0");
        assert_eq!(f.lock.lock().unwrap(), LockOutcome::Locked);
        f
    }

    fn stored(kv: &MemoryStore, key: &str) -> Option<String> {
        kv.entries().get(key).cloned()
    }

    #[test]
    fn test_lock_captures_session_identity_and_persists() {
        let f = locked_fixture();
        let state = f.lock.state();
        assert!(state.is_locked());
        assert_eq!(state.locked_identity(), Some("alice"));
        assert_eq!(state.failed_attempts(), 0);
        assert!(state.locked_at().is_some());

        assert_eq!(stored(&f.kv, keys::SCREEN_LOCKED).as_deref(), Some("true"));
        assert_eq!(stored(&f.kv, keys::LOCKED_IDENTITY).as_deref(), Some("alice"));
        assert!(stored(&f.kv, keys::LOCKED_AT).is_some());
        assert!(stored(&f.kv, keys::FAILED_ATTEMPTS).is_none());

        assert_eq!(f.lock.lock().unwrap(), LockOutcome::AlreadyLocked);
    }

    #[test]
    fn test_lock_without_identity_is_refused() {
        let f = fixture();
        assert_eq!(f.lock.lock().unwrap(), LockOutcome::Refused);
        assert!(!f.lock.state().is_locked());
        assert!(f.kv.entries().is_empty());
    }

    #[test]
    fn test_lock_falls_back_to_persisted_identity() {
        let kv = Arc::new(MemoryStore::new());
        kv.apply(&[Mutation::Set(keys::LOCKED_IDENTITY, "bob".into())]).unwrap();
        let f = fixture_with(FixedVerifier::new("pw"), kv);

        assert_eq!(f.lock.lock().unwrap(), LockOutcome::Locked);
        assert_eq!(f.lock.state().locked_identity(), Some("bob"));
    }

    #[tokio::test]
    async fn test_successful_unlock_clears_state_and_renews_session() {
        let f = locked_fixture();
        let mut events = f.lock.subscribe();

        assert_eq!(
            f.lock.unlock("wrong").await.unwrap(),
            UnlockOutcome::Rejected { attempts_remaining: 4 }
        );
        assert_eq!(f.lock.unlock("hunter2").await.unwrap(), UnlockOutcome::Unlocked);

        assert_eq!(f.lock.state(), LockState::default());
        assert!(f.kv.entries().is_empty());
        assert_eq!(f.session.identity().as_deref(), Some("alice"));
        assert_eq!(f.session.token().as_deref(), Some("token-2"));

        assert_eq!(
            events.recv().await.unwrap(),
            LockEvent::AttemptFailed {
                failed_attempts: 1,
                attempts_remaining: 4
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            LockEvent::Unlocked {
                identity: "alice".into()
            }
        );
    }

    #[tokio::test]
    async fn test_failed_attempts_are_monotone_and_persisted() {
        let f = locked_fixture();
        for expected in 1..=4u32 {
            let outcome = f.lock.unlock("nope").await.unwrap();
            assert_eq!(
                outcome,
                UnlockOutcome::Rejected {
                    attempts_remaining: 5 - expected
                }
            );
            assert_eq!(f.lock.state().failed_attempts(), expected);
            assert_eq!(stored(&f.kv, keys::FAILED_ATTEMPTS), Some(expected.to_string()));
        }
        assert!(f.logout.reasons().is_empty());
    }

    #[tokio::test]
    async fn test_fifth_failure_forces_logout_exactly_once() {
        let f = locked_fixture();
        for _ in 0..4 {
            f.lock.unlock("nope").await.unwrap();
        }
        assert_eq!(f.lock.state().failed_attempts(), 4);
        assert!(f.logout.reasons().is_empty());

        assert_eq!(f.lock.unlock("nope").await.unwrap(), UnlockOutcome::ForcedLogout);

        let state = f.lock.state();
        assert!(!state.is_locked());
        assert_eq!(state.failed_attempts(), 0);
        assert!(state.locked_identity().is_none());
        assert!(f.kv.entries().is_empty());
        assert!(!f.session.is_authenticated());
        assert_eq!(f.logout.reasons(), vec![LogoutReason::AttemptsExhausted]);

        // Nothing left to unlock.
        assert_eq!(f.lock.unlock("hunter2").await.unwrap(), UnlockOutcome::NotLocked);
        assert_eq!(f.logout.reasons().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_counts_like_rejection() {
        let f = locked_fixture();
        assert_eq!(
            f.lock.unlock("offline").await.unwrap(),
            UnlockOutcome::Rejected { attempts_remaining: 4 }
        );
        assert_eq!(f.lock.state().failed_attempts(), 1);
    }

    #[tokio::test]
    async fn test_unlock_when_not_locked() {
        let f = fixture();
        assert_eq!(f.lock.unlock("hunter2").await.unwrap(), UnlockOutcome::NotLocked);
        assert_eq!(f.verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reset_attempts() {
        let f = locked_fixture();
        f.lock.unlock("nope").await.unwrap();
        f.lock.unlock("nope").await.unwrap();

        assert!(f.lock.reset_attempts().unwrap());
        assert_eq!(f.lock.state().failed_attempts(), 0);
        assert!(f.lock.state().is_locked());
        assert!(stored(&f.kv, keys::FAILED_ATTEMPTS).is_none());
        assert_eq!(stored(&f.kv, keys::LOCKED_IDENTITY).as_deref(), Some("alice"));

        assert!(!f.lock.reset_attempts().unwrap());
    }

    #[test]
    fn test_reset_attempts_when_unlocked_changes_nothing() {
        let f = fixture();
        assert!(!f.lock.reset_attempts().unwrap());
        assert!(f.kv.entries().is_empty());
    }

    #[tokio::test]
    async fn test_restore_then_continue_counting() {
        let kv = Arc::new(MemoryStore::new());
        kv.apply(&[
            Mutation::Set(keys::SCREEN_LOCKED, "true".into()),
            Mutation::Set(keys::LOCKED_IDENTITY, "alice".into()),
            Mutation::Set(keys::FAILED_ATTEMPTS, "4".into()),
        ])
        .unwrap();
        let f = fixture_with(FixedVerifier::new("hunter2"), kv);

        let restored = f.lock.restore().unwrap();
        assert!(restored.is_locked());
        assert_eq!(restored.failed_attempts(), 4);

        assert_eq!(f.lock.unlock("nope").await.unwrap(), UnlockOutcome::ForcedLogout);
        assert_eq!(f.logout.reasons(), vec![LogoutReason::AttemptsExhausted]);
        assert!(f.kv.entries().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_unlock_is_rejected_while_pending() {
        let gate = Arc::new(Notify::new());
        let f = fixture_with(
            FixedVerifier::gated("hunter2", Arc::clone(&gate)),
            Arc::new(MemoryStore::new()),
        );
        f.session.establish("alice", "token-0");
        f.lock.lock().unwrap();

        let lock = Arc::clone(&f.lock);
        let first = tokio::spawn(async move { lock.unlock("hunter2").await });
        while f.verifier.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(f.lock.unlock("hunter2").await.unwrap(), UnlockOutcome::Busy);
        assert_eq!(f.verifier.calls.load(Ordering::SeqCst), 1);

        gate.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), UnlockOutcome::Unlocked);
        assert_eq!(f.lock.unlock("hunter2").await.unwrap(), UnlockOutcome::NotLocked);
    }

    /// Starts a gated unlock for alice, then relocks the screen for bob before the
    /// verifier answers.
    async fn relocked_for_bob_while_verifying(secret: &'static str) -> (Fixture, UnlockOutcome) {
        let gate = Arc::new(Notify::new());
        let f = fixture_with(
            FixedVerifier::gated("hunter2", Arc::clone(&gate)),
            Arc::new(MemoryStore::new()),
        );
        f.session.establish("alice", "token-0");
        f.lock.lock().unwrap();

        let lock = Arc::clone(&f.lock);
        let pending = tokio::spawn(async move { lock.unlock(secret).await });
        while f.verifier.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        f.lock.logout(LogoutReason::Requested).await;
        f.session.establish("bob", "token-bob");
        assert_eq!(f.lock.lock().unwrap(), LockOutcome::Locked);

        gate.notify_one();
        let outcome = pending.await.unwrap().unwrap();
        (f, outcome)
    }

    #[tokio::test]
    async fn test_late_acceptance_does_not_unlock_a_newer_lock() {
        let (f, outcome) = relocked_for_bob_while_verifying("hunter2").await;

        assert_eq!(outcome, UnlockOutcome::Stale);
        let state = f.lock.state();
        assert!(state.is_locked());
        assert_eq!(state.locked_identity(), Some("bob"));
        assert_eq!(state.failed_attempts(), 0);
        assert_eq!(f.session.identity().as_deref(), Some("bob"));
        assert_eq!(f.session.token().as_deref(), Some("token-bob"));
        assert_eq!(stored(&f.kv, keys::LOCKED_IDENTITY).as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_late_rejection_is_not_counted_against_a_newer_lock() {
        let (f, outcome) = relocked_for_bob_while_verifying("nope").await;

        assert_eq!(outcome, UnlockOutcome::Stale);
        assert_eq!(f.lock.state().failed_attempts(), 0);
        assert!(stored(&f.kv, keys::FAILED_ATTEMPTS).is_none());
        assert_eq!(f.logout.reasons(), vec![LogoutReason::Requested]);
    }

    #[tokio::test]
    async fn test_late_answer_after_logout_is_not_locked() {
        let gate = Arc::new(Notify::new());
        let f = fixture_with(
            FixedVerifier::gated("hunter2", Arc::clone(&gate)),
            Arc::new(MemoryStore::new()),
        );
        f.session.establish("alice", "token-0");
        f.lock.lock().unwrap();

        let lock = Arc::clone(&f.lock);
        let pending = tokio::spawn(async move { lock.unlock("hunter2").await });
        while f.verifier.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        f.lock.logout(LogoutReason::Requested).await;

        gate.notify_one();
        assert_eq!(pending.await.unwrap().unwrap(), UnlockOutcome::NotLocked);
        assert_eq!(f.lock.state(), LockState::default());
        assert!(!f.session.is_authenticated());
    }

    #[tokio::test]
    async fn test_lock_without_captured_identity_is_not_counted() {
        let f = fixture();
        *f.lock.state.lock().unwrap() = LockState {
            is_locked: true,
            locked_identity: None,
            failed_attempts: 0,
            locked_at: None,
        };

        assert_eq!(f.lock.unlock("hunter2").await.unwrap(), UnlockOutcome::MissingIdentity);
        assert_eq!(f.verifier.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.lock.state().failed_attempts(), 0);
        assert!(f.logout.reasons().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_time_comes_from_the_clock() {
        let origin = DateTime::parse_from_rfc3339("2025-01-15T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let kv = Arc::new(MemoryStore::new());
        let session = Arc::new(Session::new());
        let lock = SessionLock::new(
            &LockConfig::default(),
            LockStore::new(Arc::clone(&kv) as Arc<dyn KeyValueStore>),
            Arc::clone(&session),
            FixedVerifier::new("hunter2"),
            Arc::new(CountingLogout::default()),
        )
        .with_clock(Arc::new(RuntimeClock::starting_at(origin)));

        session.establish("alice", "token-0");
        lock.lock().unwrap();
        assert_eq!(lock.state().locked_at(), Some(origin));
        assert_eq!(stored(&kv, keys::LOCKED_AT).as_deref(), Some("2025-01-15T10:00:00Z"));
    }

    #[tokio::test]
    async fn test_explicit_logout_clears_everything() {
        let f = locked_fixture();
        f.lock.unlock("nope").await.unwrap();
        let mut events = f.lock.subscribe();

        f.lock.logout(LogoutReason::Requested).await;
        assert_eq!(f.lock.state(), LockState::default());
        assert!(f.kv.entries().is_empty());
        assert!(!f.session.is_authenticated());
        assert_eq!(f.logout.reasons(), vec![LogoutReason::Requested]);
        assert_eq!(
            events.recv().await.unwrap(),
            LockEvent::LoggedOut {
                reason: LogoutReason::Requested
            }
        );
    }

    #[tokio::test]
    async fn test_verifier_answering_for_someone_else_is_a_failure() {
        struct Impostor;

        #[async_trait]
        impl CredentialVerifier for Impostor {
            async fn verify(&self, _identity: &str, _secret: &str) -> Result<Verified, VerifyError> {
                Ok(Verified {
                    token: "t".into(),
                    identity: "mallory".into(),
                })
            }
        }

        let session = Arc::new(Session::new());
        session.establish("alice", "token-0");
        let lock = SessionLock::new(
            &LockConfig::default(),
            LockStore::new(Arc::new(MemoryStore::new())),
            Arc::clone(&session),
            Arc::new(Impostor),
            Arc::new(CountingLogout::default()),
        );
        lock.lock().unwrap();

        assert_eq!(
            lock.unlock("anything").await.unwrap(),
            UnlockOutcome::Rejected { attempts_remaining: 4 }
        );
        assert!(lock.is_locked());
    }

    #[tokio::test]
    async fn test_custom_ceiling() {
        let session = Arc::new(Session::new());
        session.establish("alice", "token-0");
        let logout = Arc::new(CountingLogout::default());
        let lock = SessionLock::new(
            &LockConfig { max_failed_attempts: 2 },
            LockStore::new(Arc::new(MemoryStore::new())),
            Arc::clone(&session),
            FixedVerifier::new("pw"),
            Arc::clone(&logout) as Arc<dyn LogoutHandler>,
        );
        lock.lock().unwrap();

        assert_eq!(
            lock.unlock("x").await.unwrap(),
            UnlockOutcome::Rejected { attempts_remaining: 1 }
        );
        assert_eq!(lock.unlock("x").await.unwrap(), UnlockOutcome::ForcedLogout);
        assert_eq!(logout.reasons().len(), 1);
    }
}
