#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use async_trait::async_trait;
use reqguard_session::{
    CREDENTIALS_FILE_NAME, Console, ConsoleConfig, CONFIG_FILE_NAME, LOCK_STATE_FILE_NAME, LocalVerifier, LockOutcome,
    LoginOutcome, LogoutHandler, LogoutReason, UnlockOutcome,
};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Logouts(Mutex<Vec<LogoutReason>>);

#[async_trait]
impl LogoutHandler for Logouts {
    async fn on_logout(&self, reason: LogoutReason) {
        self.0.lock().unwrap().push(reason);
    }
}

fn enroll(dir: &Path, identity: &str, password: &str) {
    let params = argon2::Params::new(1024, 1, 1, None).unwrap();
    LocalVerifier::new(dir.join(CREDENTIALS_FILE_NAME))
        .with_params(params)
        .set_password(identity, password)
        .unwrap();
}

fn open(dir: &Path) -> (Console, Arc<Logouts>) {
    let logouts = Arc::new(Logouts::default());
    let console = Console::open(dir, Arc::clone(&logouts) as Arc<dyn LogoutHandler>).unwrap();
    (console, logouts)
}

#[tokio::test]
async fn lock_survives_restart_and_unlocks_with_password() {
    let dir = tempfile::tempdir().unwrap();
    enroll(dir.path(), "alice", "correct horse");

    {
        let (console, _) = open(dir.path());
        assert_eq!(console.login("alice", "correct horse").await, LoginOutcome::SignedIn);
        assert_eq!(console.lock_now().unwrap(), LockOutcome::Locked);
        assert!(matches!(
            console.unlock("battery staple").await.unwrap(),
            UnlockOutcome::Rejected { attempts_remaining: 4 }
        ));
    }
    assert!(dir.path().join(LOCK_STATE_FILE_NAME).exists());

    let (console, logouts) = open(dir.path());
    let state = console.lock_state();
    assert!(state.is_locked());
    assert_eq!(state.locked_identity(), Some("alice"));
    assert_eq!(state.failed_attempts(), 1);
    assert!(state.locked_at().is_some());

    assert_eq!(console.unlock("correct horse").await.unwrap(), UnlockOutcome::Unlocked);
    assert_eq!(console.session().identity().as_deref(), Some("alice"));
    assert!(logouts.0.lock().unwrap().is_empty());
    drop(console);

    let (console, _) = open(dir.path());
    assert!(!console.lock_state().is_locked());
}

#[tokio::test]
async fn attempt_count_carries_across_restarts_to_forced_logout() {
    let dir = tempfile::tempdir().unwrap();
    enroll(dir.path(), "alice", "correct horse");

    {
        let (console, _) = open(dir.path());
        console.login("alice", "correct horse").await;
        console.lock_now().unwrap();
        for _ in 0..4 {
            console.unlock("wrong").await.unwrap();
        }
        assert_eq!(console.lock_state().failed_attempts(), 4);
    }

    let (console, logouts) = open(dir.path());
    assert_eq!(console.lock_state().failed_attempts(), 4);
    assert_eq!(console.unlock("wrong").await.unwrap(), UnlockOutcome::ForcedLogout);
    assert_eq!(*logouts.0.lock().unwrap(), vec![LogoutReason::AttemptsExhausted]);
    assert!(!console.session().is_authenticated());
    drop(console);

    let (console, _) = open(dir.path());
    let state = console.lock_state();
    assert!(!state.is_locked());
    assert_eq!(state.failed_attempts(), 0);
    assert!(state.locked_identity().is_none());
}

#[tokio::test]
async fn lock_after_restart_uses_persisted_identity() {
    let dir = tempfile::tempdir().unwrap();
    enroll(dir.path(), "bob", "pw");

    {
        let (console, _) = open(dir.path());
        console.login("bob", "pw").await;
        console.lock_now().unwrap();
    }

    // No one is signed in, but the recorded lock still names bob.
    let (console, _) = open(dir.path());
    assert!(!console.session().is_authenticated());
    assert_eq!(console.lock_now().unwrap(), LockOutcome::AlreadyLocked);
    assert_eq!(console.lock_state().locked_identity(), Some("bob"));
}

#[tokio::test]
async fn lock_without_anyone_signed_in_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (console, _) = open(dir.path());
    assert_eq!(console.lock_now().unwrap(), LockOutcome::Refused);
    assert!(!console.lock_state().is_locked());
}

#[tokio::test]
async fn saved_config_is_honoured() {
    let dir = tempfile::tempdir().unwrap();
    enroll(dir.path(), "carol", "pw");

    let mut config = ConsoleConfig::default();
    config.lock.max_failed_attempts = 2;
    config.save(&dir.path().join(CONFIG_FILE_NAME)).unwrap();

    let (console, logouts) = open(dir.path());
    assert_eq!(console.config().lock.max_failed_attempts, 2);
    console.login("carol", "pw").await;
    console.lock_now().unwrap();

    console.unlock("x").await.unwrap();
    assert_eq!(console.unlock("x").await.unwrap(), UnlockOutcome::ForcedLogout);
    assert_eq!(logouts.0.lock().unwrap().len(), 1);
}
