use crate::utils::{prompt_secret, prompt_secret_async};
use async_trait::async_trait;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use reqguard_session::{
    CREDENTIALS_FILE_NAME, Console, LocalVerifier, LockOutcome, LockState, LoginOutcome, LogoutHandler, LogoutReason,
    UnlockOutcome,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Sends the user back to the sign-in entry point.
pub struct TerminalLogout;

#[async_trait]
impl LogoutHandler for TerminalLogout {
    async fn on_logout(&self, reason: LogoutReason) {
        let why = match reason {
            LogoutReason::Requested => "signed out",
            LogoutReason::AttemptsExhausted => "too many failed unlock attempts",
            LogoutReason::IdleTimeout => "inactive for too long",
        };
        eprintln!("🚪 Session ended ({why}). Sign in again with `reqguard idle --user <name>`.");
    }
}

pub fn open_console(data_dir: &Path) -> Result<Console> {
    Console::open(data_dir, Arc::new(TerminalLogout))
}

pub fn describe_state(state: &LockState, max_failed_attempts: u32) -> String {
    if !state.is_locked() {
        return "🔓 Unlocked".to_string();
    }
    let mut text = format!("🔒 Locked for {}", state.locked_identity().unwrap_or("<unknown>"));
    if let Some(at) = state.locked_at() {
        text.push_str(&format!(" since {}", at.format("%Y-%m-%d %H:%M:%S UTC")));
    }
    if state.failed_attempts() > 0 {
        text.push_str(&format!(
            "\n   Failed unlock attempts: {}/{}",
            state.failed_attempts(),
            max_failed_attempts
        ));
    }
    text
}

pub fn handle_status_command(data_dir: &Path) -> Result<()> {
    let console = open_console(data_dir)?;
    println!(
        "{}",
        describe_state(&console.lock_state(), console.config().lock.max_failed_attempts)
    );
    Ok(())
}

pub async fn handle_lock_command(data_dir: &Path, user: Option<String>) -> Result<()> {
    let console = open_console(data_dir)?;

    if let Some(user) = user {
        if !console.lock_state().is_locked() {
            let secret = prompt_secret(&format!("Password for {user}: "))?;
            if console.login(&user, &secret).await == LoginOutcome::Rejected {
                return Err(eyre!("Invalid credentials for {user}"));
            }
        }
    }

    match console.lock_now()? {
        LockOutcome::Locked => println!("🔒 Screen locked"),
        LockOutcome::AlreadyLocked => println!("🔒 Screen is already locked"),
        LockOutcome::Refused => {
            return Err(eyre!("Nobody to lock the screen for. Pass --user <name>."));
        }
    }
    Ok(())
}

pub async fn handle_unlock_command(data_dir: &Path) -> Result<()> {
    let console = open_console(data_dir)?;
    if !console.lock_state().is_locked() {
        println!("🔓 Screen is not locked");
        return Ok(());
    }

    let secret = prompt_secret_async("Password: ").await?;
    report_unlock(console.unlock(&secret).await?)
}

pub fn report_unlock(outcome: UnlockOutcome) -> Result<()> {
    match outcome {
        UnlockOutcome::Unlocked => {
            println!("🔓 Unlocked");
            Ok(())
        }
        UnlockOutcome::Rejected { attempts_remaining } => Err(eyre!(
            "Wrong password. {attempts_remaining} attempt(s) left before you are signed out."
        )),
        UnlockOutcome::ForcedLogout => Err(eyre!("Too many failed attempts. You have been signed out.")),
        UnlockOutcome::MissingIdentity => Err(eyre!("The lock has no identity to unlock")),
        UnlockOutcome::NotLocked => {
            println!("🔓 Screen is not locked");
            Ok(())
        }
        UnlockOutcome::Busy => Err(eyre!("Another unlock attempt is in progress")),
        UnlockOutcome::Stale => Err(eyre!("The screen was locked again while checking the password. Try again.")),
    }
}

pub fn handle_reset_attempts_command(data_dir: &Path) -> Result<()> {
    let console = open_console(data_dir)?;
    if console.reset_attempts()? {
        println!("✅ Failed attempt counter cleared");
    } else {
        println!("Nothing to reset: no failed unlock attempts on record");
    }
    Ok(())
}

pub async fn handle_logout_command(data_dir: &Path) -> Result<()> {
    let console = open_console(data_dir)?;
    console.logout().await;
    Ok(())
}

pub fn handle_passwd_command(data_dir: &Path, user: &str) -> Result<()> {
    let verifier = LocalVerifier::new(data_dir.join(CREDENTIALS_FILE_NAME));
    let existing = verifier.has_user(user)?;

    let secret = prompt_secret(&format!("New password for {user}: "))?;
    if secret.is_empty() {
        return Err(eyre!("Password cannot be empty"));
    }
    let confirm = prompt_secret("Confirm password: ")?;
    if *secret != *confirm {
        return Err(eyre!("Passwords do not match"));
    }

    verifier.set_password(user, &secret)?;
    info!(user, "Password stored");
    if existing {
        println!("✅ Password updated for {user}");
    } else {
        println!("✅ User {user} enrolled");
    }
    Ok(())
}
