use crate::session::{open_console, report_unlock};
use crate::utils::{prompt_secret, prompt_secret_async};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use reqguard_session::{Console, LockEvent, LoginOutcome, Notice, UnlockOutcome};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const LOGIN_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Input {
    Activity,
    Continue,
    Lock,
    Quit,
}

fn classify(key: &KeyEvent) -> Input {
    if key.modifiers.contains(KeyModifiers::CONTROL) && matches!(key.code, KeyCode::Char('c' | 'd')) {
        return Input::Quit;
    }
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => Input::Quit,
        KeyCode::Char('l') => Input::Lock,
        KeyCode::Char('c') | KeyCode::Enter => Input::Continue,
        _ => Input::Activity,
    }
}

/// Terminal reader on a blocking thread. `paused` hands the terminal over to password prompts.
fn spawn_reader(tx: mpsc::UnboundedSender<Input>, paused: Arc<AtomicBool>, done: Arc<AtomicBool>) {
    tokio::task::spawn_blocking(move || {
        while !done.load(Ordering::Acquire) && !tx.is_closed() {
            if paused.load(Ordering::Acquire) {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
            match event::poll(POLL_INTERVAL) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!("Terminal poll failed: {e}");
                    break;
                }
            }
            let input = match event::read() {
                Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => classify(&key),
                Ok(Event::Mouse(_) | Event::Resize(..) | Event::Paste(_)) => Input::Activity,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Terminal read failed: {e}");
                    break;
                }
            };
            if tx.send(input).is_err() {
                break;
            }
        }
    });
}

/// Raw mode for the lifetime of the guard.
struct RawMode;

impl RawMode {
    fn enable() -> Result<Self> {
        terminal::enable_raw_mode()?;
        crossterm::execute!(std::io::stdout(), crossterm::event::EnableMouseCapture)?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = crossterm::execute!(std::io::stdout(), crossterm::event::DisableMouseCapture);
        let _ = terminal::disable_raw_mode();
    }
}

fn status_line(text: &str) {
    let mut stdout = std::io::stdout();
    let _ = write!(stdout, "\r\x1b[2K{text}");
    let _ = stdout.flush();
}

async fn sign_in(console: &Console, user: &str) -> Result<()> {
    for _ in 0..LOGIN_ATTEMPTS {
        let secret = prompt_secret(&format!("Password for {user}: "))?;
        match console.login(user, &secret).await {
            LoginOutcome::SignedIn => return Ok(()),
            LoginOutcome::Rejected => eprintln!("❌ Invalid credentials"),
            LoginOutcome::ScreenLocked => {
                return Err(eyre!("The screen is locked. Run `reqguard unlock` first."));
            }
        }
    }
    Err(eyre!("Too many failed sign-in attempts"))
}

/// Keeps prompting until the screen unlocks. Returns `false` when the session ended instead.
async fn unlock_loop(console: &Console) -> Result<bool> {
    loop {
        let secret = prompt_secret_async("🔒 Screen locked. Password: ").await?;
        match console.unlock(&secret).await? {
            UnlockOutcome::Unlocked | UnlockOutcome::NotLocked => return Ok(true),
            UnlockOutcome::Rejected { attempts_remaining } => {
                eprintln!("❌ Wrong password, {attempts_remaining} attempt(s) left");
            }
            UnlockOutcome::Busy => debug!("Unlock already pending"),
            UnlockOutcome::Stale => eprintln!("⚠️  The screen was locked again, enter the password once more"),
            outcome @ (UnlockOutcome::ForcedLogout | UnlockOutcome::MissingIdentity) => {
                if let Err(e) = report_unlock(outcome) {
                    eprintln!("❌ {e}");
                }
                return Ok(false);
            }
        }
    }
}

/// Interactive session: signs in, then feeds every key press and mouse event to the
/// activity monitor while showing lock and logout warnings.
pub async fn handle_idle_command(data_dir: &Path, user: &str) -> Result<()> {
    let console = open_console(data_dir)?;
    sign_in(&console, user).await?;

    let mut notices = console.notices();
    console.start();

    let (tx, mut inputs) = mpsc::unbounded_channel();
    let paused = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));
    spawn_reader(tx, Arc::clone(&paused), Arc::clone(&done));

    println!("✅ Signed in as {user}. Keys: [c] continue working, [l] lock, [q] quit");
    let mut raw = Some(RawMode::enable()?);

    let result = loop {
        tokio::select! {
            input = inputs.recv() => match input {
                Some(Input::Quit) | None => break Ok(()),
                Some(Input::Lock) => {
                    if let Err(e) = console.lock_now() {
                        break Err(e);
                    }
                }
                Some(Input::Continue) => console.continue_working().await,
                Some(Input::Activity) => console.record_activity(),
            },
            notice = notices.recv() => match notice {
                Ok(Notice::LockWarning { remaining_secs }) => {
                    status_line(&format!("⏳ Locking in {remaining_secs}s, press [c] to continue working"));
                }
                Ok(Notice::LogoutWarning { remaining_secs }) => {
                    status_line(&format!("⚠️  Signing out in {remaining_secs}s, press [c] to continue working"));
                }
                Ok(Notice::WarningCleared) => status_line(""),
                Ok(Notice::Lock(LockEvent::Locked { .. })) => {
                    paused.store(true, Ordering::Release);
                    raw = None;
                    status_line("");
                    let unlocked = unlock_loop(&console).await;
                    match unlocked {
                        Ok(true) => match RawMode::enable() {
                            Ok(mode) => {
                                raw = Some(mode);
                                paused.store(false, Ordering::Release);
                                status_line("🔓 Welcome back");
                            }
                            Err(e) => break Err(e),
                        },
                        Ok(false) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                Ok(Notice::Lock(LockEvent::LoggedOut { .. })) => break Ok(()),
                Ok(Notice::Lock(_)) => {}
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Notices lagged"),
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    done.store(true, Ordering::Release);
    drop(raw);
    println!();
    console.stop();
    result
}
