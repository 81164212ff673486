use crate::clock::Clock;
use crate::deadline::{CountdownInput, CountdownPolicy, CountdownView, evaluate};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace};

/// Sampling period while the deadline is still ahead.
pub const ACTIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Sampling period once the item is overdue; minute precision is enough there.
pub const OVERDUE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Nothing to count down: status not active or no duration.
    Inactive,
    Active,
    Overdue,
}

impl Mode {
    #[must_use]
    pub const fn of(view: &CountdownView) -> Self {
        if !view.is_counting_down {
            Self::Inactive
        } else if view.is_overdue {
            Self::Overdue
        } else {
            Self::Active
        }
    }

    /// Time until the next sample, `None` when the engine should only wake on input changes.
    #[must_use]
    pub const fn interval(self) -> Option<Duration> {
        match self {
            Self::Inactive => None,
            Self::Active => Some(ACTIVE_INTERVAL),
            Self::Overdue => Some(OVERDUE_INTERVAL),
        }
    }
}

#[derive(Debug, Clone)]
struct Settings {
    policy: CountdownPolicy,
    input: CountdownInput,
}

/// Live countdown for a single business item.
///
/// A background task resamples the clock on an adaptive cadence and publishes a fresh
/// [`CountdownView`] to subscribers. Dropping the engine cancels the task.
pub struct CountdownEngine {
    settings: watch::Sender<Settings>,
    view: watch::Receiver<CountdownView>,
    samples: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl CountdownEngine {
    /// Starts sampling immediately.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime, like `tokio::spawn`.
    #[must_use]
    pub fn start(policy: CountdownPolicy, input: CountdownInput, clock: Arc<dyn Clock>) -> Self {
        let initial = evaluate(&policy, &input, clock.now());
        let (settings_tx, settings_rx) = watch::channel(Settings { policy, input });
        let (view_tx, view_rx) = watch::channel(initial);
        let samples = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn(run(settings_rx, view_tx, clock, Arc::clone(&samples)));

        Self {
            settings: settings_tx,
            view: view_rx,
            samples,
            task: Some(task),
        }
    }

    /// Replaces the item data. Gating and cadence are re-derived right away.
    pub fn update(&self, input: CountdownInput) {
        self.settings.send_modify(|settings| settings.input = input);
    }

    pub fn set_policy(&self, policy: CountdownPolicy) {
        self.settings.send_modify(|settings| settings.policy = policy);
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CountdownView> {
        self.view.clone()
    }

    #[must_use]
    pub fn current(&self) -> CountdownView {
        self.view.borrow().clone()
    }

    /// Number of samples taken so far.
    #[must_use]
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Cancels the sampling task and releases its handle.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Countdown engine stopped");
        }
    }
}

impl Drop for CountdownEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    mut settings: watch::Receiver<Settings>,
    view: watch::Sender<CountdownView>,
    clock: Arc<dyn Clock>,
    samples: Arc<AtomicU64>,
) {
    let mut mode: Option<Mode> = None;

    loop {
        // Settings are read at fire time so an update is never sampled against stale data.
        let sample = {
            let current = settings.borrow_and_update();
            evaluate(&current.policy, &current.input, clock.now())
        };
        samples.fetch_add(1, Ordering::AcqRel);

        let next = Mode::of(&sample);
        if mode != Some(next) {
            debug!(from = ?mode, to = ?next, "Countdown mode changed");
            mode = Some(next);
        }
        trace!(text = %sample.text, "Countdown sampled");
        view.send_replace(sample);

        match next.interval() {
            Some(period) => {
                tokio::select! {
                    () = sleep(period) => {}
                    changed = settings.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            None => {
                if settings.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}
