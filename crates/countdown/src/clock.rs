use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Source of wall-clock time for everything that samples "now".
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock anchored at a fixed origin that advances with the tokio time driver.
///
/// When the runtime clock is paused (`#[tokio::test(start_paused = true)]`) the
/// reported time only moves when tokio time moves, which makes timer behaviour
/// reproducible.
#[derive(Debug, Clone)]
pub struct RuntimeClock {
    origin: DateTime<Utc>,
    started: Instant,
}

impl RuntimeClock {
    #[must_use]
    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            started: Instant::now(),
        }
    }
}

impl Clock for RuntimeClock {
    fn now(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.started.elapsed()).map_or(self.origin, |elapsed| self.origin + elapsed)
    }
}
