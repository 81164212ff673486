pub mod clock;
pub mod deadline;
pub mod engine;

// Re-export commonly used types and functions for easier access
pub use clock::{Clock, RuntimeClock, SystemClock};
pub use deadline::{
    AVERAGE_MONTH_SECONDS, CountdownInput, CountdownPolicy, CountdownView, DurationSpec, PLACEHOLDER, SECONDS_PER_DAY,
    compute_deadline, evaluate, format_remaining,
};
pub use engine::{ACTIVE_INTERVAL, CountdownEngine, Mode, OVERDUE_INTERVAL};
