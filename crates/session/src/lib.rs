pub mod activity;
pub mod config;
pub mod console;
pub mod lock;
pub mod monitor;
pub mod session;
pub mod store;
pub mod verifier;

pub use activity::{ActivityTracker, TickAction, Warning};
pub use config::{ActivityConfig, CONFIG_FILE_NAME, ConsoleConfig, LockConfig, default_data_dir};
pub use console::{Console, LOCK_STATE_FILE_NAME, LoginOutcome, Notice};
pub use lock::{
    DEFAULT_MAX_FAILED_ATTEMPTS, LockEvent, LockOutcome, LockState, LogoutHandler, LogoutReason, SessionLock,
    UnlockOutcome,
};
pub use monitor::{ActivityHandler, ActivityMonitor, LockTrigger, TICK};
pub use session::{Credentials, Session};
pub use store::{KeyValueStore, LockStore, MemoryStore, Mutation, SqliteStore, keys};
pub use verifier::{CREDENTIALS_FILE_NAME, CredentialVerifier, LocalVerifier, Verified, VerifyError};
