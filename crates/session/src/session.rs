use crate::monitor::lock_ignoring_poison;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub identity: String,
    pub token: String,
    pub established_at: DateTime<Utc>,
}

/// The currently authenticated user, if any.
#[derive(Debug, Default)]
pub struct Session {
    current: Mutex<Option<Credentials>>,
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn establish(&self, identity: &str, token: &str) {
        *lock_ignoring_poison(&self.current) = Some(Credentials {
            identity: identity.to_string(),
            token: token.to_string(),
            established_at: Utc::now(),
        });
        info!(identity, "Session established");
    }

    pub fn clear(&self) {
        if let Some(previous) = lock_ignoring_poison(&self.current).take() {
            info!(identity = %previous.identity, "Session cleared");
        }
    }

    /// Identity of the signed-in user. Blank identities are treated as absent.
    #[must_use]
    pub fn identity(&self) -> Option<String> {
        lock_ignoring_poison(&self.current)
            .as_ref()
            .map(|c| c.identity.clone())
            .filter(|identity| !identity.trim().is_empty())
    }

    #[must_use]
    pub fn token(&self) -> Option<String> {
        lock_ignoring_poison(&self.current).as_ref().map(|c| c.token.clone())
    }

    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        lock_ignoring_poison(&self.current).clone()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        lock_ignoring_poison(&self.current).is_some()
    }
}
