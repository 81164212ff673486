use color_eyre::Result;
use color_eyre::eyre::eyre;
use reqguard_countdown::CountdownPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "console_config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// Idle time before the screen locks (in seconds)
    pub lock_timeout_secs: u64,

    /// Idle time before the session is logged out if locking never engaged (in seconds)
    pub logout_timeout_secs: u64,

    /// Countdown shown before locking (in seconds)
    pub lock_warning_secs: u64,

    /// Countdown shown before logging out (in seconds)
    pub logout_warning_secs: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 15 * 60,   // 15 minutes
            logout_timeout_secs: 30 * 60, // 30 minutes
            lock_warning_secs: 60,
            logout_warning_secs: 60,
        }
    }
}

impl ActivityConfig {
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    #[must_use]
    pub const fn logout_timeout(&self) -> Duration {
        Duration::from_secs(self.logout_timeout_secs)
    }

    #[must_use]
    pub const fn lock_warning(&self) -> Duration {
        Duration::from_secs(self.lock_warning_secs)
    }

    #[must_use]
    pub const fn logout_warning(&self) -> Duration {
        Duration::from_secs(self.logout_warning_secs)
    }

    /// Checks the timeout relationships the activity monitor relies on.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The lock timeout is zero
    /// - The logout timeout is not strictly longer than the lock timeout
    /// - A warning window is not shorter than its timeout
    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout_secs == 0 {
            return Err(eyre!("Lock timeout must be greater than zero"));
        }
        if self.logout_timeout_secs <= self.lock_timeout_secs {
            return Err(eyre!(
                "Logout timeout ({}s) must be longer than lock timeout ({}s)",
                self.logout_timeout_secs,
                self.lock_timeout_secs
            ));
        }
        if self.lock_warning_secs >= self.lock_timeout_secs {
            return Err(eyre!("Lock warning window must be shorter than the lock timeout"));
        }
        if self.logout_warning_secs >= self.logout_timeout_secs {
            return Err(eyre!("Logout warning window must be shorter than the logout timeout"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Failed unlock attempts that force a full logout
    pub max_failed_attempts: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: crate::lock::DEFAULT_MAX_FAILED_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub activity: ActivityConfig,
    pub lock: LockConfig,
    pub countdown: CountdownPolicy,
}

impl ConsoleConfig {
    /// # Errors
    ///
    /// Returns an error if the activity timeouts are inconsistent or the attempt ceiling is zero.
    pub fn validate(&self) -> Result<()> {
        self.activity.validate()?;
        if self.lock.max_failed_attempts == 0 {
            return Err(eyre!("Failed attempt ceiling must be at least 1"));
        }
        Ok(())
    }

    /// Loads the configuration stored at `path`, falling back to defaults when the file
    /// does not exist.
    ///
    /// # Errors
    ///
    /// This function may return an error in the following scenarios:
    /// - The file exists but cannot be read
    /// - The content is not valid JSON for a `ConsoleConfig`
    /// - The loaded values fail validation
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str::<Self>(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty-printed JSON, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if validation, directory creation, serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Directory holding the configuration, lock-state database and credentials.
///
/// # Errors
///
/// Returns an error if the platform has no configuration directory or it cannot be created.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = dirs::config_dir().ok_or_else(|| eyre!("No config dir"))?;
    let dir = base.join("reqguard");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
