use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

pub const CREDENTIALS_FILE_NAME: &str = "credentials.json";

/// Successful verification: a fresh session token for the verified identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    pub token: String,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// The secret does not match.
    Rejected,
    /// The verifier could not reach a verdict.
    Unavailable(String),
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected => write!(f, "credentials rejected"),
            Self::Unavailable(reason) => write!(f, "credential check unavailable: {reason}"),
        }
    }
}

impl std::error::Error for VerifyError {}

#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, identity: &str, secret: &str) -> Result<Verified, VerifyError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    users: BTreeMap<String, String>,
}

/// Verifies passwords against Argon2id hashes kept in a local JSON file.
#[derive(Debug, Clone)]
pub struct LocalVerifier {
    path: PathBuf,
    params: Params,
}

impl LocalVerifier {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            params: Params::default(),
        }
    }

    /// Uses custom Argon2 cost parameters for newly stored hashes.
    #[must_use]
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn hasher(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    fn read_file(&self) -> Result<CredentialFile> {
        if !self.path.exists() {
            return Ok(CredentialFile::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write_file(&self, file: &CredentialFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(file)?)?;
        Ok(())
    }

    /// Stores (or replaces) the password hash for `identity`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The identity is blank
    /// - Random salt generation fails
    /// - Hashing fails
    /// - The credentials file cannot be read or written
    pub fn set_password(&self, identity: &str, secret: &str) -> Result<()> {
        let identity = normalize_identity(identity);
        if identity.is_empty() {
            return Err(eyre!("Identity cannot be empty"));
        }

        let mut salt = [0u8; 16];
        getrandom::fill(&mut salt).map_err(|e| eyre!("Failed to get random bytes: {e}"))?;
        let salt = SaltString::encode_b64(&salt).map_err(|e| eyre!("Invalid salt: {e}"))?;
        let hash = self
            .hasher()
            .hash_password(secret.as_bytes(), &salt)
            .map_err(|e| eyre!("Password hashing failed: {e}"))?
            .to_string();

        let mut file = self.read_file()?;
        file.users.insert(identity.to_string(), hash);
        self.write_file(&file)?;
        debug!(identity, "Stored password hash");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the credentials file cannot be read or written.
    pub fn remove_user(&self, identity: &str) -> Result<bool> {
        let mut file = self.read_file()?;
        let removed = file.users.remove(normalize_identity(identity)).is_some();
        if removed {
            self.write_file(&file)?;
        }
        Ok(removed)
    }

    /// # Errors
    ///
    /// Returns an error if the credentials file cannot be read.
    pub fn has_user(&self, identity: &str) -> Result<bool> {
        Ok(self.read_file()?.users.contains_key(normalize_identity(identity)))
    }

    fn check(&self, identity: &str, secret: &str) -> Result<Verified, VerifyError> {
        let identity = normalize_identity(identity);
        let file = self
            .read_file()
            .map_err(|e| VerifyError::Unavailable(e.to_string()))?;
        let Some(stored) = file.users.get(identity) else {
            debug!(identity, "Unknown identity");
            return Err(VerifyError::Rejected);
        };
        let parsed = PasswordHash::new(stored).map_err(|e| {
            warn!(identity, "Stored password hash is unreadable: {e}");
            VerifyError::Unavailable(format!("unreadable password hash: {e}"))
        })?;

        self.hasher()
            .verify_password(secret.as_bytes(), &parsed)
            .map_err(|_| VerifyError::Rejected)?;

        Ok(Verified {
            token: Uuid::new_v4().to_string(),
            identity: identity.to_string(),
        })
    }
}

/// Credentials are keyed by the identity without surrounding whitespace.
fn normalize_identity(identity: &str) -> &str {
    identity.trim()
}

#[async_trait]
impl CredentialVerifier for LocalVerifier {
    async fn verify(&self, identity: &str, secret: &str) -> Result<Verified, VerifyError> {
        let verifier = self.clone();
        let identity = identity.to_string();
        let secret = Zeroizing::new(secret.to_string());

        tokio::task::spawn_blocking(move || verifier.check(&identity, &secret))
            .await
            .map_err(|e| VerifyError::Unavailable(format!("verification task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    use super::*;

    fn fast_verifier(dir: &Path) -> LocalVerifier {
        let params = Params::new(1024, 1, 1, None).expect("valid params");
        LocalVerifier::new(dir.join(CREDENTIALS_FILE_NAME)).with_params(params)
    }

    #[tokio::test]
    async fn test_correct_password_yields_token() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = fast_verifier(dir.path());
        verifier.set_password("alice", "correct horse").unwrap();

        let verified = verifier.verify("alice", "correct horse").await.unwrap();
        assert_eq!(verified.identity, "alice");
        assert!(!verified.token.is_empty());

        let again = verifier.verify("alice", "correct horse").await.unwrap();
        assert_ne!(again.token, verified.token);
    }

    #[tokio::test]
    async fn test_wrong_password_and_unknown_user_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = fast_verifier(dir.path());
        verifier.set_password("alice", "correct horse").unwrap();

        assert_eq!(
            verifier.verify("alice", "battery staple").await,
            Err(VerifyError::Rejected)
        );
        assert_eq!(verifier.verify("mallory", "correct horse").await, Err(VerifyError::Rejected));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = fast_verifier(dir.path());
        std::fs::write(verifier.path(), "not json").unwrap();

        let err = verifier.verify("alice", "x").await.unwrap_err();
        assert!(matches!(err, VerifyError::Unavailable(_)));
    }

    #[test]
    fn test_set_password_replaces_and_remove_user() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = fast_verifier(dir.path());
        verifier.set_password("bob", "one").unwrap();
        verifier.set_password("bob", "two").unwrap();
        assert!(verifier.has_user("bob").unwrap());

        assert!(verifier.check("bob", "one").is_err());
        assert!(verifier.check("bob", "two").is_ok());

        assert!(verifier.remove_user("bob").unwrap());
        assert!(!verifier.remove_user("bob").unwrap());
        assert!(!verifier.has_user("bob").unwrap());
    }

    #[tokio::test]
    async fn test_identity_whitespace_is_ignored_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = fast_verifier(dir.path());
        verifier.set_password(" alice ", "correct horse").unwrap();

        assert!(verifier.has_user("alice").unwrap());
        assert!(verifier.has_user("alice\n").unwrap());
        let verified = verifier.verify("  alice", "correct horse").await.unwrap();
        assert_eq!(verified.identity, "alice");

        assert!(verifier.remove_user("alice ").unwrap());
        assert!(!verifier.has_user("alice").unwrap());
    }

    #[test]
    fn test_blank_identity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(fast_verifier(dir.path()).set_password("  ", "secret").is_err());
    }
}
