//! Core configuration from the `ACE_*` environment.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

const fn default_lock_lease_secs() -> u64 {
    300
}

const fn default_lock_wait_secs() -> u64 {
    30
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("storage")
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Key material consumed by the packaging CLI and crypto helpers. The core
/// itself only carries these through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoSettings {
    pub salt: String,
    pub salt_size: u32,
    pub iterations: u32,
    pub encrypted_key: String,
    pub verification_key: String,
}

/// Configuration for one core instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Remote facade base URI (`ACE_URI`).
    pub uri: Option<String>,
    /// Bearer token expected by the remote facade (`ACE_API_KEY`).
    pub api_key: Option<String>,
    /// Administrative password for key issuance (`ACE_ADMIN_PASSWORD`).
    pub admin_password: Option<String>,
    /// SQL backend connection string (`ACE_DB_URL`), consumed by backend
    /// crates that plug into the tracker contracts.
    pub db_url: Option<String>,
    /// Redis backend location (`ACE_REDIS_HOST` / `ACE_REDIS_PORT`).
    pub redis_host: Option<String>,
    pub redis_port: Option<u16>,
    /// Blob store root (`ACE_STORAGE_ROOT`).
    pub storage_root: PathBuf,
    /// Installation base directory (`ACE_BASE_DIR`).
    pub base_dir: PathBuf,
    pub crypto: Option<CryptoSettings>,
    /// Root lock lease duration.
    pub lock_lease_secs: u64,
    /// How long a request processor waits for a root lock.
    pub lock_wait_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            uri: None,
            api_key: None,
            admin_password: None,
            db_url: None,
            redis_host: None,
            redis_port: None,
            storage_root: default_storage_root(),
            base_dir: default_base_dir(),
            crypto: None,
            lock_lease_secs: default_lock_lease_secs(),
            lock_wait_secs: default_lock_wait_secs(),
        }
    }
}

impl CoreConfig {
    /// Build a configuration from the `ACE_*` environment, falling back to
    /// defaults for anything unset.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self {
            uri: env::var("ACE_URI").ok(),
            api_key: env::var("ACE_API_KEY").ok(),
            admin_password: env::var("ACE_ADMIN_PASSWORD").ok(),
            db_url: env::var("ACE_DB_URL").ok(),
            redis_host: env::var("ACE_REDIS_HOST").ok(),
            redis_port: env::var("ACE_REDIS_PORT")
                .ok()
                .and_then(|port| port.parse().ok()),
            ..Self::default()
        };

        if let Ok(root) = env::var("ACE_STORAGE_ROOT") {
            config.storage_root = PathBuf::from(root);
        }
        if let Ok(base) = env::var("ACE_BASE_DIR") {
            config.base_dir = PathBuf::from(base);
        }
        config.crypto = Self::crypto_from_env();
        config
    }

    fn crypto_from_env() -> Option<CryptoSettings> {
        Some(CryptoSettings {
            salt: env::var("ACE_CRYPTO_SALT").ok()?,
            salt_size: env::var("ACE_CRYPTO_SALT_SIZE").ok()?.parse().ok()?,
            iterations: env::var("ACE_CRYPTO_ITERATIONS").ok()?.parse().ok()?,
            encrypted_key: env::var("ACE_CRYPTO_ENCRYPTED_KEY").ok()?,
            verification_key: env::var("ACE_CRYPTO_VERIFICATION_KEY").ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = CoreConfig::default();
        assert_eq!(config.storage_root, PathBuf::from("storage"));
        assert_eq!(config.lock_lease_secs, 300);
        assert!(config.api_key.is_none());
        assert!(config.crypto.is_none());
    }
}
