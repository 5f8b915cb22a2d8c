//! Caller identity registration.
//!
//! `sbus register` mints a fresh Ed25519 key pair for a user, optionally
//! publishes the public half (and the user's groups) to Consul's KV store,
//! and prints the shell exports that make the identity usable for signing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use rand::Rng;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{EnvironmentName, USER_ENV_VAR};

/// Default Consul KV prefix for public keys.
pub const DEFAULT_PUBLIC_KEY_PATH: &str = "services/keys/public/";

/// Default Consul KV prefix for identities.
pub const DEFAULT_IDENTITIES_PATH: &str = "services/sbus/identities/";

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("Consul request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Consul rejected {key}: {status}")]
    Status {
        key: String,
        status: reqwest::StatusCode,
    },
}

pub type Result<T> = std::result::Result<T, RegistrationError>;

/// A freshly generated signing key pair.
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// New key pair from a random 32-byte seed.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill(&mut seed);
        Self::from_seed(seed)
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// The seed, as consumed by `SBUS_<ENV>_PRIVATE_KEY`.
    pub fn seed_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// What gets published about a registered user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub user: String,
    pub public_key_hex: String,
    pub groups: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl IdentityRecord {
    pub fn new(user: impl Into<String>, identity: &Identity, groups: Vec<String>) -> Self {
        Self {
            user: user.into(),
            public_key_hex: identity.public_key_hex(),
            groups,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PublicKeyEntry<'a> {
    public_key: &'a str,
    created_at: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentityEntry<'a> {
    groups: &'a [String],
    created_at: i64,
}

/// Somewhere identities are made known to services.
#[async_trait]
pub trait IdentityPublisher: Send + Sync {
    async fn publish(&self, record: &IdentityRecord) -> Result<()>;
}

/// Publishes identities into Consul's HTTP KV API.
pub struct ConsulPublisher {
    client: Client,
    address: String,
    environment: EnvironmentName,
    public_key_path: String,
    identities_path: String,
}

impl ConsulPublisher {
    pub fn new(address: &str, environment: EnvironmentName) -> Self {
        Self {
            client: Client::new(),
            address: normalize_address(address),
            environment,
            public_key_path: DEFAULT_PUBLIC_KEY_PATH.to_string(),
            identities_path: DEFAULT_IDENTITIES_PATH.to_string(),
        }
    }

    /// Set the KV prefix for public keys.
    pub fn with_public_key_path(mut self, path: impl Into<String>) -> Self {
        self.public_key_path = path.into();
        self
    }

    /// Set the KV prefix for identities.
    pub fn with_identities_path(mut self, path: impl Into<String>) -> Self {
        self.identities_path = path.into();
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// KV endpoint for `prefix` + `user`.
    pub fn kv_url(&self, prefix: &str, user: &str) -> String {
        format!("{}/v1/kv/{}{}", self.address, prefix, user)
    }

    async fn put<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let url = self.kv_url("", key);
        let response = self.client.put(&url).json(value).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RegistrationError::Status {
                key: key.to_string(),
                status,
            });
        }
        debug!(key = %key, "Stored Consul key");
        Ok(())
    }
}

#[async_trait]
impl IdentityPublisher for ConsulPublisher {
    #[tracing::instrument(name = "consul.publish", skip_all, fields(user = %record.user))]
    async fn publish(&self, record: &IdentityRecord) -> Result<()> {
        if self.environment.is_local() {
            info!(env = %self.environment, "Consul cannot be configured for this environment, skipping");
            return Ok(());
        }

        let created_at = record.created_at.timestamp_millis();

        let public_key_key = format!("{}{}", self.public_key_path, record.user);
        self.put(
            &public_key_key,
            &PublicKeyEntry {
                public_key: &record.public_key_hex,
                created_at,
            },
        )
        .await?;

        let identity_key = format!("{}{}", self.identities_path, record.user);
        self.put(
            &identity_key,
            &IdentityEntry {
                groups: &record.groups,
                created_at,
            },
        )
        .await?;

        info!(consul = %self.address, "Published identity to Consul");
        Ok(())
    }
}

/// Consul addresses are often given as bare `host:port`.
fn normalize_address(address: &str) -> String {
    let trimmed = address.trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// Shell export lines for a registered identity.
pub fn export_lines(user: &str, env: &EnvironmentName, identity: &Identity) -> Vec<String> {
    vec![
        format!("export {}='{}'", USER_ENV_VAR, user),
        format!("export {}={}", env.private_key_var(), identity.seed_hex()),
        format!("export {}={}", env.public_key_var(), identity.public_key_hex()),
    ]
}
