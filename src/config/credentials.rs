//! Credential resolution for one environment.
//!
//! Precedence, highest first:
//! 1. Per-environment settings in the config file
//! 2. Environment variables (`SBUS_USER`, `SBUS_<ENV>_PRIVATE_KEY`,
//!    `SBUS_AMQP_<ENV>_URL`, `SBUS_KAFKA_<ENV>_URL`)
//! 3. Global `sbus_user` from the config file (user only)
//! 4. Local defaults (URLs only)

use std::collections::HashMap;
use std::fmt;

use super::{AppConfig, DEFAULT_AMQP_URL, DEFAULT_KAFKA_URL, USER_ENV_VAR};

/// Source of environment variables.
pub trait EnvLookup {
    /// Value of `key`, treating empty values as unset.
    fn var(&self, key: &str) -> Option<String>;
}

/// The process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

impl EnvLookup for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.is_empty()).cloned()
    }
}

/// Environment identifier with `-` normalized to `_`.
///
/// The name as typed is kept for matching external resource names, which
/// are not normalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvironmentName {
    name: String,
    raw: String,
}

impl EnvironmentName {
    pub const LOCAL: &'static str = "local";

    pub fn new(raw: &str) -> Self {
        Self {
            name: raw.replace('-', "_"),
            raw: raw.to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// The name exactly as given on the command line.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Upper-cased form used inside variable names.
    pub fn upper(&self) -> String {
        self.name.to_uppercase()
    }

    pub fn is_local(&self) -> bool {
        self.name == Self::LOCAL
    }

    pub fn private_key_var(&self) -> String {
        format!("SBUS_{}_PRIVATE_KEY", self.upper())
    }

    pub fn public_key_var(&self) -> String {
        format!("SBUS_{}_PUBLIC_KEY", self.upper())
    }

    pub fn amqp_url_var(&self) -> String {
        format!("SBUS_AMQP_{}_URL", self.upper())
    }

    pub fn kafka_url_var(&self) -> String {
        format!("SBUS_KAFKA_{}_URL", self.upper())
    }
}

impl fmt::Display for EnvironmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Everything a send needs to know about its environment.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub environment: EnvironmentName,
    pub user: Option<String>,
    pub signing_seed_hex: Option<String>,
    pub amqp_url: String,
    pub kafka_url: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("environment", &self.environment)
            .field("user", &self.user)
            .field(
                "signing_seed_hex",
                &self.signing_seed_hex.as_ref().map(|_| "<redacted>"),
            )
            .field("amqp_url", &self.amqp_url)
            .field("kafka_url", &self.kafka_url)
            .finish()
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

impl AppConfig {
    /// Resolve credentials for `env`. Never fails; gaps fall back to
    /// unsigned operation and local broker defaults.
    pub fn resolve(&self, env: &EnvironmentName, vars: &dyn EnvLookup) -> Credentials {
        let data = self.environment(env);

        let user = non_empty(data.and_then(|d| d.sbus_user.as_ref()))
            .or_else(|| vars.var(USER_ENV_VAR))
            .or_else(|| non_empty(self.sbus_user.as_ref()));

        let signing_seed_hex = non_empty(data.and_then(|d| d.sbus_private_key.as_ref()))
            .or_else(|| vars.var(&env.private_key_var()));

        let amqp_url = non_empty(data.and_then(|d| d.sbus_amqp_url.as_ref()))
            .or_else(|| vars.var(&env.amqp_url_var()))
            .unwrap_or_else(|| DEFAULT_AMQP_URL.to_string());

        let kafka_url = non_empty(data.and_then(|d| d.sbus_kafka_url.as_ref()))
            .or_else(|| vars.var(&env.kafka_url_var()))
            .unwrap_or_else(|| DEFAULT_KAFKA_URL.to_string());

        Credentials {
            environment: env.clone(),
            user,
            signing_seed_hex,
            amqp_url,
            kafka_url,
        }
    }
}
