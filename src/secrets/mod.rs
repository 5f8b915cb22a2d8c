//! Broker URL lookup in AWS Secrets Manager.
//!
//! Backs `sbus config`: with an exact key the secret is fetched directly,
//! otherwise the single secret whose name mentions the environment and ends
//! with the broker's suffix is selected.

use aws_config::BehaviorVersion;
use aws_sdk_secretsmanager::error::DisplayErrorContext;
use aws_sdk_secretsmanager::Client;
use tracing::{debug, info};

use crate::config::{EnvLookup, EnvironmentName};

/// Variable naming the region to query.
pub const REGION_ENV_VAR: &str = "AWS_DEFAULT_REGION";

/// Name suffix of AMQP URL secrets.
pub const AMQP_KEY_SUFFIX: &str = "amq_url";

/// Name suffix of Kafka URL secrets.
pub const KAFKA_KEY_SUFFIX: &str = "kafka_url";

#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("{REGION_ENV_VAR} must be set")]
    MissingRegion,

    #[error("--env must be provided and must not be local, got '{0}'")]
    InvalidEnvironment(String),

    #[error("No secret matching *{env}*{suffix}")]
    NotFound { env: String, suffix: String },

    #[error("{count} secrets match *{env}*{suffix}, pass the key explicitly")]
    Ambiguous {
        env: String,
        suffix: String,
        count: usize,
    },

    #[error("Secrets Manager error: {0}")]
    Aws(String),

    #[error("Secret {0} has no string value")]
    EmptySecret(String),
}

pub type Result<T> = std::result::Result<T, SecretsError>;

/// Pick the one secret name containing `env` and ending with `suffix`.
pub fn select_secret<'a, I>(names: I, env: &str, suffix: &str) -> Result<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let matches: Vec<&str> = names
        .into_iter()
        .filter(|name| name.contains(env) && name.ends_with(suffix))
        .collect();

    match matches.as_slice() {
        [only] => Ok((*only).to_string()),
        [] => Err(SecretsError::NotFound {
            env: env.to_string(),
            suffix: suffix.to_string(),
        }),
        many => Err(SecretsError::Ambiguous {
            env: env.to_string(),
            suffix: suffix.to_string(),
            count: many.len(),
        }),
    }
}

/// Pick the secret for `environment`, matched on the name as typed.
///
/// Secret names are AWS resources, so the `-` to `_` normalization used for
/// variable names does not apply.
pub fn select_for_environment(
    names: &[String],
    environment: &EnvironmentName,
    suffix: &str,
) -> Result<String> {
    select_secret(names.iter().map(String::as_str), environment.raw(), suffix)
}

/// Secrets Manager client scoped to one environment.
pub struct SecretsLookup {
    client: Client,
    environment: EnvironmentName,
}

impl SecretsLookup {
    /// Build a client for the region in `AWS_DEFAULT_REGION`.
    pub async fn connect(environment: EnvironmentName, vars: &dyn EnvLookup) -> Result<Self> {
        let region = preflight(&environment, vars)?;

        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()))
            .load()
            .await;

        info!(region = %region, env = %environment, "Connected to Secrets Manager");
        Ok(Self {
            client: Client::new(&config),
            environment,
        })
    }

    /// Fetch `exact_key`, or the single secret matching this environment and `suffix`.
    pub async fn fetch(&self, exact_key: Option<&str>, suffix: &str) -> Result<String> {
        let key = match exact_key.filter(|k| !k.is_empty()) {
            Some(key) => key.to_string(),
            None => {
                let names = self.list_names().await?;
                select_for_environment(&names, &self.environment, suffix)?
            }
        };
        self.secret_string(&key).await
    }

    async fn list_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let page = self
                .client
                .list_secrets()
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| SecretsError::Aws(DisplayErrorContext(&e).to_string()))?;

            names.extend(
                page.secret_list()
                    .iter()
                    .filter_map(|entry| entry.name().map(str::to_string)),
            );

            match page.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        debug!(count = names.len(), "Listed secrets");
        Ok(names)
    }

    async fn secret_string(&self, key: &str) -> Result<String> {
        let output = self
            .client
            .get_secret_value()
            .secret_id(key)
            .send()
            .await
            .map_err(|e| SecretsError::Aws(DisplayErrorContext(&e).to_string()))?;

        output
            .secret_string()
            .map(str::to_string)
            .ok_or_else(|| SecretsError::EmptySecret(key.to_string()))
    }
}

/// Region to query, once the environment is known to be remote.
fn preflight(environment: &EnvironmentName, vars: &dyn EnvLookup) -> Result<String> {
    let region = vars
        .var(REGION_ENV_VAR)
        .filter(|r| !r.is_empty())
        .ok_or(SecretsError::MissingRegion)?;

    if environment.raw().is_empty() || environment.is_local() {
        return Err(SecretsError::InvalidEnvironment(
            environment.raw().to_string(),
        ));
    }
    Ok(region)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const NAMES: [&str; 5] = [
        "qa/sbus/amq_url",
        "qa/sbus/kafka_url",
        "prod/sbus/amq_url",
        "qa/legacy/amq_url_old",
        "staging/sbus/kafka_url",
    ];

    #[test]
    fn test_select_single_match() {
        assert_eq!(
            select_secret(NAMES, "qa", AMQP_KEY_SUFFIX).unwrap(),
            "qa/sbus/amq_url"
        );
        assert_eq!(
            select_secret(NAMES, "staging", KAFKA_KEY_SUFFIX).unwrap(),
            "staging/sbus/kafka_url"
        );
    }

    #[test]
    fn test_select_none() {
        assert!(matches!(
            select_secret(NAMES, "dev", AMQP_KEY_SUFFIX),
            Err(SecretsError::NotFound { .. })
        ));
    }

    #[test]
    fn test_select_ambiguous() {
        let names = ["qa/a/amq_url", "qa/b/amq_url"];
        assert!(matches!(
            select_secret(names, "qa", AMQP_KEY_SUFFIX),
            Err(SecretsError::Ambiguous { count: 2, .. })
        ));
    }

    #[test]
    fn test_env_match_is_substring() {
        // "prod" also appears inside "preprod"
        let names = ["preprod/amq_url", "prod/amq_url"];
        assert!(matches!(
            select_secret(names, "prod", AMQP_KEY_SUFFIX),
            Err(SecretsError::Ambiguous { .. })
        ));
    }

    #[test]
    fn test_dashed_environment_matches_raw_name() {
        let names: Vec<String> = [
            "stage-eu/sbus/amq_url",
            "stage_eu/legacy/kafka_url",
            "stage-eu/sbus/kafka_url",
        ]
        .iter()
        .map(|n| n.to_string())
        .collect();
        let env = EnvironmentName::new("stage-eu");

        assert_eq!(
            select_for_environment(&names, &env, AMQP_KEY_SUFFIX).unwrap(),
            "stage-eu/sbus/amq_url"
        );
        assert_eq!(
            select_for_environment(&names, &env, KAFKA_KEY_SUFFIX).unwrap(),
            "stage-eu/sbus/kafka_url"
        );
    }

    #[test]
    fn test_preflight_requires_region() {
        let vars = HashMap::<String, String>::new();
        assert!(matches!(
            preflight(&EnvironmentName::new("qa"), &vars),
            Err(SecretsError::MissingRegion)
        ));
    }

    #[test]
    fn test_preflight_rejects_local() {
        let vars = HashMap::from([(REGION_ENV_VAR.to_string(), "eu-west-1".to_string())]);
        assert!(matches!(
            preflight(&EnvironmentName::new("local"), &vars),
            Err(SecretsError::InvalidEnvironment(_))
        ));
        assert!(matches!(
            preflight(&EnvironmentName::new(""), &vars),
            Err(SecretsError::InvalidEnvironment(_))
        ));
        assert_eq!(
            preflight(&EnvironmentName::new("qa"), &vars).unwrap(),
            "eu-west-1"
        );
    }
}
