//! Environment-driven configuration.
//!
//! The router's entire surface is environment variables, pushed down by the
//! deployment tool. Loading is fail-fast: any missing or malformed value
//! stops the process with a message naming the variable. Secrets are held as
//! [`SecretString`] so they never end up in logs or debug output.

use secrecy::SecretString;
use thiserror::Error;
use url::Url;

use canary_core::plan::Plan;

/// Errors from configuration loading. All fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable was absent or empty.
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    /// A variable was present but unusable.
    #[error("invalid value for {name}: {reason}")]
    Invalid {
        /// The variable's name.
        name: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}

/// Everything the router needs to run.
pub struct Config {
    /// TCP port the proxy listens on.
    pub port: u16,

    /// URL of the known-good upstream.
    pub current_route: String,

    /// URL of the canary upstream.
    pub canary_route: String,

    /// Base URL of the metric store.
    pub log_cache_addr: Url,

    /// Base URL of the UAA identity service.
    pub uaa_addr: Url,

    /// UAA resource-owner username.
    pub uaa_user: String,

    /// UAA resource-owner password.
    pub uaa_password: SecretString,

    /// UAA client id.
    pub uaa_client: String,

    /// UAA client secret; may be empty for public clients.
    pub uaa_client_secret: SecretString,

    /// The metric predicate expression.
    pub query: String,

    /// The rollout plan.
    pub plan: Plan,

    /// Skip TLS peer verification on every outbound connection.
    pub skip_ssl_validation: bool,
}

impl Config {
    /// Loads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first missing or malformed
    /// variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads the configuration through an injected lookup, so tests can
    /// supply an environment without touching the process's.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first missing or malformed
    /// variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|value| !value.is_empty())
                .ok_or(ConfigError::Missing(name))
        };

        let port = required("PORT")?
            .parse()
            .map_err(|err| ConfigError::Invalid {
                name: "PORT",
                reason: format!("{err}"),
            })?;

        let log_cache_addr = parse_url("LOG_CACHE_ADDR", &required("LOG_CACHE_ADDR")?)?;
        let uaa_addr = parse_url("UAA_ADDR", &required("UAA_ADDR")?)?;

        let plan = Plan::from_json(&required("PLAN")?).map_err(|err| ConfigError::Invalid {
            name: "PLAN",
            reason: err.to_string(),
        })?;

        let skip_ssl_validation = match lookup("SKIP_SSL_VALIDATION") {
            None => false,
            Some(value) => parse_bool("SKIP_SSL_VALIDATION", &value)?,
        };

        Ok(Self {
            port,
            current_route: required("CURRENT_ROUTE")?,
            canary_route: required("CANARY_ROUTE")?,
            log_cache_addr,
            uaa_addr,
            uaa_user: required("UAA_USER")?,
            uaa_password: SecretString::from(required("UAA_PASSWORD")?),
            uaa_client: required("UAA_CLIENT")?,
            uaa_client_secret: SecretString::from(lookup("UAA_CLIENT_SECRET").unwrap_or_default()),
            query: required("QUERY")?,
            plan,
            skip_ssl_validation,
        })
    }
}

fn parse_url(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|err| ConfigError::Invalid {
        name,
        reason: err.to_string(),
    })
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "" | "false" | "0" => Ok(false),
        "true" | "1" => Ok(true),
        other => Err(ConfigError::Invalid {
            name,
            reason: format!("expected a boolean, found '{other}'"),
        }),
    }
}
