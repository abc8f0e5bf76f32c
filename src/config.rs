//! Configuration management

use std::{path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::oidc::{GITHUB_ACTIONS_ISSUER, jwks};
use crate::{Error, Result};

/// Prefix for nested environment overrides (`GHA_GOPROXY_GATE_SERVER__PORT`).
pub const ENV_PREFIX: &str = "GHA_GOPROXY_GATE_";

/// Flat environment variables accepted for drop-in deployments.
const LEGACY_ENV: [(&str, &str); 4] = [
    ("PORT", "server.port"),
    ("BYPASS_IP_LIST", "auth.bypass_ip_list"),
    ("AUDIENCE", "auth.audience"),
    ("GOPROXY_URL", "backend.url"),
];

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Token verification and bypass configuration
    pub auth: AuthConfig,
    /// Backend module proxy
    pub backend: BackendConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Upper bound on handling one request, up to the response head
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes) forwarded to the backend
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Expected `aud` claim (required)
    pub audience: String,
    /// Addresses and CIDR blocks that skip token verification.
    /// Accepts a list or a comma-separated string.
    #[serde(deserialize_with = "comma_list::deserialize")]
    pub bypass_ip_list: Vec<String>,
    /// Expected `iss` claim
    pub issuer: String,
    /// Key set location
    pub jwks_url: String,
    /// How long fetched keys are trusted
    #[serde(with = "humantime_serde")]
    pub jwks_refresh_interval: Duration,
    /// Upper bound on one key set fetch
    #[serde(with = "humantime_serde")]
    pub jwks_timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            audience: String::new(),
            bypass_ip_list: Vec::new(),
            issuer: GITHUB_ACTIONS_ISSUER.to_string(),
            jwks_url: jwks::DEFAULT_JWKS_URL.to_string(),
            jwks_refresh_interval: jwks::DEFAULT_REFRESH_INTERVAL,
            jwks_timeout: jwks::DEFAULT_FETCH_TIMEOUT,
        }
    }
}

/// Backend module proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Origin URL of the module proxy (required)
    pub url: String,
    /// Request timeout towards the backend
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// Precedence, lowest first: defaults, YAML file, flat variables
    /// (`PORT`, `BYPASS_IP_LIST`, `AUDIENCE`, `GOPROXY_URL`), prefixed
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment
            .merge(legacy_env())
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment.extract().map_err(|e| Error::Config(e.to_string()))
    }

    /// Check required settings and URL shapes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.auth.audience.trim().is_empty() {
            return Err(Error::Config("AUDIENCE is required".to_string()));
        }

        if self.backend.url.trim().is_empty() {
            return Err(Error::Config("GOPROXY_URL is required".to_string()));
        }
        let backend = url::Url::parse(&self.backend.url)
            .map_err(|e| Error::Config(format!("Invalid GOPROXY_URL {:?}: {e}", self.backend.url)))?;
        if !matches!(backend.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "GOPROXY_URL must be http or https, got {}",
                backend.scheme()
            )));
        }

        if self.server.request_timeout.is_zero() {
            return Err(Error::Config(
                "server.request_timeout must be greater than zero".to_string(),
            ));
        }

        if self.auth.issuer.is_empty() {
            return Err(Error::Config("auth.issuer must not be empty".to_string()));
        }

        let jwks_url = url::Url::parse(&self.auth.jwks_url)
            .map_err(|e| Error::Config(format!("Invalid auth.jwks_url: {e}")))?;
        if jwks_url.scheme() != "https" {
            warn!(jwks_url = %self.auth.jwks_url, "JWKS URL is not HTTPS");
        }

        Ok(())
    }
}

/// Map the flat variables onto their nested keys.
fn legacy_env() -> Env {
    let names: Vec<&str> = LEGACY_ENV.iter().map(|(name, _)| *name).collect();
    Env::raw().only(&names).map(|key| {
        LEGACY_ENV
            .iter()
            .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
            .map_or_else(|| key.as_str().to_string(), |(_, path)| (*path).to_string())
            .into()
    })
}

/// Accept either a sequence or a comma-separated string.
pub mod comma_list {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrString {
        List(Vec<String>),
        Text(String),
    }

    /// Deserialize into trimmed, non-empty entries.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value is neither a string nor
    /// a list of strings.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let items = match ListOrString::deserialize(deserializer)? {
            ListOrString::List(items) => items,
            ListOrString::Text(text) => text.split(',').map(str::to_string).collect(),
        };

        Ok(items
            .into_iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect())
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "1h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        let s = match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => return Ok(Duration::from_secs(secs)),
            Raw::Text(s) => s,
        };
        let s = s.trim();

        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
