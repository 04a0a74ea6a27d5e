//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::gate::RejectionConfig;
use crate::identity::IdentityConfig;
use crate::ratelimit::RateLimitPolicy;
use crate::store::MeshConfig;

/// Prefix of environment variables overriding file settings, e.g.
/// `TURNSTILE__STORE__TIMEOUT_MS=100`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Legacy switch for forwarded-header trust. Accepts `1`, `true` or `yes`.
pub const TRUST_FORWARDED_ENV: &str = "RATE_LIMIT_TRUST_X_FORWARDED_FOR";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Client identity resolution
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Tier ceilings and operation limits
    #[serde(default)]
    pub limits: RateLimitPolicy,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rejection rendering
    #[serde(default)]
    pub rejection: RejectionConfig,
}

/// Which counter store backs the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store
    #[default]
    Memory,
    /// Gossip-replicated store shared by a cluster
    Mesh,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StoreBackend,

    /// Deadline for the store calls of one check, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Mesh settings, used when `backend` is `mesh`
    #[serde(default)]
    pub mesh: MeshConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            timeout_ms: default_timeout_ms(),
            mesh: MeshConfig::default(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    250
}

impl StoreConfig {
    /// The store deadline as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file layered with
    /// `TURNSTILE__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(config::File::new(path, config::FileFormat::Yaml));
        }

        let mut loaded: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.apply_env_overrides();
        Ok(loaded)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Apply the legacy forwarded-header switch, if set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var(TRUST_FORWARDED_ENV) {
            self.identity.trust_forwarded_header = parse_flag(&value);
            info!(
                trust_forwarded_header = self.identity.trust_forwarded_header,
                "Forwarded header trust set from environment"
            );
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}
