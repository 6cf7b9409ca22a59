// ============================================================================
// Courier Config - Centralized configuration management
// ============================================================================
//
// Configuration for the broker binary and its core library. Values come from
// three layers: built-in defaults, an optional JSON config file, and
// environment variable overrides.
//
// ============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "BROKER_CONFIG";

/// Default config file consulted when `BROKER_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "broker.json";

/// Length of generated signing secrets and API keys, in random bytes.
pub const SECRET_BYTES: usize = 32;

/// Server listener and housekeeping configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls_enabled: bool,
    pub tls_cert_file: String,
    pub tls_key_file: String,
    /// Expiration sweeper wake-up period, in seconds.
    pub tick_seconds: u16,
    /// Advisory spool size hint. Not enforced by the broker.
    pub max_stored: u32,
    /// Maximum age of a spooled message before the sweeper evicts it.
    pub max_age_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 50011,
            tls_enabled: false,
            tls_cert_file: "server.crt".to_string(),
            tls_key_file: "server.key".to_string(),
            tick_seconds: 60,
            max_stored: 100,
            max_age_secs: 24 * 60 * 60,
        }
    }
}

impl ServerConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn tick(&self) -> Duration {
        // A zero period would spin; clamp to one second.
        Duration::from_secs(u64::from(self.tick_seconds).max(1))
    }
}

/// Credential validation strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    /// HMAC-SHA256 signed tokens carrying a `service_name` claim.
    SignedToken,
    /// Opaque API keys resolved through the key -> service map.
    OpaqueKey,
}

impl AuthMethod {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "signed-token" => Some(AuthMethod::SignedToken),
            "opaque-key" => Some(AuthMethod::OpaqueKey),
            _ => None,
        }
    }
}

/// Authentication configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub method: AuthMethod,
    /// Hex-encoded HMAC signing secret. Generated on first use when empty.
    pub signing_secret: String,
    /// API key -> service name.
    pub api_keys: HashMap<String, String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: AuthMethod::SignedToken,
            signing_secret: String::new(),
            api_keys: HashMap::new(),
        }
    }
}

/// Spool storage configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Directory holding the spool store.
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("broker.db"),
        }
    }
}

/// Main configuration structure for the broker.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub database: DbConfig,
    #[serde(skip)]
    pub rust_log: String,
}

impl Config {
    /// Load configuration: defaults, then the JSON file named by
    /// `BROKER_CONFIG` (or `broker.json` when present), then environment
    /// variable overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Config::load(Path::new(&path))?,
            Err(_) => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Config::load(default_path)?
                } else {
                    Config::default()
                }
            }
        };

        config.apply_env();
        Ok(config)
    }

    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration as pretty-printed JSON, file mode 0600.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, data)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("failed to restrict config file {}", path.display()))?;
        }
        Ok(())
    }

    /// Write a default configuration with a freshly generated signing secret.
    pub fn generate_default(path: &Path) -> Result<Self> {
        let mut config = Config::default();
        config.auth.signing_secret = generate_signing_secret();
        config.save(path)?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("BROKER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse("BROKER_PORT") {
            self.server.port = port;
        }
        if let Some(enabled) = env_parse("BROKER_TLS_ENABLED") {
            self.server.tls_enabled = enabled;
        }
        if let Ok(cert) = std::env::var("BROKER_TLS_CERT_FILE") {
            self.server.tls_cert_file = cert;
        }
        if let Ok(key) = std::env::var("BROKER_TLS_KEY_FILE") {
            self.server.tls_key_file = key;
        }
        if let Some(tick) = env_parse("BROKER_TICK_SECONDS") {
            self.server.tick_seconds = tick;
        }
        if let Some(max_stored) = env_parse("BROKER_MAX_STORED") {
            self.server.max_stored = max_stored;
        }
        if let Some(max_age) = env_parse("BROKER_MAX_AGE_SECS") {
            self.server.max_age_secs = max_age;
        }
        if let Ok(path) = std::env::var("BROKER_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(enabled) = env_parse("BROKER_AUTH_ENABLED") {
            self.auth.enabled = enabled;
        }
        if let Some(method) = std::env::var("BROKER_AUTH_METHOD")
            .ok()
            .and_then(|v| AuthMethod::parse(&v))
        {
            self.auth.method = method;
        }
        if let Ok(secret) = std::env::var("BROKER_SIGNING_SECRET") {
            self.auth.signing_secret = secret;
        }
        self.rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Generate a hex-encoded secret from the OS CSPRNG.
///
/// Falls back to a SHA-256 digest of the current time when the CSPRNG is
/// unavailable; the degradation is logged so operators can rotate the secret.
pub fn generate_signing_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    match rand::rngs::OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => hex::encode(bytes),
        Err(err) => {
            tracing::warn!(error = %err, "CSPRNG unavailable, deriving secret from system time");
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            let digest = Sha256::digest(nanos.to_string().as_bytes());
            hex::encode(digest)
        }
    }
}
