//! Validated configuration consumed by the server and client. Loading
//! (TOML files, CLI flags) happens outside the core; the binaries map
//! environment variables onto these structs.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 1965;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind.
    pub host: String,
    pub port: u16,
    /// Name presented in generated certificates (CN/SAN).
    pub hostname: String,
    pub document_root: PathBuf,
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
    pub max_file_size: u64,
    pub require_client_cert: bool,
    pub min_tls_version: TlsVersion,
    pub request_timeout: Duration,
    pub drain_timeout: Duration,
    pub default_indices: Vec<String>,
    pub enable_directory_listing: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            hostname: "localhost".to_string(),
            document_root: PathBuf::from("content"),
            certfile: None,
            keyfile: None,
            max_file_size: 10 * 1024 * 1024,
            require_client_cert: false,
            min_tls_version: TlsVersion::Tls12,
            request_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            default_indices: vec!["index.gmi".to_string(), "index.gemini".to_string()],
            enable_directory_listing: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub capacity: u32,
    /// Tokens per second.
    pub refill_rate: f64,
    /// Seconds reported in the 44 meta.
    pub retry_after: u32,
    /// Buckets idle longer than this are dropped by the sweeper.
    pub idle_eviction: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: 20,
            refill_rate: 2.0,
            retry_after: 30,
            idle_eviction: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessControlConfig {
    pub enabled: bool,
    /// CIDR blocks or single addresses.
    pub allow_list: Vec<String>,
    pub deny_list: Vec<String>,
    pub default_allow: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRuleConfig {
    pub prefix: String,
    pub require_cert: bool,
    /// Empty means any certificate is accepted.
    pub allowed_fingerprints: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertAuthConfig {
    /// Scanned in order; the first prefix match wins. Put specific
    /// prefixes (including public holes) before broader ones.
    pub paths: Vec<PathRuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitanConfig {
    pub enabled: bool,
    pub upload_dir: PathBuf,
    pub max_upload_size: u64,
    /// None accepts any MIME type.
    pub allowed_mime_types: Option<Vec<String>>,
    /// None disables token authentication.
    pub auth_tokens: Option<Vec<String>>,
    pub enable_delete: bool,
}

impl Default for TitanConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            upload_dir: PathBuf::from("uploads"),
            max_upload_size: 10 * 1024 * 1024,
            allowed_mime_types: None,
            auth_tokens: None,
            enable_delete: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log a short digest instead of the raw client address.
    pub hash_ips: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub rate_limit: RateLimitConfig,
    pub access_control: AccessControlConfig,
    pub certificate_auth: CertAuthConfig,
    pub titan: TitanConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must not be 0".into()));
        }
        if self.server.host.is_empty() {
            return Err(ConfigError::Invalid("server.host must not be empty".into()));
        }
        if self.server.hostname.is_empty() {
            return Err(ConfigError::Invalid(
                "server.hostname must not be empty".into(),
            ));
        }
        if self.server.document_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "server.document_root must not be empty".into(),
            ));
        }
        if self.rate_limit.enabled {
            if self.rate_limit.capacity == 0 {
                return Err(ConfigError::Invalid(
                    "rate_limit.capacity must be at least 1".into(),
                ));
            }
            if self.rate_limit.refill_rate <= 0.0 {
                return Err(ConfigError::Invalid(
                    "rate_limit.refill_rate must be positive".into(),
                ));
            }
        }
        for rule in &self.certificate_auth.paths {
            if !rule.prefix.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "certificate_auth prefix {:?} must start with '/'",
                    rule.prefix
                )));
            }
        }
        if self.titan.enabled && self.titan.upload_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "titan.upload_dir must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Client session knobs. With no `tofu_path` the pins live in memory
/// only and are gone when the client is dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub max_redirects: u32,
    pub follow_redirects: bool,
    pub trust_on_first_use: bool,
    pub tofu_path: Option<PathBuf>,
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
    pub max_response_size: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_redirects: 5,
            follow_redirects: true,
            trust_on_first_use: true,
            tofu_path: None,
            certfile: None,
            keyfile: None,
            max_response_size: 10 * 1024 * 1024,
        }
    }
}
