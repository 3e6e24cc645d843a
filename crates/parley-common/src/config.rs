//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults
//!
//! [`init`] stores the loaded config for the lifetime of the binary. Library
//! code takes the relevant section by value so that several servers can live
//! in one process (integration tests run two or three of them side by side).

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Default server-to-server port.
pub const DEFAULT_S2S_PORT: u16 = 5269;

/// Initialize the global configuration from environment.
///
/// `path` overrides the default `config` file name (extension inferred by the
/// `config` crate). Should be called once at application startup.
pub fn init(path: Option<&str>) -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.domain", "localhost")?
        .set_default("server.hosted_domains", Vec::<String>::new())?
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", i64::from(DEFAULT_S2S_PORT))?
        .set_default("dialback.enabled", true)?
        .set_default("dialback.secret", "")?
        .set_default("dialback.read_timeout_secs", 20)?
        .set_default("federation.connect_timeout_secs", 10)?
        .set_default("federation.default_port", i64::from(DEFAULT_S2S_PORT))?
        .set_default("federation.permission_policy", "blacklist")?
        .set_default("federation.blacklist", Vec::<String>::new())?
        .set_default("federation.whitelist", Vec::<String>::new())?
        .set_default("federation.fallback_stop_suffixes", default_stop_suffixes())?
        .set_default("federation.stop_at_top_level", true)?
        .set_default("tls.enabled", false)?
        // Optional config file
        .add_source(config::File::with_name(path.unwrap_or("config")).required(path.is_some()))
        // Environment variables (PARLEY__SERVER__DOMAIN, PARLEY__DIALBACK__SECRET, etc.)
        .add_source(
            config::Environment::with_prefix("PARLEY")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dialback: DialbackConfig,
    #[serde(default)]
    pub federation: FederationPolicyConfig,
    #[serde(default)]
    pub tls: TlsConfig,
}

impl AppConfig {
    /// Parse a complete configuration from TOML text, defaults filling the gaps.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// The local server's own domain (e.g. "chat.example.com").
    pub domain: String,
    /// Extra locally recognized domains: virtual hosts and accepted subdomains.
    pub hosted_domains: Vec<String>,
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".into(),
            hosted_domains: Vec::new(),
            host: "0.0.0.0".into(),
            port: DEFAULT_S2S_PORT,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DialbackConfig {
    /// When false, dialback is neither offered to peers nor attempted.
    pub enabled: bool,
    /// Server-local dialback secret. Empty means "generate one at startup".
    pub secret: String,
    /// Bounded wait for stream headers and dialback answers.
    pub read_timeout_secs: u64,
}

impl Default for DialbackConfig {
    fn default() -> Self {
        Self { enabled: true, secret: String::new(), read_timeout_secs: 20 }
    }
}

/// Which remote servers may federate with us at all.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PermissionPolicy {
    /// Anyone except the blacklisted hosts.
    #[default]
    Blacklist,
    /// Only the whitelisted hosts.
    Whitelist,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FederationPolicyConfig {
    pub connect_timeout_secs: u64,
    pub default_port: u16,
    pub permission_policy: PermissionPolicy,
    pub blacklist: Vec<String>,
    pub whitelist: Vec<String>,
    /// Candidates equal to one of these end the subdomain-stripping fallback.
    pub fallback_stop_suffixes: Vec<String>,
    /// Also stop the fallback once the candidate is a single DNS label.
    pub stop_at_top_level: bool,
}

impl Default for FederationPolicyConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            default_port: DEFAULT_S2S_PORT,
            permission_policy: PermissionPolicy::Blacklist,
            blacklist: Vec::new(),
            whitelist: Vec::new(),
            fallback_stop_suffixes: default_stop_suffixes(),
            stop_at_top_level: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// Offer STARTTLS inbound and attempt TLS + SASL EXTERNAL outbound.
    pub enabled: bool,
    /// PEM certificate chain for this server's domain.
    pub cert_path: Option<String>,
    /// PEM private key (PKCS#8 or RSA) matching `cert_path`.
    pub key_path: Option<String>,
}

fn default_stop_suffixes() -> Vec<String> {
    ["com", "net", "org", "edu", "gov"].iter().map(|s| s.to_string()).collect()
}
