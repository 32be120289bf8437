//! Configuration management

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before `${VAR}` expansion.
    /// Paths support ~ expansion. Loaded in order; variables already set win.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// GDP appliance and OAuth client configuration
    pub gdp: GdpConfig,
    /// Inbound API key configuration
    pub auth: AuthConfig,
    /// Endpoint catalog configuration
    pub catalog: CatalogConfig,
    /// Glue-layer retry configuration
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: vec![".env".to_string()],
            server: ServerConfig::default(),
            gdp: GdpConfig::default(),
            auth: AuthConfig::default(),
            catalog: CatalogConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Upper bound for a whole inbound request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8003,
            request_timeout: Duration::from_secs(180),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// OAuth grant used against the GDP token endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    /// `grant_type=client_credentials`
    #[default]
    ClientCredentials,
    /// `grant_type=password` with a GDP user
    Password,
}

impl GrantType {
    /// Wire value of the `grant_type` form field
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientCredentials => "client_credentials",
            Self::Password => "password",
        }
    }
}

/// GDP appliance connection and OAuth client configuration.
///
/// Credential fields default to `${GDP_*}` placeholders so a plain `.env`
/// file with `GDP_CLIENT_ID`, `GDP_CLIENT_SECRET`, ... is enough to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GdpConfig {
    /// Appliance host
    pub host: String,
    /// Appliance port
    pub port: u16,
    /// Host reachable from this process (NAT, tunnel); overrides `host`
    pub external_host: String,
    /// Port reachable from this process; overrides `port`
    pub external_port: Option<u16>,
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
    /// Grant type
    pub grant_type: GrantType,
    /// GDP user (password grant only)
    pub username: String,
    /// GDP user password (password grant only)
    pub password: String,
    /// Optional OAuth scope
    pub scope: String,
    /// Token endpoint override (default `https://{host}:{port}/oauth/token`)
    pub token_url: Option<String>,
    /// REST API base override (default `https://{host}:{port}/restAPI`)
    pub base_url: Option<String>,
    /// Verify the appliance TLS certificate
    pub verify_tls: bool,
    /// Timeout for one OAuth exchange
    #[serde(with = "humantime_serde")]
    pub token_timeout: Duration,
    /// Timeout for one REST API call
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Refresh tokens this long before they expire
    #[serde(with = "humantime_serde")]
    pub refresh_margin: Duration,
}

impl Default for GdpConfig {
    fn default() -> Self {
        Self {
            host: "${GDP_HOST:-localhost}".to_string(),
            port: 8443,
            external_host: "${GDP_EXTERNAL_HOST}".to_string(),
            external_port: None,
            client_id: "${GDP_CLIENT_ID}".to_string(),
            client_secret: "${GDP_CLIENT_SECRET}".to_string(),
            grant_type: GrantType::default(),
            username: "${GDP_USERNAME}".to_string(),
            password: "${GDP_PASSWORD}".to_string(),
            scope: String::new(),
            token_url: None,
            base_url: None,
            // Appliances ship with self-signed certificates
            verify_tls: false,
            token_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(120),
            refresh_margin: Duration::from_secs(30),
        }
    }
}

impl GdpConfig {
    /// Host used to reach the appliance
    #[must_use]
    pub fn effective_host(&self) -> &str {
        if self.external_host.is_empty() {
            &self.host
        } else {
            &self.external_host
        }
    }

    /// Port used to reach the appliance
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        self.external_port.unwrap_or(self.port)
    }

    /// `host:port` actually targeted
    #[must_use]
    pub fn target(&self) -> String {
        format!("{}:{}", self.effective_host(), self.effective_port())
    }

    /// OAuth token endpoint
    #[must_use]
    pub fn token_url(&self) -> String {
        self.token_url
            .clone()
            .unwrap_or_else(|| format!("https://{}/oauth/token", self.target()))
    }

    /// REST API base URL
    #[must_use]
    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}/restAPI", self.target()))
    }
}

/// Inbound API key configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Accepted API keys
    pub api_keys: Vec<ApiKeyConfig>,

    /// Paths that bypass authentication (default: `["/health"]`)
    pub public_paths: Vec<String>,
}

fn default_public_paths() -> Vec<String> {
    vec!["/health".to_string()]
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            public_paths: default_public_paths(),
        }
    }
}

/// One accepted API key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    /// Key value: literal, `env:VAR_NAME`, or `sha256:<hex digest>`
    pub key: String,

    /// Human-readable name for the key holder
    #[serde(default)]
    pub name: String,
}

impl ApiKeyConfig {
    /// Resolve the API key (expand `env:` references)
    #[must_use]
    pub fn resolve_key(&self) -> String {
        if let Some(var_name) = self.key.strip_prefix("env:") {
            env::var(var_name).unwrap_or_default()
        } else {
            self.key.clone()
        }
    }
}

/// Endpoint catalog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Where the discovered catalog is cached
    pub cache_path: PathBuf,
    /// Use the cache file when present instead of live discovery
    pub prefer_cache: bool,
    /// Maximum search results
    pub search_limit: usize,
    /// Truncate tool responses above this many characters
    pub max_response_chars: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            cache_path: PathBuf::from("gdp_discovery_with_params.json"),
            prefer_cache: true,
            search_limit: 25,
            max_response_chars: 30_000,
        }
    }
}

/// Retry configuration for tool invocations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries
    pub enabled: bool,
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Initial backoff duration
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
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

        // GDP_MCP_GDP__CLIENT_ID -> gdp.client_id
        figment = figment.merge(Env::prefixed("GDP_MCP_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in connection and credential fields
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        let gdp = &mut self.gdp;
        for value in [
            &mut gdp.host,
            &mut gdp.external_host,
            &mut gdp.client_id,
            &mut gdp.client_secret,
            &mut gdp.username,
            &mut gdp.password,
            &mut gdp.scope,
        ] {
            *value = Self::expand_string(&re, value);
        }
        for value in [&mut gdp.token_url, &mut gdp.base_url].into_iter().flatten() {
            *value = Self::expand_string(&re, value);
        }

        for key in &mut self.auth.api_keys {
            key.key = Self::expand_string(&re, &key.key);
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Human-readable serde module for `Duration` ("30s", "5m", "250ms")
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// YAML and environment values arrive either as numbers or as strings
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(u64),
        Text(String),
    }

    /// Deserialize a human-readable duration string or a number of seconds
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawDuration::deserialize(deserializer)? {
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::Text(s) => parse(&s).map_err(serde::de::Error::custom),
        }
    }

    /// Parse "30s", "5m", "250ms" or a bare number of seconds
    pub(crate) fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" before "s": "100ms" also ends with 's'
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim().parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim().parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim()
                .parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
