//! Credential store
//!
//! Everything needed to authenticate in both directions, fixed at startup:
//! the inbound API keys (kept only as SHA-256 digests), the OAuth client
//! credentials and the two GDP URLs. Nothing here is mutated after
//! construction; share it behind an `Arc`.

use std::fmt;

use secrecy::SecretString;
use sha2::{Digest, Sha256};
use url::Url;

use crate::config::{ApiKeyConfig, AuthConfig, GdpConfig, GrantType};
use crate::{Error, Result};

/// Immutable credential set for the process lifetime
#[derive(Debug)]
pub struct Credentials {
    api_keys: Vec<ApiKey>,
    client_id: String,
    client_secret: SecretString,
    grant: Grant,
    scope: Option<String>,
    token_endpoint: Url,
    api_base_url: Url,
}

/// OAuth grant and its grant-specific secrets
#[derive(Debug)]
pub enum Grant {
    /// Service authenticates as itself
    ClientCredentials,
    /// Vendor password grant on behalf of one configured GDP user
    Password {
        /// GDP user name
        username: String,
        /// GDP user password
        password: SecretString,
    },
}

impl Grant {
    /// Wire value of `grant_type`
    #[must_use]
    pub fn grant_type(&self) -> &'static str {
        match self {
            Self::ClientCredentials => GrantType::ClientCredentials.as_str(),
            Self::Password { .. } => GrantType::Password.as_str(),
        }
    }
}

impl Credentials {
    /// Create a credential set for a client-credentials grant
    #[must_use]
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_endpoint: Url,
        api_base_url: Url,
    ) -> Self {
        Self {
            api_keys: Vec::new(),
            client_id: client_id.into(),
            client_secret: SecretString::new(client_secret.into().into()),
            grant: Grant::ClientCredentials,
            scope: None,
            token_endpoint,
            api_base_url,
        }
    }

    /// Accept an inbound API key
    #[must_use]
    pub fn with_api_key(mut self, name: impl Into<String>, raw_key: &str) -> Self {
        self.api_keys.push(ApiKey::from_raw(name, raw_key));
        self
    }

    /// Use a different grant
    #[must_use]
    pub fn with_grant(mut self, grant: Grant) -> Self {
        self.grant = grant;
        self
    }

    /// Request a scope with every exchange
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Build the credential set from configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the OAuth client is incomplete, a URL does
    /// not parse, or an API key entry resolves to nothing usable.
    pub fn from_config(gdp: &GdpConfig, auth: &AuthConfig) -> Result<Self> {
        if gdp.client_id.is_empty() {
            return Err(Error::Config(
                "gdp.client_id is empty (set GDP_CLIENT_ID)".to_string(),
            ));
        }
        if gdp.client_secret.is_empty() {
            return Err(Error::Config(
                "gdp.client_secret is empty (set GDP_CLIENT_SECRET)".to_string(),
            ));
        }

        let grant = match gdp.grant_type {
            GrantType::ClientCredentials => Grant::ClientCredentials,
            GrantType::Password => {
                if gdp.username.is_empty() || gdp.password.is_empty() {
                    return Err(Error::Config(
                        "password grant requires gdp.username and gdp.password".to_string(),
                    ));
                }
                Grant::Password {
                    username: gdp.username.clone(),
                    password: SecretString::new(gdp.password.clone().into()),
                }
            }
        };

        let token_endpoint = parse_url("gdp.token_url", &gdp.token_url())?;
        let api_base_url = parse_url("gdp.base_url", &gdp.base_url())?;

        let api_keys = auth
            .api_keys
            .iter()
            .enumerate()
            .map(|(index, key)| ApiKey::from_config(key, index))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            api_keys,
            client_id: gdp.client_id.clone(),
            client_secret: SecretString::new(gdp.client_secret.clone().into()),
            grant,
            scope: (!gdp.scope.is_empty()).then(|| gdp.scope.clone()),
            token_endpoint,
            api_base_url,
        })
    }

    /// Accepted inbound keys
    #[must_use]
    pub fn api_keys(&self) -> &[ApiKey] {
        &self.api_keys
    }

    /// OAuth client id
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// OAuth client secret
    #[must_use]
    pub fn client_secret(&self) -> &SecretString {
        &self.client_secret
    }

    /// Grant used for every exchange
    #[must_use]
    pub fn grant(&self) -> &Grant {
        &self.grant
    }

    /// Requested scope, if any
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// OAuth token endpoint
    #[must_use]
    pub fn token_endpoint(&self) -> &Url {
        &self.token_endpoint
    }

    /// GDP REST API base URL
    #[must_use]
    pub fn api_base_url(&self) -> &Url {
        &self.api_base_url
    }
}

fn parse_url(field: &str, value: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| Error::Config(format!("{field} '{value}' is not a URL: {e}")))
}

/// One accepted inbound API key, stored as a SHA-256 digest
#[derive(Clone)]
pub struct ApiKey {
    name: String,
    digest: [u8; 32],
}

impl ApiKey {
    /// Hash a raw key
    #[must_use]
    pub fn from_raw(name: impl Into<String>, raw_key: &str) -> Self {
        Self {
            name: name.into(),
            digest: digest_key(raw_key),
        }
    }

    /// Build from a configuration entry (literal, `env:VAR`, or `sha256:<hex>`)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty key or a malformed digest.
    pub fn from_config(config: &ApiKeyConfig, index: usize) -> Result<Self> {
        let name = if config.name.is_empty() {
            format!("key-{}", index + 1)
        } else {
            config.name.clone()
        };

        if let Some(hex_digest) = config.key.strip_prefix("sha256:") {
            let bytes = hex::decode(hex_digest.trim()).map_err(|e| {
                Error::Config(format!("api key '{name}': invalid sha256 digest: {e}"))
            })?;
            let digest: [u8; 32] = bytes.try_into().map_err(|_| {
                Error::Config(format!(
                    "api key '{name}': sha256 digest must be 64 hex characters"
                ))
            })?;
            return Ok(Self { name, digest });
        }

        let raw = config.resolve_key();
        if raw.is_empty() {
            return Err(Error::Config(format!(
                "api key '{name}' is empty (unset environment variable?)"
            )));
        }
        Ok(Self::from_raw(name, &raw))
    }

    /// Holder name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Digest of the key
    #[must_use]
    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// Short, non-secret identifier for logs
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.digest[..4])
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey")
            .field("name", &self.name)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// SHA-256 of a raw API key
#[must_use]
pub fn digest_key(raw_key: &str) -> [u8; 32] {
    let hash = Sha256::digest(raw_key.as_bytes());
    let mut digest = [0u8; 32];
    digest.copy_from_slice(hash.as_slice());
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn gdp_config() -> GdpConfig {
        GdpConfig {
            host: "gdp.local".to_string(),
            external_host: String::new(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            username: String::new(),
            password: String::new(),
            ..Default::default()
        }
    }

    fn key(name: &str, key: &str) -> ApiKeyConfig {
        ApiKeyConfig {
            key: key.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn builds_from_config() {
        let auth = AuthConfig {
            api_keys: vec![key("alice", "k1")],
            ..Default::default()
        };
        let creds = Credentials::from_config(&gdp_config(), &auth).unwrap();

        assert_eq!(creds.client_id(), "client");
        assert_eq!(
            creds.token_endpoint().as_str(),
            "https://gdp.local:8443/oauth/token"
        );
        assert_eq!(creds.api_base_url().as_str(), "https://gdp.local:8443/restAPI");
        assert_eq!(creds.grant().grant_type(), "client_credentials");
        assert_eq!(creds.api_keys()[0].name(), "alice");
        assert_eq!(creds.api_keys()[0].digest(), &digest_key("k1"));
    }

    #[test]
    fn rejects_missing_client_secret() {
        let gdp = GdpConfig {
            client_secret: String::new(),
            ..gdp_config()
        };
        let err = Credentials::from_config(&gdp, &AuthConfig::default()).unwrap_err();
        assert!(err.to_string().contains("client_secret"));
    }

    #[test]
    fn password_grant_requires_user() {
        let gdp = GdpConfig {
            grant_type: GrantType::Password,
            ..gdp_config()
        };
        assert!(Credentials::from_config(&gdp, &AuthConfig::default()).is_err());

        let gdp = GdpConfig {
            grant_type: GrantType::Password,
            username: "admin".to_string(),
            password: "pw".to_string(),
            ..gdp_config()
        };
        let creds = Credentials::from_config(&gdp, &AuthConfig::default()).unwrap();
        assert_eq!(creds.grant().grant_type(), "password");
    }

    #[test]
    fn accepts_pre_hashed_keys() {
        let hex_digest = hex::encode(digest_key("raw-key"));
        let api_key = ApiKey::from_config(&key("bob", &format!("sha256:{hex_digest}")), 0).unwrap();
        assert_eq!(api_key.digest(), &digest_key("raw-key"));
    }

    #[test]
    fn rejects_short_digest_and_empty_key() {
        assert!(ApiKey::from_config(&key("bob", "sha256:abcd"), 0).is_err());
        assert!(ApiKey::from_config(&key("bob", "sha256:not-hex"), 0).is_err());
        assert!(ApiKey::from_config(&key("bob", ""), 0).is_err());
        assert!(ApiKey::from_config(&key("bob", "env:GDP_MCP_TEST_DEFINITELY_UNSET"), 0).is_err());
    }

    #[test]
    fn unnamed_keys_get_positional_names() {
        let api_key = ApiKey::from_config(&key("", "k"), 2).unwrap();
        assert_eq!(api_key.name(), "key-3");
    }

    #[test]
    fn debug_output_hides_secrets() {
        let creds = Credentials::new(
            "client",
            "super-secret-value",
            Url::parse("https://gdp/oauth/token").unwrap(),
            Url::parse("https://gdp/restAPI").unwrap(),
        )
        .with_api_key("alice", "raw-api-key");
        let debug = format!("{creds:?}");
        assert!(!debug.contains("super-secret-value"));
        assert!(!debug.contains("raw-api-key"));
        assert!(debug.contains("alice"));
    }
}
