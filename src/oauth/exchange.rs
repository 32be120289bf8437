//! OAuth grant exchange against the token endpoint

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::token::Token;
use crate::credentials::{Credentials, Grant};
use crate::error::{TokenError, truncate_chars};

/// Maximum characters of an error body kept in a [`TokenError`]
const ERROR_BODY_LIMIT: usize = 500;

/// One OAuth exchange producing a fresh token
///
/// The broker only ever calls this while holding the single-flight marker,
/// so implementations need no coordination of their own.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Perform a full grant exchange
    async fn exchange(&self) -> Result<Token, TokenError>;
}

/// Token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<Value>,
}

/// Production exchange: form `POST` to the configured token endpoint
pub struct HttpTokenExchange {
    http_client: Client,
    credentials: Arc<Credentials>,
}

impl HttpTokenExchange {
    /// Create an exchange using the given HTTP client
    #[must_use]
    pub fn new(http_client: Client, credentials: Arc<Credentials>) -> Self {
        Self {
            http_client,
            credentials,
        }
    }

    fn form(&self) -> Vec<(&'static str, &str)> {
        let creds = &self.credentials;
        let mut params = vec![
            ("grant_type", creds.grant().grant_type()),
            ("client_id", creds.client_id()),
            ("client_secret", creds.client_secret().expose_secret()),
        ];
        if let Grant::Password { username, password } = creds.grant() {
            params.push(("username", username.as_str()));
            params.push(("password", password.expose_secret()));
        }
        if let Some(scope) = creds.scope() {
            params.push(("scope", scope));
        }
        params
    }
}

#[async_trait]
impl TokenExchange for HttpTokenExchange {
    async fn exchange(&self) -> Result<Token, TokenError> {
        let endpoint = self.credentials.token_endpoint();
        debug!(endpoint = %endpoint, grant = self.credentials.grant().grant_type(), "Requesting OAuth token");

        let response = self
            .http_client
            .post(endpoint.clone())
            .form(&self.form())
            .send()
            .await
            .map_err(|e| TokenError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TokenError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(TokenError::Rejected {
                status: status.as_u16(),
                body: truncate_chars(&body, ERROR_BODY_LIMIT),
            });
        }

        let token = parse_token_response(&body)?;
        info!(
            expires_in = token.remaining(token.obtained_at()).as_secs(),
            "OAuth token acquired"
        );
        Ok(token)
    }
}

/// Parse a token endpoint body
///
/// # Errors
///
/// Returns [`TokenError::Malformed`] when the body is not JSON or carries no
/// non-empty `access_token`.
pub fn parse_token_response(body: &str) -> Result<Token, TokenError> {
    let parsed: TokenResponse = serde_json::from_str(body)
        .map_err(|e| TokenError::Malformed(format!("invalid JSON: {e}")))?;

    let access_token = parsed
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| TokenError::Malformed("missing access_token".to_string()))?;

    Ok(Token::new(
        access_token,
        parsed.token_type.unwrap_or_else(|| "Bearer".to_string()),
        parsed.expires_in.as_ref().and_then(expires_in_secs),
    ))
}

/// Accept `expires_in` as an integer, float, or numeric string
#[allow(clippy::cast_possible_truncation)]
fn expires_in_secs(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
