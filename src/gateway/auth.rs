//! Inbound authentication for the MCP gateway
//!
//! Every request outside the public paths must carry
//! `Authorization: Bearer <api key>`. The key is hashed and compared against
//! every configured digest in constant time. A rejected request never
//! reaches the token broker.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use subtle::{Choice, ConstantTimeEq};
use tracing::{debug, warn};

use crate::credentials::{ApiKey, Credentials, digest_key};
use crate::{Error, Result};

/// Who made an authenticated request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Configured name of the key holder
    pub name: String,
    /// Non-secret key fingerprint for audit logs
    pub fingerprint: String,
}

impl CallerIdentity {
    /// Identity attached to requests on public paths
    #[must_use]
    pub fn public() -> Self {
        Self {
            name: "public".to_string(),
            fingerprint: String::new(),
        }
    }
}

/// Validates inbound API keys
#[derive(Debug)]
pub struct InboundGuard {
    keys: Vec<ApiKey>,
    public_paths: Vec<String>,
}

impl InboundGuard {
    /// Create a guard over the given keys
    #[must_use]
    pub fn new(keys: Vec<ApiKey>, public_paths: Vec<String>) -> Self {
        Self { keys, public_paths }
    }

    /// Guard over the keys held by the credential store
    #[must_use]
    pub fn from_credentials(credentials: &Credentials, public_paths: Vec<String>) -> Self {
        Self::new(credentials.api_keys().to_vec(), public_paths)
    }

    /// Number of accepted keys
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Check if a path is public (bypasses auth)
    ///
    /// Matches the path itself or anything below it, so `/health` covers
    /// `/health/` but not `/healthz`.
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| {
            path == p
                || path
                    .strip_prefix(p.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// Resolve a presented key to the caller it belongs to
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] when the key is empty or matches no
    /// configured key.
    pub fn validate(&self, provided: &str) -> Result<CallerIdentity> {
        if provided.is_empty() {
            return Err(Error::Unauthorized);
        }

        let digest = digest_key(provided);
        let mut matched: Option<&ApiKey> = None;
        for key in &self.keys {
            let equal: Choice = key.digest()[..].ct_eq(&digest[..]);
            if bool::from(equal) && matched.is_none() {
                matched = Some(key);
            }
        }

        matched
            .map(|key| CallerIdentity {
                name: key.name().to_string(),
                fingerprint: key.fingerprint(),
            })
            .ok_or(Error::Unauthorized)
    }
}

/// Authentication middleware
///
/// Inserts the [`CallerIdentity`] into the request extensions.
pub async fn auth_middleware(
    State(guard): State<Arc<InboundGuard>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    if guard.is_public_path(&path) {
        debug!(path = %path, "Public path, skipping auth");
        request.extensions_mut().insert(CallerIdentity::public());
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(str::trim);

    let Some(token) = token else {
        warn!(path = %path, "Missing Authorization header");
        return unauthorized_response(
            "Missing Authorization header. Use: Authorization: Bearer <api key>",
        );
    };

    match guard.validate(token) {
        Ok(caller) => {
            debug!(caller = %caller.name, key = %caller.fingerprint, path = %path, "Authenticated request");
            request.extensions_mut().insert(caller);
            next.run(request).await
        }
        Err(_) => {
            warn!(path = %path, "Invalid API key");
            unauthorized_response("Invalid API key")
        }
    }
}

/// Create a 401 Unauthorized response
pub fn unauthorized_response(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(json!({
            "jsonrpc": "2.0",
            "error": {
                "code": Error::Unauthorized.to_rpc_code(),
                "message": message
            },
            "id": null
        })),
    )
        .into_response()
}
