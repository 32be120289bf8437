//! Error types for the GDP MCP Gateway

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for the GDP MCP Gateway
pub type Result<T> = std::result::Result<T, Error>;

/// GDP MCP Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Inbound API key missing, empty, or unknown
    #[error("Unauthorized: invalid or missing API key")]
    Unauthorized,

    /// Vendor authentication failed for this call
    #[error("GDP authentication failed: {0}")]
    Auth(#[from] AuthFailure),

    /// Vendor API rejected the call for a reason unrelated to authentication
    #[error("GDP returned HTTP {status}: {body}")]
    Upstream {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// Transport-level failure talking to the vendor API
    #[error("Network error: {0}")]
    Network(String),

    /// No endpoint catalog could be loaded
    #[error("Endpoint catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// JSON-RPC error
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// Error code
        code: i32,
        /// Error message
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of a single OAuth exchange.
///
/// `Clone` because one failed exchange is delivered to every caller that was
/// waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Token endpoint could not be reached
    #[error("token endpoint unreachable: {0}")]
    Network(String),

    /// Token endpoint answered with a non-2xx status
    #[error("token endpoint returned HTTP {status}: {body}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// Response was not a usable token payload
    #[error("malformed token response: {0}")]
    Malformed(String),

    /// Exchange exceeded its deadline
    #[error("token exchange timed out after {0:?}")]
    Timeout(Duration),

    /// Exchange task ended without producing a result
    #[error("token exchange aborted: {0}")]
    Aborted(String),
}

/// Why a vendor call could not be authenticated
#[derive(Error, Debug)]
pub enum AuthFailure {
    /// No bearer token could be obtained
    #[error(transparent)]
    TokenAcquisition(TokenError),

    /// The vendor rejected a freshly refreshed token as well
    #[error("token rejected by GDP after forced refresh (HTTP {status})")]
    Rejected {
        /// HTTP status of the second rejection
        status: u16,
    },
}

impl Error {
    /// Create a JSON-RPC error
    pub fn json_rpc(code: i32, message: impl Into<String>) -> Self {
        Self::JsonRpc {
            code,
            message: message.into(),
        }
    }

    /// Caller-facing error category
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized => "Unauthorized",
            Self::Auth(_) => "AuthError",
            Self::Upstream { .. } => "UpstreamError",
            Self::Network(_) => "NetworkError",
            Self::CatalogUnavailable(_) => "CatalogError",
            Self::Config(_) => "ConfigError",
            _ => "InternalError",
        }
    }

    /// Whether the glue layer may retry the operation with backoff.
    ///
    /// Token acquisition failures happen before any vendor call is sent, so
    /// they are always safe to retry. Network failures are retryable, but the
    /// caller still decides whether the request itself is idempotent.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Auth(AuthFailure::TokenAcquisition(_))
        )
    }

    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::JsonRpc { code, .. } => *code,
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::Unauthorized => -32001,
            Self::Auth(_) => -32002,
            Self::Upstream { .. } | Self::Network(_) | Self::CatalogUnavailable(_) => {
                rpc_codes::SERVER_ERROR_START
            }
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }
}

/// First `max` characters of `text`, respecting char boundaries
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Standard JSON-RPC error codes
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Server error range start
    pub const SERVER_ERROR_START: i32 = -32000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_distinguish_caller_facing_categories() {
        assert_eq!(Error::Unauthorized.kind(), "Unauthorized");
        assert_eq!(
            Error::Auth(AuthFailure::Rejected { status: 401 }).kind(),
            "AuthError"
        );
        assert_eq!(
            Error::Auth(AuthFailure::TokenAcquisition(TokenError::Malformed("x".into()))).kind(),
            "AuthError"
        );
        assert_eq!(
            Error::Upstream {
                status: 404,
                body: String::new()
            }
            .kind(),
            "UpstreamError"
        );
        assert_eq!(Error::Network("refused".into()).kind(), "NetworkError");
    }

    #[test]
    fn only_transport_and_token_failures_are_retryable() {
        assert!(Error::Network("timeout".into()).is_retryable());
        assert!(
            Error::Auth(AuthFailure::TokenAcquisition(TokenError::Timeout(
                Duration::from_secs(1)
            )))
            .is_retryable()
        );
        assert!(!Error::Auth(AuthFailure::Rejected { status: 401 }).is_retryable());
        assert!(
            !Error::Upstream {
                status: 500,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(!Error::Unauthorized.is_retryable());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn rpc_codes_for_parse_and_internal_errors() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(Error::Json(parse).to_rpc_code(), rpc_codes::PARSE_ERROR);
        assert_eq!(
            Error::Internal("x".into()).to_rpc_code(),
            rpc_codes::INTERNAL_ERROR
        );
        assert_eq!(Error::json_rpc(-32602, "bad").to_rpc_code(), -32602);
    }
}
