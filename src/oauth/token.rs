//! Access token and the cache that holds it

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::{BoxFuture, Shared};
use secrecy::{ExposeSecret, SecretString};

use crate::error::TokenError;

/// Completion handle of a running exchange; late arrivals clone and await it
pub(crate) type InFlight = Shared<BoxFuture<'static, Result<Token, TokenError>>>;

/// OAuth access token
#[derive(Clone)]
pub struct Token {
    access_token: SecretString,
    token_type: String,
    obtained_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Token {
    /// Create a token obtained now
    ///
    /// A missing or non-positive `expires_in` yields a token that is already
    /// expired, so the next acquisition exchanges again.
    #[must_use]
    pub fn new(
        access_token: impl Into<String>,
        token_type: impl Into<String>,
        expires_in: Option<i64>,
    ) -> Self {
        let obtained_at = Utc::now();
        let lifetime = expires_in
            .filter(|secs| *secs > 0)
            .map_or_else(TimeDelta::zero, |secs| {
                TimeDelta::try_seconds(secs).unwrap_or(TimeDelta::MAX)
            });
        let expires_at = obtained_at
            .checked_add_signed(lifetime)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            access_token: SecretString::new(access_token.into().into()),
            token_type: token_type.into(),
            obtained_at,
            expires_at,
        }
    }

    /// Raw token value, for the `Authorization` header only
    #[must_use]
    pub fn secret(&self) -> &str {
        self.access_token.expose_secret()
    }

    /// Token type as reported by the token endpoint
    #[must_use]
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// When the exchange completed
    #[must_use]
    pub fn obtained_at(&self) -> DateTime<Utc> {
        self.obtained_at
    }

    /// Absolute expiry
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Lifetime left at `now`; zero once expired
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }

    /// Whether the token outlives `now` by more than `margin`
    #[must_use]
    pub fn is_fresh(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        self.remaining(now) > margin
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("obtained_at", &self.obtained_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Current token plus the marker of a running exchange
///
/// Owned by the broker behind a mutex; nothing else mutates it.
#[derive(Default)]
pub(crate) struct TokenCache {
    pub(crate) token: Option<Token>,
    pub(crate) in_flight: Option<InFlight>,
}

impl TokenCache {
    /// Cached token if it is still fresh beyond `margin`
    pub(crate) fn fresh(&self, margin: Duration) -> Option<Token> {
        let now = Utc::now();
        self.token
            .as_ref()
            .filter(|token| token.is_fresh(margin, now))
            .cloned()
    }
}
