//! Single-flight token broker
//!
//! Hands out the cached token while it is fresh and otherwise runs exactly one
//! OAuth exchange, however many callers ask at once. The exchange runs in its
//! own task, so a caller that gives up waiting does not cancel it; the token
//! still lands in the cache for the next caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::exchange::TokenExchange;
use super::token::{InFlight, Token, TokenCache};
use crate::error::TokenError;

/// Shared token broker; cheap to clone
#[derive(Clone)]
pub struct TokenBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    exchange: Arc<dyn TokenExchange>,
    cache: Mutex<TokenCache>,
    refresh_margin: Duration,
    exchange_timeout: Duration,
}

impl TokenBroker {
    /// Create a broker over an exchange implementation
    ///
    /// Tokens expiring within `refresh_margin` are treated as expired. A single
    /// exchange is abandoned after `exchange_timeout`.
    #[must_use]
    pub fn new(
        exchange: Arc<dyn TokenExchange>,
        refresh_margin: Duration,
        exchange_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                exchange,
                cache: Mutex::new(TokenCache::default()),
                refresh_margin,
                exchange_timeout,
            }),
        }
    }

    /// Return a usable token
    ///
    /// Without `force_refresh` a cached token that is fresh beyond the margin
    /// is returned without any network traffic. Otherwise the caller joins the
    /// running exchange or starts one. Every caller joined to the same
    /// exchange sees the same token or the same failure.
    ///
    /// # Errors
    ///
    /// Returns the [`TokenError`] of the exchange this call waited on. A
    /// failure never replaces a cached token.
    pub async fn acquire(&self, force_refresh: bool) -> Result<Token, TokenError> {
        self.acquire_newer_than(force_refresh, None).await
    }

    /// Replace a token the vendor rejected
    ///
    /// A fresh cached token obtained after `rejected` is returned as is; the
    /// rejection was already answered by another caller's exchange. Otherwise
    /// behaves like a forced [`acquire`](Self::acquire).
    ///
    /// # Errors
    ///
    /// Returns the [`TokenError`] of the exchange this call waited on.
    pub async fn refresh_rejected(&self, rejected: &Token) -> Result<Token, TokenError> {
        self.acquire_newer_than(true, Some(rejected.obtained_at())).await
    }

    async fn acquire_newer_than(
        &self,
        force_refresh: bool,
        rejected_at: Option<DateTime<Utc>>,
    ) -> Result<Token, TokenError> {
        let in_flight = {
            let mut cache = self.inner.cache.lock();
            let fresh = cache.fresh(self.inner.refresh_margin);
            if let Some(token) = fresh {
                match rejected_at {
                    None if !force_refresh => return Ok(token),
                    Some(at) if token.obtained_at() > at => {
                        debug!("Cached token is newer than the rejected one");
                        return Ok(token);
                    }
                    _ => {}
                }
            }
            match &cache.in_flight {
                Some(running) => {
                    debug!(force_refresh, "Joining in-flight token exchange");
                    running.clone()
                }
                None => {
                    debug!(force_refresh, "Starting token exchange");
                    let running = self.spawn_exchange();
                    cache.in_flight = Some(running.clone());
                    running
                }
            }
        };

        in_flight.await
    }

    /// Expiry of the cached token, if any
    #[must_use]
    pub fn cached_expiry(&self) -> Option<DateTime<Utc>> {
        self.inner
            .cache
            .lock()
            .token
            .as_ref()
            .map(Token::expires_at)
    }

    /// Whether an exchange is currently running
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.inner.cache.lock().in_flight.is_some()
    }

    /// Must be called with the cache lock held, before the marker is stored.
    /// The task blocks on that lock when it completes, so it can never clear
    /// the marker before it has been set.
    fn spawn_exchange(&self) -> InFlight {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let guard = InFlightGuard {
                inner: Arc::clone(&inner),
                armed: true,
            };
            let result =
                match tokio::time::timeout(inner.exchange_timeout, inner.exchange.exchange()).await
                {
                    Ok(result) => result,
                    Err(_) => Err(TokenError::Timeout(inner.exchange_timeout)),
                };
            if let Err(e) = &result {
                warn!(error = %e, "Token exchange failed");
            }
            guard.complete(&result);
            result
        });

        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(TokenError::Aborted(e.to_string())))
        }
        .boxed()
        .shared()
    }
}

/// Clears the in-flight marker when the exchange task ends, including by
/// panic or abort
struct InFlightGuard {
    inner: Arc<BrokerInner>,
    armed: bool,
}

impl InFlightGuard {
    /// Store a successful token and clear the marker in one critical section
    fn complete(mut self, result: &Result<Token, TokenError>) {
        let mut cache = self.inner.cache.lock();
        if let Ok(token) = result {
            cache.token = Some(token.clone());
        }
        cache.in_flight = None;
        drop(cache);
        self.armed = false;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner.cache.lock().in_flight = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::future::join_all;
    use pretty_assertions::assert_eq;

    const MARGIN: Duration = Duration::from_secs(30);
    const TIMEOUT: Duration = Duration::from_secs(5);

    type Script = dyn Fn(usize) -> Result<Token, TokenError> + Send + Sync;

    /// Counts exchanges and answers according to a script of the call index
    struct FakeExchange {
        calls: AtomicUsize,
        delay: Duration,
        script: Box<Script>,
    }

    impl FakeExchange {
        fn new(
            delay: Duration,
            script: impl Fn(usize) -> Result<Token, TokenError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                script: Box::new(script),
            })
        }

        fn lasting(delay: Duration, expires_in: i64) -> Arc<Self> {
            Self::new(delay, move |n| {
                Ok(Token::new(format!("t{n}"), "Bearer", Some(expires_in)))
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenExchange for FakeExchange {
        async fn exchange(&self) -> Result<Token, TokenError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.script)(n)
        }
    }

    fn broker(exchange: &Arc<FakeExchange>) -> TokenBroker {
        TokenBroker::new(exchange.clone(), MARGIN, TIMEOUT)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquire_performs_one_exchange() {
        let exchange = FakeExchange::lasting(Duration::from_millis(50), 3600);
        let broker = broker(&exchange);

        let results = join_all((0..32).map(|_| {
            let broker = broker.clone();
            tokio::spawn(async move { broker.acquire(false).await })
        }))
        .await;

        assert_eq!(exchange.calls(), 1);
        for result in results {
            assert_eq!(result.unwrap().unwrap().secret(), "t0");
        }
        assert!(!broker.is_refreshing());
    }

    #[tokio::test]
    async fn fresh_token_is_served_from_cache() {
        let exchange = FakeExchange::lasting(Duration::ZERO, 3600);
        let broker = broker(&exchange);

        let first = broker.acquire(false).await.unwrap();
        let second = broker.acquire(false).await.unwrap();

        assert_eq!(exchange.calls(), 1);
        assert_eq!(first.secret(), second.secret());
        assert_eq!(broker.cached_expiry(), Some(first.expires_at()));
    }

    #[tokio::test]
    async fn token_within_margin_is_refreshed() {
        let exchange = FakeExchange::lasting(Duration::ZERO, 10);
        let broker = broker(&exchange);

        assert_eq!(broker.acquire(false).await.unwrap().secret(), "t0");
        assert_eq!(broker.acquire(false).await.unwrap().secret(), "t1");
        assert_eq!(exchange.calls(), 2);
    }

    #[tokio::test]
    async fn zero_lifetime_token_is_refreshed_next_time() {
        let exchange = FakeExchange::new(Duration::ZERO, |n| {
            Ok(Token::new(format!("t{n}"), "Bearer", None))
        });
        let broker = TokenBroker::new(exchange.clone(), Duration::ZERO, TIMEOUT);

        broker.acquire(false).await.unwrap();
        broker.acquire(false).await.unwrap();
        assert_eq!(exchange.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn forced_refreshes_collapse_into_one_exchange() {
        let exchange = FakeExchange::lasting(Duration::from_millis(50), 3600);
        let broker = broker(&exchange);
        broker.acquire(false).await.unwrap();

        let results = join_all((0..8).map(|_| {
            let broker = broker.clone();
            tokio::spawn(async move { broker.acquire(true).await })
        }))
        .await;

        assert_eq!(exchange.calls(), 2);
        for result in results {
            assert_eq!(result.unwrap().unwrap().secret(), "t1");
        }
        assert_eq!(broker.acquire(false).await.unwrap().secret(), "t1");
    }

    #[tokio::test]
    async fn late_rejection_reuses_newer_token() {
        let exchange = FakeExchange::lasting(Duration::from_millis(5), 3600);
        let broker = broker(&exchange);

        let stale = broker.acquire(false).await.unwrap();
        let first = broker.refresh_rejected(&stale).await.unwrap();
        assert_eq!(first.secret(), "t1");

        // Another caller that was rejected with the same stale token
        let second = broker.refresh_rejected(&stale).await.unwrap();
        assert_eq!(second.secret(), "t1");
        assert_eq!(exchange.calls(), 2);

        // Rejecting the current token does exchange again
        let third = broker.refresh_rejected(&second).await.unwrap();
        assert_eq!(third.secret(), "t2");
        assert_eq!(exchange.calls(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_rejections_of_one_token_exchange_once() {
        let exchange = FakeExchange::lasting(Duration::from_millis(20), 3600);
        let broker = broker(&exchange);
        let stale = broker.acquire(false).await.unwrap();

        let results = join_all((0..16).map(|i| {
            let broker = broker.clone();
            let stale = stale.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(i * 5)).await;
                broker.refresh_rejected(&stale).await
            })
        }))
        .await;

        assert_eq!(exchange.calls(), 2);
        for result in results {
            assert_eq!(result.unwrap().unwrap().secret(), "t1");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failure_is_shared_and_not_cached() {
        let exchange = FakeExchange::new(Duration::from_millis(50), |n| {
            if n == 0 {
                Err(TokenError::Rejected {
                    status: 500,
                    body: "down".to_string(),
                })
            } else {
                Ok(Token::new("recovered", "Bearer", Some(3600)))
            }
        });
        let broker = broker(&exchange);

        let results = join_all((0..8).map(|_| {
            let broker = broker.clone();
            tokio::spawn(async move { broker.acquire(false).await })
        }))
        .await;

        assert_eq!(exchange.calls(), 1);
        for result in results {
            assert_eq!(
                result.unwrap().unwrap_err(),
                TokenError::Rejected {
                    status: 500,
                    body: "down".to_string()
                }
            );
        }
        assert!(broker.cached_expiry().is_none());

        assert_eq!(broker.acquire(false).await.unwrap().secret(), "recovered");
        assert_eq!(exchange.calls(), 2);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_token() {
        let exchange = FakeExchange::new(Duration::ZERO, |n| {
            if n == 0 {
                Ok(Token::new("t0", "Bearer", Some(3600)))
            } else {
                Err(TokenError::Network("refused".to_string()))
            }
        });
        let broker = broker(&exchange);

        let original = broker.acquire(false).await.unwrap();
        assert!(broker.acquire(true).await.is_err());
        assert_eq!(broker.acquire(false).await.unwrap().secret(), original.secret());
    }

    #[tokio::test]
    async fn hung_exchange_times_out_and_clears_marker() {
        let exchange = FakeExchange::lasting(Duration::from_secs(10), 3600);
        let broker = TokenBroker::new(exchange.clone(), MARGIN, Duration::from_millis(50));

        let err = broker.acquire(false).await.unwrap_err();
        assert_eq!(err, TokenError::Timeout(Duration::from_millis(50)));
        assert!(!broker.is_refreshing());
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_cancel_exchange() {
        let exchange = FakeExchange::lasting(Duration::from_millis(100), 3600);
        let broker = broker(&exchange);

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.acquire(false).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        assert_eq!(broker.acquire(false).await.unwrap().secret(), "t0");
        assert_eq!(exchange.calls(), 1);
    }

    #[tokio::test]
    async fn panicking_exchange_fails_waiters_and_clears_marker() {
        let exchange = FakeExchange::new(Duration::ZERO, |n| {
            assert!(n > 0, "exchange blew up");
            Ok(Token::new("after-panic", "Bearer", Some(3600)))
        });
        let broker = broker(&exchange);

        let err = broker.acquire(false).await.unwrap_err();
        assert!(matches!(err, TokenError::Aborted(_)));
        assert!(!broker.is_refreshing());

        assert_eq!(broker.acquire(false).await.unwrap().secret(), "after-panic");
    }
}
