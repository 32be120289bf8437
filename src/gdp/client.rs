//! GDP REST API client with bearer token injection
//!
//! Every call takes a token from the broker. A 401 from GDP forces one
//! refresh and one resend; a second 401 is reported, never retried.

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{AuthFailure, truncate_chars};
use crate::oauth::{Token, TokenBroker};
use crate::{Error, Result};

/// Characters of a non-JSON or error body kept in results
const BODY_LIMIT: usize = 2000;

/// Authenticated client for the GDP REST API
#[derive(Clone)]
pub struct GdpClient {
    http_client: Client,
    broker: TokenBroker,
    base_url: String,
    request_timeout: Duration,
}

impl GdpClient {
    /// Create a client rooted at `base_url`
    #[must_use]
    pub fn new(
        http_client: Client,
        broker: TokenBroker,
        base_url: &Url,
        request_timeout: Duration,
    ) -> Self {
        Self {
            http_client,
            broker,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
            request_timeout,
        }
    }

    /// Absolute URL for a resource path
    #[must_use]
    pub fn endpoint_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Call a GDP endpoint
    ///
    /// `params` go into the query string for `GET` and into a JSON body for
    /// every other method.
    ///
    /// # Errors
    ///
    /// - [`Error::Auth`] when no token can be obtained, or GDP rejects the
    ///   token again after a forced refresh
    /// - [`Error::Upstream`] for any other non-2xx status
    /// - [`Error::Network`] for transport failures
    pub async fn call(&self, method: &Method, path: &str, params: Option<&Value>) -> Result<Value> {
        let url = self.endpoint_url(path);
        debug!(%method, url = %url, "GDP request");

        let token = self.token(None).await?;
        let response = self.send(method, &url, params, &token).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return interpret(response).await;
        }

        info!(%method, path, "GDP rejected bearer token, refreshing and retrying once");
        let token = self.token(Some(&token)).await?;
        let response = self.send(method, &url, params, &token).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(%method, path, "GDP rejected freshly refreshed token");
            return Err(AuthFailure::Rejected {
                status: StatusCode::UNAUTHORIZED.as_u16(),
            }
            .into());
        }
        interpret(response).await
    }

    /// Current token, or a replacement for one GDP rejected
    async fn token(&self, rejected: Option<&Token>) -> Result<Token> {
        let token = match rejected {
            None => self.broker.acquire(false).await,
            Some(rejected) => self.broker.refresh_rejected(rejected).await,
        };
        token.map_err(|e| Error::Auth(AuthFailure::TokenAcquisition(e)))
    }

    async fn send(
        &self,
        method: &Method,
        url: &str,
        params: Option<&Value>,
        token: &Token,
    ) -> Result<Response> {
        let request = self
            .http_client
            .request(method.clone(), url)
            .bearer_auth(token.secret())
            .timeout(self.request_timeout);

        attach_params(request, method, params)?
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))
    }
}

fn attach_params(
    request: RequestBuilder,
    method: &Method,
    params: Option<&Value>,
) -> Result<RequestBuilder> {
    let Some(params) = params else {
        return Ok(request);
    };
    if *method != Method::GET {
        return Ok(request.json(params));
    }
    match params {
        Value::Null => Ok(request),
        Value::Object(map) => {
            let pairs: Vec<(&str, String)> = map
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.as_str(), query_value(v)))
                .collect();
            Ok(request.query(&pairs))
        }
        _ => Err(Error::json_rpc(
            crate::error::rpc_codes::INVALID_PARAMS,
            "GET parameters must be a JSON object",
        )),
    }
}

/// Strings go out verbatim, everything else as compact JSON
fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn interpret(response: Response) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::Network(e.to_string()))?;

    if !status.is_success() {
        return Err(Error::Upstream {
            status: status.as_u16(),
            body: truncate_chars(&body, BODY_LIMIT),
        });
    }

    if status == StatusCode::NO_CONTENT || body.trim().is_empty() {
        return Ok(json!({"status": "success", "http_code": status.as_u16()}));
    }

    Ok(serde_json::from_str(&body).unwrap_or_else(|_| {
        json!({
            "status": "success",
            "http_code": status.as_u16(),
            "body": truncate_chars(&body, BODY_LIMIT),
        })
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::credentials::Credentials;
    use crate::error::TokenError;
    use crate::oauth::HttpTokenExchange;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn token_body(token: &str) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .set_body_json(json!({"access_token": token, "expires_in": 3600, "token_type": "bearer"}))
    }

    fn client_with_base(server: &MockServer, base: &str) -> GdpClient {
        let creds = Arc::new(Credentials::new(
            "client",
            "secret",
            Url::parse(&format!("{}/oauth/token", server.uri())).unwrap(),
            Url::parse(base).unwrap(),
        ));
        let http = Client::new();
        let exchange = Arc::new(HttpTokenExchange::new(http.clone(), creds.clone()));
        let broker = TokenBroker::new(exchange, Duration::from_secs(30), Duration::from_secs(5));
        GdpClient::new(http, broker, creds.api_base_url(), Duration::from_secs(5))
    }

    fn client(server: &MockServer) -> GdpClient {
        client_with_base(server, &format!("{}/restAPI", server.uri()))
    }

    #[tokio::test]
    async fn reuses_cached_token_across_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(token_body("tA"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/restAPI/widgets"))
            .and(header("authorization", "Bearer tA"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
            .expect(2)
            .mount(&server)
            .await;

        let client = client(&server);
        let first = client.call(&Method::GET, "/widgets", None).await.unwrap();
        let second = client.call(&Method::GET, "widgets", None).await.unwrap();

        assert_eq!(first, json!([{"id": 1}]));
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn unauthorized_once_forces_refresh_and_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(token_body("tA"))
            .up_to_n_times(1)
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(token_body("tB"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/restAPI/widgets"))
            .and(header("authorization", "Bearer tA"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/restAPI/widgets"))
            .and(header("authorization", "Bearer tB"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let result = client(&server)
            .call(&Method::GET, "/widgets", None)
            .await
            .unwrap();
        assert_eq!(result, json!({"ok": true}));
    }

    #[tokio::test]
    async fn unauthorized_twice_is_auth_error_after_two_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(token_body("tA"))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/restAPI/widgets"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let err = client(&server)
            .call(&Method::GET, "/widgets", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Auth(AuthFailure::Rejected { status: 401 })
        ));
        assert_eq!(err.kind(), "AuthError");
    }

    #[tokio::test]
    async fn token_failure_is_auth_error_without_calling_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_client"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/restAPI/widgets"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = client(&server)
            .call(&Method::GET, "/widgets", None)
            .await
            .unwrap_err();
        match err {
            Error::Auth(AuthFailure::TokenAcquisition(TokenError::Rejected { status, .. })) => {
                assert_eq!(status, 400);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn other_failures_are_upstream_errors_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(token_body("tA"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/restAPI/widgets"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server)
            .call(&Method::DELETE, "/widgets", None)
            .await
            .unwrap_err();
        match err {
            Error::Upstream { status, body } => {
                assert_eq!(status, 403);
                assert_eq!(body, "forbidden");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_api_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(token_body("tA"))
            .mount(&server)
            .await;

        let err = client_with_base(&server, "http://127.0.0.1:1/restAPI")
            .call(&Method::GET, "/widgets", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn get_params_go_into_query_string() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(token_body("tA"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/restAPI/restapi"))
            .and(query_param("withParameters", "1"))
            .and(query_param("limit", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let params = json!({"withParameters": "1", "limit": 10, "skipped": null});
        client(&server)
            .call(&Method::GET, "restapi", Some(&params))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn other_methods_send_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(token_body("tA"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/restAPI/datasource"))
            .and(body_json(json!({"name": "db1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ID": 7})))
            .expect(1)
            .mount(&server)
            .await;

        let params = json!({"name": "db1"});
        let result = client(&server)
            .call(&Method::POST, "/datasource", Some(&params))
            .await
            .unwrap();
        assert_eq!(result, json!({"ID": 7}));
    }

    #[tokio::test]
    async fn empty_and_non_json_bodies_are_wrapped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(token_body("tA"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/restAPI/empty"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/restAPI/text"))
            .respond_with(ResponseTemplate::new(200).set_body_string("plain text"))
            .mount(&server)
            .await;

        let client = client(&server);
        let empty = client.call(&Method::PUT, "/empty", None).await.unwrap();
        assert_eq!(empty, json!({"status": "success", "http_code": 204}));

        let text = client.call(&Method::GET, "/text", None).await.unwrap();
        assert_eq!(
            text,
            json!({"status": "success", "http_code": 200, "body": "plain text"})
        );
    }

    #[test]
    fn endpoint_url_joins_single_slash() {
        let broker = TokenBroker::new(
            Arc::new(HttpTokenExchange::new(
                Client::new(),
                Arc::new(Credentials::new(
                    "c",
                    "s",
                    Url::parse("https://gdp/oauth/token").unwrap(),
                    Url::parse("https://gdp/restAPI/").unwrap(),
                )),
            )),
            Duration::from_secs(30),
            Duration::from_secs(5),
        );
        let client = GdpClient::new(
            Client::new(),
            broker,
            &Url::parse("https://gdp:8443/restAPI/").unwrap(),
            Duration::from_secs(5),
        );
        assert_eq!(client.endpoint_url("/group"), "https://gdp:8443/restAPI/group");
        assert_eq!(client.endpoint_url("group"), "https://gdp:8443/restAPI/group");
    }
}
