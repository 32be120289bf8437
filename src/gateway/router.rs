//! HTTP router and handlers

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde_json::{Value, json};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, warn};

use super::auth::{CallerIdentity, InboundGuard, auth_middleware, unauthorized_response};
use super::tools::{GdpTools, INSTRUCTIONS, build_tools};
use crate::Error;
use crate::error::rpc_codes;
use crate::oauth::TokenBroker;
use crate::protocol::{
    Info, InitializeParams, InitializeResult, JsonRpcResponse, RequestId, ServerCapabilities,
    ToolsCapability, ToolsListResult, negotiate_version,
};

/// Shared application state
pub struct AppState {
    /// MCP tool handler
    pub tools: GdpTools,
    /// Inbound API key guard
    pub guard: Arc<InboundGuard>,
    /// Token broker, for health reporting
    pub broker: TokenBroker,
    /// `host:port` of the appliance
    pub target: String,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// Upper bound for handling one request
    pub request_timeout: Duration,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let guard = Arc::clone(&state.guard);

    Router::new()
        .route("/health", get(health_handler))
        .route("/mcp", post(mcp_handler))
        // Authentication middleware (applied before other layers)
        .layer(middleware::from_fn_with_state(guard, auth_middleware))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now = Utc::now();
    let expiry = state.broker.cached_expiry();

    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "target": state.target,
        "api_keys": state.guard.key_count(),
        "token_cached": expiry.is_some_and(|e| e > now),
        "token_expires_at": expiry.map(|e| e.to_rfc3339()),
        "token_refreshing": state.broker.is_refreshing(),
        "catalog_endpoints": state.tools.catalog().loaded_len(),
    }))
}

/// MCP handler (POST /mcp)
async fn mcp_handler(State(state): State<Arc<AppState>>, http_request: Request<Body>) -> Response {
    let Some(caller) = http_request.extensions().get::<CallerIdentity>().cloned() else {
        return unauthorized_response("Missing caller identity");
    };

    let body_bytes = match axum::body::to_bytes(http_request.into_body(), state.max_body_size).await
    {
        Ok(bytes) => bytes,
        Err(e) => {
            return rpc_response(
                StatusCode::BAD_REQUEST,
                &JsonRpcResponse::error(
                    None,
                    rpc_codes::PARSE_ERROR,
                    format!("Failed to read body: {e}"),
                ),
            );
        }
    };

    let request: Value = match serde_json::from_slice(&body_bytes) {
        Ok(v) => v,
        Err(e) => {
            return rpc_response(
                StatusCode::BAD_REQUEST,
                &JsonRpcResponse::error(
                    None,
                    rpc_codes::PARSE_ERROR,
                    format!("Invalid JSON: {e}"),
                ),
            );
        }
    };

    let (id, method, params) = match parse_request(&request) {
        Ok(parsed) => parsed,
        Err(response) => return rpc_response(StatusCode::BAD_REQUEST, &response),
    };

    debug!(method = %method, caller = %caller.name, "MCP request");

    // Notifications get no response body
    let Some(id) = id.filter(|_| !is_notification_method(&method)) else {
        debug!(notification = %method, "Handling notification");
        return StatusCode::ACCEPTED.into_response();
    };

    let dispatch = dispatch(&state, id.clone(), &method, params.as_ref(), &caller);
    let response = match tokio::time::timeout(state.request_timeout, dispatch).await {
        Ok(response) => response,
        Err(_) => {
            warn!(method = %method, timeout = ?state.request_timeout, "Request timed out");
            JsonRpcResponse::error(
                Some(id),
                rpc_codes::SERVER_ERROR_START,
                format!("Request timed out after {:?}", state.request_timeout),
            )
        }
    };

    rpc_response(StatusCode::OK, &response)
}

async fn dispatch(
    state: &AppState,
    id: RequestId,
    method: &str,
    params: Option<&Value>,
    caller: &CallerIdentity,
) -> JsonRpcResponse {
    match method {
        "initialize" => handle_initialize(id, params),
        "ping" => JsonRpcResponse::success(id, json!({})),
        "tools/list" => to_response(
            id,
            &ToolsListResult {
                tools: build_tools(),
                next_cursor: None,
            },
        ),
        "tools/call" => {
            let (tool_name, arguments) = extract_tools_call_params(params);
            if tool_name.is_empty() {
                return JsonRpcResponse::error(
                    Some(id),
                    rpc_codes::INVALID_PARAMS,
                    "Missing tool name",
                );
            }
            match state.tools.call(tool_name, &arguments, caller).await {
                Ok(result) => to_response(id, &result),
                Err(e) => error_response(id, &e),
            }
        }
        _ => JsonRpcResponse::error(
            Some(id),
            rpc_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        ),
    }
}

fn handle_initialize(id: RequestId, params: Option<&Value>) -> JsonRpcResponse {
    let params: InitializeParams = params
        .and_then(|p| serde_json::from_value(p.clone()).ok())
        .unwrap_or_default();
    let version = negotiate_version(params.protocol_version.as_deref());

    if let Some(client) = &params.client_info {
        debug!(client = %client.name, client_version = %client.version, protocol = version, "Client initialized");
    }

    to_response(
        id,
        &InitializeResult {
            protocol_version: version.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
            },
            server_info: Info {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: Some("IBM Guardium Data Protection".to_string()),
            },
            instructions: Some(INSTRUCTIONS.to_string()),
        },
    )
}

fn to_response<T: serde::Serialize>(id: RequestId, result: &T) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => error_response(id, &Error::Json(e)),
    }
}

fn error_response(id: RequestId, error: &Error) -> JsonRpcResponse {
    let message = match error {
        Error::JsonRpc { message, .. } => message.clone(),
        other => other.to_string(),
    };
    JsonRpcResponse::error(Some(id), error.to_rpc_code(), message)
}

fn rpc_response(status: StatusCode, rpc: &JsonRpcResponse) -> Response {
    (status, Json(rpc)).into_response()
}

/// Extract a `RequestId` from a JSON value.
///
/// Supports string and integer ID values per JSON-RPC 2.0.
/// Returns `None` if the value is not a recognised ID type.
fn extract_request_id(value: &Value) -> Option<RequestId> {
    match value {
        Value::String(s) => Some(RequestId::String(s.clone())),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
            .map(RequestId::Number),
        _ => None,
    }
}

/// Check whether a method name represents a notification (no response expected).
fn is_notification_method(method: &str) -> bool {
    method.starts_with("notifications/")
}

/// Extract the `tools/call` parameters (tool name and arguments) from request params.
///
/// Returns `("", {})` when the expected fields are absent.
fn extract_tools_call_params(params: Option<&Value>) -> (&str, Value) {
    let tool_name = params
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let arguments = params
        .and_then(|p| p.get("arguments"))
        .filter(|a| !a.is_null())
        .cloned()
        .unwrap_or_else(|| json!({}));
    (tool_name, arguments)
}

/// Parse JSON-RPC request or notification
/// Returns (Option<RequestId>, method, params) - id is None for notifications
#[allow(clippy::result_large_err)]
fn parse_request(
    value: &Value,
) -> Result<(Option<RequestId>, String, Option<Value>), JsonRpcResponse> {
    let jsonrpc = value.get("jsonrpc").and_then(Value::as_str);
    if jsonrpc != Some("2.0") {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Invalid JSON-RPC version",
        ));
    }

    let id = value.get("id").and_then(extract_request_id);

    let method = value
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            JsonRpcResponse::error(id.clone(), rpc_codes::INVALID_REQUEST, "Missing method")
        })?;

    let params = value.get("params").cloned();

    if !is_notification_method(method) && id.is_none() {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Missing id",
        ));
    }

    Ok((id, method.to_string(), params))
}
