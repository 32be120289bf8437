//! GDP tools exposed over MCP
//!
//! Workflow for the assistant: `gdp_search_apis` → `gdp_get_api_details` →
//! `gdp_execute_api`. Tool failures come back as tool results with
//! `isError: true` and a message prefixed by the error kind; only malformed
//! invocations become JSON-RPC errors.

use std::fmt::Write as _;
use std::sync::Arc;

use reqwest::Method;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::auth::CallerIdentity;
use crate::config::CatalogConfig;
use crate::error::{rpc_codes, truncate_chars};
use crate::failsafe::{RetryPolicy, with_retry};
use crate::gdp::{Catalog, CatalogLoader, Endpoint, GdpClient};
use crate::protocol::{Tool, ToolAnnotations, ToolsCallResult};
use crate::{Error, Result};

/// Search tool name
pub const SEARCH_APIS: &str = "gdp_search_apis";
/// Category listing tool name
pub const LIST_CATEGORIES: &str = "gdp_list_categories";
/// Endpoint detail tool name
pub const GET_API_DETAILS: &str = "gdp_get_api_details";
/// Endpoint execution tool name
pub const EXECUTE_API: &str = "gdp_execute_api";

/// Server instructions returned from `initialize`
pub const INSTRUCTIONS: &str = "AI interface to IBM Guardium Data Protection. \
    Provides access to the GDP REST API endpoints for querying, configuring and managing \
    GDP appliances. Workflow: gdp_search_apis → gdp_get_api_details → gdp_execute_api.";

/// Characters of an endpoint description shown in search results
const SEARCH_DESCRIPTION_CHARS: usize = 120;

/// Categories sampled when a search finds nothing
const SAMPLE_CATEGORIES: usize = 10;

/// Tool handler backed by the GDP client and endpoint catalog
pub struct GdpTools {
    client: GdpClient,
    catalog: Arc<CatalogLoader>,
    retry: RetryPolicy,
    search_limit: usize,
    max_response_chars: usize,
}

impl GdpTools {
    /// Create the tool handler
    #[must_use]
    pub fn new(
        client: GdpClient,
        catalog: Arc<CatalogLoader>,
        retry: RetryPolicy,
        config: &CatalogConfig,
    ) -> Self {
        Self {
            client,
            catalog,
            retry,
            search_limit: config.search_limit,
            max_response_chars: config.max_response_chars,
        }
    }

    /// Catalog loader, for health reporting
    #[must_use]
    pub fn catalog(&self) -> &CatalogLoader {
        &self.catalog
    }

    /// Invoke a tool on behalf of an authenticated caller
    ///
    /// # Errors
    ///
    /// Returns a JSON-RPC error for unknown tools or missing arguments. Every
    /// other failure is reported inside the returned [`ToolsCallResult`].
    pub async fn call(
        &self,
        name: &str,
        arguments: &Value,
        caller: &CallerIdentity,
    ) -> Result<ToolsCallResult> {
        debug!(tool = name, caller = %caller.name, "Tool call");
        match name {
            SEARCH_APIS => {
                let query = extract_required_str(arguments, "query")?;
                let category = extract_optional_str(arguments, "category");
                let verb = extract_optional_str(arguments, "verb");
                Ok(self
                    .with_catalog(|catalog| {
                        format_search(catalog, query, category, verb, self.search_limit)
                    })
                    .await)
            }
            LIST_CATEGORIES => Ok(self.with_catalog(format_categories).await),
            GET_API_DETAILS => {
                let function_name = extract_required_str(arguments, "api_function_name")?;
                Ok(self
                    .with_catalog(|catalog| format_details(catalog, function_name))
                    .await)
            }
            EXECUTE_API => {
                let function_name = extract_required_str(arguments, "api_function_name")?;
                let params = extract_parameters(arguments)?;
                Ok(self.execute(function_name, params.as_ref(), caller).await)
            }
            _ => Err(Error::json_rpc(
                rpc_codes::INVALID_PARAMS,
                format!("Unknown tool: {name}"),
            )),
        }
    }

    async fn with_catalog(
        &self,
        render: impl FnOnce(&Catalog) -> ToolsCallResult,
    ) -> ToolsCallResult {
        match self.catalog.get().await {
            Ok(catalog) => render(&catalog),
            Err(e) => error_result(&e),
        }
    }

    async fn execute(
        &self,
        function_name: &str,
        params: Option<&Value>,
        caller: &CallerIdentity,
    ) -> ToolsCallResult {
        let catalog = match self.catalog.get().await {
            Ok(catalog) => catalog,
            Err(e) => return error_result(&e),
        };
        let Some(endpoint) = catalog.get(function_name) else {
            return ToolsCallResult::error(not_found_message(&catalog, function_name));
        };
        let Some(method) = endpoint.method() else {
            return ToolsCallResult::error(format!(
                "Endpoint '{function_name}' has unsupported HTTP method '{}'",
                endpoint.verb
            ));
        };

        info!(
            caller = %caller.name,
            key = %caller.fingerprint,
            api = function_name,
            method = %method,
            "Executing GDP API"
        );

        let is_get = method == Method::GET;
        let outcome = with_retry(
            &self.retry,
            function_name,
            |e| e.is_retryable() && (is_get || !matches!(e, Error::Network(_))),
            || self.client.call(&method, &endpoint.resource_name, params),
        )
        .await;

        match outcome {
            Ok(value) => ToolsCallResult::text(render_response(&value, self.max_response_chars)),
            Err(e) => {
                warn!(api = function_name, kind = e.kind(), error = %e, "GDP API call failed");
                ToolsCallResult::error(format!(
                    "{}: {e}\n\nEndpoint: {} /restAPI/{}\nParameters: {}",
                    e.kind(),
                    endpoint.verb,
                    endpoint.resource_name.trim_start_matches('/'),
                    params.map_or_else(|| "none".to_string(), Value::to_string),
                ))
            }
        }
    }
}

/// Definitions returned by `tools/list`
#[must_use]
pub fn build_tools() -> Vec<Tool> {
    let read_only = Some(ToolAnnotations {
        read_only_hint: Some(true),
        destructive_hint: Some(false),
        open_world_hint: Some(false),
    });

    vec![
        Tool {
            name: SEARCH_APIS.to_string(),
            title: Some("Search GDP APIs".to_string()),
            description: Some(
                "Search GDP API endpoints by keyword. Returns matching endpoint names with \
                 HTTP methods, descriptions and required parameters."
                    .to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Search keyword (e.g. \"datasource\", \"policy\", \"group\", \"report\", \"stap\")"
                    },
                    "category": {
                        "type": "string",
                        "description": "Filter by category name (e.g. \"Group Builder\")"
                    },
                    "verb": {
                        "type": "string",
                        "enum": ["GET", "POST", "PUT", "DELETE"],
                        "description": "Filter by HTTP method"
                    }
                },
                "required": ["query"]
            }),
            annotations: read_only.clone(),
        },
        Tool {
            name: LIST_CATEGORIES.to_string(),
            title: Some("List GDP API categories".to_string()),
            description: Some(
                "List all GDP API categories with endpoint counts.".to_string(),
            ),
            input_schema: json!({"type": "object", "properties": {}}),
            annotations: read_only.clone(),
        },
        Tool {
            name: GET_API_DETAILS.to_string(),
            title: Some("Get GDP API details".to_string()),
            description: Some(
                "Get full parameter details for one GDP API endpoint. Call this before \
                 gdp_execute_api."
                    .to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "api_function_name": {
                        "type": "string",
                        "description": "Exact function name (e.g. \"list_group\")"
                    }
                },
                "required": ["api_function_name"]
            }),
            annotations: read_only,
        },
        Tool {
            name: EXECUTE_API.to_string(),
            title: Some("Execute GDP API".to_string()),
            description: Some(
                "Execute a GDP REST API endpoint. Check gdp_get_api_details for the \
                 required parameters first."
                    .to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "api_function_name": {
                        "type": "string",
                        "description": "Exact function name (e.g. \"list_group\")"
                    },
                    "parameters": {
                        "type": "object",
                        "description": "Parameter names and values for the call"
                    }
                },
                "required": ["api_function_name"]
            }),
            annotations: Some(ToolAnnotations {
                read_only_hint: Some(false),
                destructive_hint: Some(true),
                open_world_hint: Some(true),
            }),
        },
    ]
}

fn error_result(error: &Error) -> ToolsCallResult {
    ToolsCallResult::error(format!("{}: {error}", error.kind()))
}

fn extract_required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::json_rpc(rpc_codes::INVALID_PARAMS, format!("Missing '{key}' parameter")))
}

fn extract_optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// `parameters` as an object; a JSON object string is accepted too
fn extract_parameters(args: &Value) -> Result<Option<Value>> {
    match args.get("parameters") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) if map.is_empty() => Ok(None),
        Some(value @ Value::Object(_)) => Ok(Some(value.clone())),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(parsed @ Value::Object(_)) => Ok(Some(parsed)),
            _ => Err(Error::json_rpc(
                rpc_codes::INVALID_PARAMS,
                "Invalid 'parameters': expected object or JSON object string",
            )),
        },
        Some(_) => Err(Error::json_rpc(
            rpc_codes::INVALID_PARAMS,
            "Invalid 'parameters': expected object",
        )),
    }
}

fn format_search(
    catalog: &Catalog,
    query: &str,
    category: Option<&str>,
    verb: Option<&str>,
    limit: usize,
) -> ToolsCallResult {
    let results = catalog.search(query, category, verb, limit);
    if results.is_empty() {
        let sample: Vec<&str> = catalog
            .categories()
            .into_keys()
            .take(SAMPLE_CATEGORIES)
            .collect();
        return ToolsCallResult::text(format!(
            "No endpoints matching '{query}'.\nTry broader terms or use {LIST_CATEGORIES}.\nSample categories: {}",
            sample.join(", ")
        ));
    }

    let mut out = format!("Found {} GDP API endpoint(s):\n", results.len());
    for endpoint in results {
        let _ = write!(out, "\n{}", format_search_entry(endpoint));
    }
    ToolsCallResult::text(out)
}

fn format_search_entry(endpoint: &Endpoint) -> String {
    let required = endpoint.required_params();
    let required = if required.is_empty() {
        "none".to_string()
    } else {
        required.join(", ")
    };
    format!(
        "  {:<6}  {}\n         {}\n         required params: {}\n",
        endpoint.verb,
        endpoint.function_name,
        truncate_chars(&endpoint.description, SEARCH_DESCRIPTION_CHARS),
        required
    )
}

fn format_categories(catalog: &Catalog) -> ToolsCallResult {
    let categories = catalog.categories();
    let total: usize = categories.values().sum();
    let mut out = format!(
        "GDP API: {total} endpoints across {} categories\n",
        categories.len()
    );
    for (name, count) in categories {
        let _ = write!(out, "\n  {count:4}  {name}");
    }
    ToolsCallResult::text(out)
}

fn format_details(catalog: &Catalog, function_name: &str) -> ToolsCallResult {
    match catalog.get(function_name) {
        Some(endpoint) => ToolsCallResult::text(
            serde_json::to_string_pretty(&endpoint.details()).unwrap_or_default(),
        ),
        None => ToolsCallResult::error(not_found_message(catalog, function_name)),
    }
}

fn not_found_message(catalog: &Catalog, function_name: &str) -> String {
    let similar = catalog.similar(function_name);
    if similar.is_empty() {
        format!("Endpoint '{function_name}' not found. Use {SEARCH_APIS} to find endpoints.")
    } else {
        format!(
            "Endpoint '{function_name}' not found. Similar: {}",
            similar.join(", ")
        )
    }
}

/// Pretty JSON, cut to `max_chars` with a note when larger
fn render_response(value: &Value, max_chars: usize) -> String {
    let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }

    let items = value
        .as_array()
        .map_or_else(|| "N/A".to_string(), |a| a.len().to_string());
    format!(
        "Response truncated ({total} chars, {items} items). Showing first {max_chars} chars:\n\n{}\n\n... [truncated, use parameters to filter results]",
        truncate_chars(&text, max_chars)
    )
}
