//! GDP endpoint catalog
//!
//! GDP describes its own REST surface at `GET restapi?withParameters=1`. The
//! catalog indexes that listing by function name and category, and keeps a
//! copy on disk so the gateway can start without reaching the appliance.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use reqwest::Method;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::GdpClient;
use crate::{Error, Result};

/// Category used when GDP reports none
const UNKNOWN_CATEGORY: &str = "Unknown";

/// Maximum suggestions returned by [`Catalog::similar`]
const MAX_SIMILAR: usize = 8;

/// One GDP REST endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// Numeric resource id
    #[serde(default)]
    pub resource_id: Option<i64>,
    /// Unique function name, e.g. `list_group`
    #[serde(rename = "api_function_name")]
    pub function_name: String,
    /// Path below the API base URL
    #[serde(rename = "resourceName")]
    pub resource_name: String,
    /// HTTP method
    pub verb: String,
    /// Category (GDP application name)
    #[serde(rename = "sql_app_name", default, deserialize_with = "lenient_string")]
    pub category: String,
    /// API version
    #[serde(default, deserialize_with = "lenient_string")]
    pub version: String,
    /// Human-readable description
    #[serde(rename = "apiDescription", default, deserialize_with = "lenient_string")]
    pub description: String,
    /// Accepted parameters
    #[serde(default, deserialize_with = "lenient_list")]
    pub parameters: Vec<Parameter>,
}

/// One endpoint parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter name
    #[serde(rename = "parameterName")]
    pub name: String,
    /// Java type name as reported by GDP
    #[serde(rename = "parameterType", default, deserialize_with = "lenient_string")]
    pub param_type: String,
    /// Whether GDP rejects calls without it
    #[serde(rename = "isRequired", default, deserialize_with = "lenient_bool")]
    pub required: bool,
    /// Description
    #[serde(
        rename = "parameterDescription",
        default,
        deserialize_with = "lenient_string"
    )]
    pub description: String,
    /// Enumerated valid values, if any
    #[serde(rename = "parameterValues", default)]
    pub valid_values: Option<Value>,
}

impl Endpoint {
    /// Names of the required parameters
    #[must_use]
    pub fn required_params(&self) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect()
    }

    /// HTTP method, if GDP reported a valid one
    #[must_use]
    pub fn method(&self) -> Option<Method> {
        Method::from_bytes(self.verb.trim().to_ascii_uppercase().as_bytes()).ok()
    }

    /// Full description for `gdp_get_api_details`
    #[must_use]
    pub fn details(&self) -> Value {
        let parameters: Vec<Value> = self
            .parameters
            .iter()
            .map(|p| {
                let mut info = json!({
                    "name": p.name,
                    "type": p.short_type(),
                    "required": p.required,
                    "description": p.description,
                });
                if let Some(values) = p.valid_values.as_ref().filter(|v| has_content(v)) {
                    info["valid_values"] = values.clone();
                }
                info
            })
            .collect();

        json!({
            "function_name": self.function_name,
            "http_method": self.verb,
            "resource_path": format!("/restAPI/{}", self.resource_name.trim_start_matches('/')),
            "category": self.category,
            "version": self.version,
            "description": self.description,
            "parameters": parameters,
        })
    }
}

impl Parameter {
    /// Type name without its Java package
    #[must_use]
    pub fn short_type(&self) -> &str {
        self.param_type
            .rsplit_once('.')
            .map_or(self.param_type.as_str(), |(_, short)| short)
    }
}

fn has_content(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        _ => true,
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    })
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    })
}

fn lenient_list<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<Parameter>, D::Error> {
    Ok(Option::<Vec<Parameter>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Indexed endpoint listing
#[derive(Debug, Default)]
pub struct Catalog {
    endpoints: BTreeMap<String, Endpoint>,
    categories: BTreeMap<String, Vec<String>>,
}

impl Catalog {
    /// Index a raw `restapi` listing, skipping entries that do not parse
    ///
    /// # Errors
    ///
    /// Returns [`Error::CatalogUnavailable`] when the listing is not an array.
    pub fn from_raw(raw: &Value) -> Result<Self> {
        let items = raw.as_array().ok_or_else(|| {
            Error::CatalogUnavailable("endpoint listing is not a JSON array".to_string())
        })?;

        let mut catalog = Self::default();
        let mut skipped = 0usize;
        for item in items {
            match Endpoint::deserialize(item) {
                Ok(endpoint) => catalog.insert(endpoint),
                Err(e) => {
                    skipped += 1;
                    debug!(error = %e, "Skipping unparseable endpoint entry");
                }
            }
        }
        if skipped > 0 {
            warn!(skipped, "Some endpoint entries could not be parsed");
        }
        Ok(catalog)
    }

    fn insert(&mut self, mut endpoint: Endpoint) {
        if endpoint.category.is_empty() {
            endpoint.category = UNKNOWN_CATEGORY.to_string();
        }
        let name = endpoint.function_name.clone();
        if let Some(previous) = self.endpoints.insert(name.clone(), endpoint) {
            if let Some(names) = self.categories.get_mut(&previous.category) {
                names.retain(|n| *n != name);
                if names.is_empty() {
                    self.categories.remove(&previous.category);
                }
            }
        }
        if let Some(endpoint) = self.endpoints.get(&name) {
            self.categories
                .entry(endpoint.category.clone())
                .or_default()
                .push(name);
        }
    }

    /// Number of endpoints
    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether no endpoints are indexed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Endpoint by exact function name
    #[must_use]
    pub fn get(&self, function_name: &str) -> Option<&Endpoint> {
        self.endpoints.get(function_name)
    }

    /// Case-insensitive keyword search over name, description, category and
    /// resource path, sorted by function name
    #[must_use]
    pub fn search(
        &self,
        query: &str,
        category: Option<&str>,
        verb: Option<&str>,
        limit: usize,
    ) -> Vec<&Endpoint> {
        let query = query.to_lowercase();
        self.endpoints
            .values()
            .filter(|ep| category.is_none_or(|c| ep.category.eq_ignore_ascii_case(c)))
            .filter(|ep| verb.is_none_or(|v| ep.verb.eq_ignore_ascii_case(v)))
            .filter(|ep| {
                ep.function_name.to_lowercase().contains(&query)
                    || ep.description.to_lowercase().contains(&query)
                    || ep.category.to_lowercase().contains(&query)
                    || ep.resource_name.to_lowercase().contains(&query)
            })
            .take(limit)
            .collect()
    }

    /// Category names with endpoint counts, sorted by name
    #[must_use]
    pub fn categories(&self) -> BTreeMap<&str, usize> {
        self.categories
            .iter()
            .map(|(name, endpoints)| (name.as_str(), endpoints.len()))
            .collect()
    }

    /// Function names containing `name`, case-insensitively
    #[must_use]
    pub fn similar(&self, name: &str) -> Vec<&str> {
        let needle = name.to_lowercase();
        self.endpoints
            .keys()
            .filter(|candidate| candidate.to_lowercase().contains(&needle))
            .take(MAX_SIMILAR)
            .map(String::as_str)
            .collect()
    }
}

/// Loads the catalog once, on first use
///
/// Concurrent first users share one load. A failed load leaves the loader
/// empty so the next use tries again.
pub struct CatalogLoader {
    client: GdpClient,
    cache_path: Option<PathBuf>,
    prefer_cache: bool,
    catalog: OnceCell<Arc<Catalog>>,
}

impl CatalogLoader {
    /// Create a loader; `cache_path` of `None` disables the disk copy
    #[must_use]
    pub fn new(client: GdpClient, cache_path: Option<PathBuf>, prefer_cache: bool) -> Self {
        Self {
            client,
            cache_path,
            prefer_cache,
            catalog: OnceCell::new(),
        }
    }

    /// Catalog, loading it if needed
    ///
    /// # Errors
    ///
    /// When live discovery fails and no usable cache file exists, returns the
    /// discovery error: [`Error::Auth`], [`Error::Network`] or
    /// [`Error::Upstream`] from the call, or [`Error::CatalogUnavailable`]
    /// when GDP answered with an unusable listing.
    pub async fn get(&self) -> Result<Arc<Catalog>> {
        self.catalog
            .get_or_try_init(|| self.load())
            .await
            .map(Arc::clone)
    }

    /// Endpoint count if already loaded
    #[must_use]
    pub fn loaded_len(&self) -> Option<usize> {
        self.catalog.get().map(|c| c.len())
    }

    async fn load(&self) -> Result<Arc<Catalog>> {
        if self.prefer_cache {
            if let Some(catalog) = self.read_cache().await {
                return Ok(Arc::new(catalog));
            }
        }

        let discovery_error = match self.discover().await {
            Ok(catalog) => return Ok(Arc::new(catalog)),
            Err(e) => {
                warn!(error = %e, kind = e.kind(), "Live endpoint discovery failed, falling back to cache");
                e
            }
        };

        if !self.prefer_cache {
            if let Some(catalog) = self.read_cache().await {
                return Ok(Arc::new(catalog));
            }
        }

        Err(discovery_error)
    }

    async fn discover(&self) -> Result<Catalog> {
        let params = json!({"withParameters": "1"});
        let raw = self.client.call(&Method::GET, "restapi", Some(&params)).await?;
        let catalog = Catalog::from_raw(&raw)?;
        if catalog.is_empty() {
            return Err(Error::CatalogUnavailable(
                "GDP returned an empty endpoint listing".to_string(),
            ));
        }

        info!(
            endpoints = catalog.len(),
            categories = catalog.categories.len(),
            "Live endpoint discovery complete"
        );

        if let Some(path) = &self.cache_path {
            match serde_json::to_vec_pretty(&raw) {
                Ok(bytes) => match tokio::fs::write(path, bytes).await {
                    Ok(()) => info!(path = %path.display(), "Cached endpoint listing"),
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to write endpoint cache"),
                },
                Err(e) => warn!(error = %e, "Failed to serialize endpoint listing"),
            }
        }
        Ok(catalog)
    }

    async fn read_cache(&self) -> Option<Catalog> {
        let path = self.cache_path.as_ref()?;
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No endpoint cache");
                return None;
            }
        };

        let catalog = serde_json::from_slice::<Value>(&bytes)
            .map_err(Error::from)
            .and_then(|raw| Catalog::from_raw(&raw));
        match catalog {
            Ok(catalog) if !catalog.is_empty() => {
                info!(endpoints = catalog.len(), path = %path.display(), "Loaded endpoints from cache");
                Some(catalog)
            }
            Ok(_) => {
                warn!(path = %path.display(), "Endpoint cache is empty");
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Endpoint cache is unreadable");
                None
            }
        }
    }
}
