//! Guardium Data Protection REST API
//!
//! - [`GdpClient`]: authenticated calls with a single forced-refresh retry
//! - [`Catalog`] / [`CatalogLoader`]: discovered endpoint index

pub(crate) mod catalog;
mod client;

use std::time::Duration;

use reqwest::Client;
use tracing::warn;

pub use catalog::{Catalog, CatalogLoader, Endpoint, Parameter};
pub use client::GdpClient;

use crate::config::GdpConfig;
use crate::{Error, Result};

/// HTTP client shared by the token exchange and API calls
///
/// # Errors
///
/// Returns [`Error::Config`] if the TLS backend cannot be initialised.
pub fn build_http_client(config: &GdpConfig) -> Result<Client> {
    if !config.verify_tls {
        warn!(
            host = config.effective_host(),
            "TLS certificate verification is disabled for GDP"
        );
    }

    Client::builder()
        .user_agent(concat!("gdp-mcp-gateway/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .timeout(config.request_timeout)
        .danger_accept_invalid_certs(!config.verify_tls)
        .build()
        .map_err(|e| Error::Config(format!("Failed to create HTTP client: {e}")))
}
