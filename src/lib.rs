//! GDP MCP Gateway Library
//!
//! Model Context Protocol (MCP) gateway in front of the Guardium Data
//! Protection (GDP) REST API. Callers present a static API key; the gateway
//! obtains, caches and refreshes the vendor OAuth token on their behalf.
//!
//! # Components
//!
//! - **Credential Store** ([`credentials`]): API key digests, OAuth client, GDP URLs
//! - **Token Broker** ([`oauth`]): cached token with single-flight refresh
//! - **API Gateway Client** ([`gdp`]): bearer calls with one forced-refresh retry on 401
//! - **Inbound Guard** ([`gateway::auth`]): API key validation before any broker work
//! - **Endpoint Catalog** ([`gdp::Catalog`]): searchable index of the GDP REST endpoints
//!
//! # Protocol Version
//!
//! Implements MCP protocol versions 2024-11-05 and 2025-03-26 over HTTP.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod failsafe;
pub mod gateway;
pub mod gdp;
pub mod oauth;
pub mod protocol;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`. Logs go to stderr.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| Error::Internal(format!("tracing already initialized: {e}")))?;
        }
        _ => {
            subscriber
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| Error::Internal(format!("tracing already initialized: {e}")))?;
        }
    }

    Ok(())
}
