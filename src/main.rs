//! GDP MCP Gateway - MCP tools for the Guardium Data Protection REST API
//!
//! Callers authenticate with a static API key; the gateway holds the GDP
//! OAuth credentials and keeps one shared token fresh.

use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use rand::Rng;
use tracing::{error, info};

use gdp_mcp_gateway::{
    cli::{Cli, Command},
    config::Config,
    credentials::{Credentials, digest_key},
    gateway::Gateway,
    gdp::build_http_client,
    oauth::{HttpTokenExchange, TokenExchange},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Keygen { ref name }) => run_keygen(name),
        Some(Command::Token) => run_token_check(&cli).await,
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

fn load_config(cli: &Cli) -> Option<Config> {
    match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            Some(config)
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            None
        }
    }
}

/// Print a fresh API key and the config entry that accepts it
fn run_keygen(name: &str) -> ExitCode {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    let key = format!("gdpk_{}", hex::encode(bytes));
    let digest = hex::encode(digest_key(&key));

    println!("API key for '{name}' (shown once, give it to the caller):\n");
    println!("  {key}\n");
    println!("Config entry (only the digest is stored):\n");
    println!("auth:");
    println!("  api_keys:");
    println!("    - name: \"{name}\"");
    println!("      key: \"sha256:{digest}\"");
    ExitCode::SUCCESS
}

/// Perform one OAuth exchange and report the token lifetime
async fn run_token_check(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    let exchange = match Credentials::from_config(&config.gdp, &config.auth).and_then(|creds| {
        let http_client = build_http_client(&config.gdp)?;
        Ok(HttpTokenExchange::new(http_client, Arc::new(creds)))
    }) {
        Ok(exchange) => exchange,
        Err(e) => {
            error!("Invalid GDP configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(target = %config.gdp.target(), token_url = %config.gdp.token_url(), "Requesting token");
    match tokio::time::timeout(config.gdp.token_timeout, exchange.exchange()).await {
        Ok(Ok(token)) => {
            let remaining = token.remaining(Utc::now());
            println!("Token obtained ({})", token.token_type());
            println!("  expires at: {}", token.expires_at().to_rfc3339());
            println!("  valid for:  {}s", remaining.as_secs());
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!("Token exchange failed: {e}");
            ExitCode::FAILURE
        }
        Err(_) => {
            error!(
                "Token exchange timed out after {:?}",
                config.gdp.token_timeout
            );
            ExitCode::FAILURE
        }
    }
}

async fn run_server(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        target = %config.gdp.target(),
        "Starting GDP MCP Gateway"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
