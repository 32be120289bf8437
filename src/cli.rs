//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// GDP MCP Gateway - MCP tools for the Guardium Data Protection REST API
#[derive(Parser, Debug)]
#[command(name = "gdp-mcp-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "GDP_MCP_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "GDP_MCP_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "GDP_MCP_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GDP_MCP_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "GDP_MCP_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Generate a new inbound API key and its config entry
    Keygen {
        /// Holder name recorded with the key
        #[arg(short, long, default_value = "default")]
        name: String,
    },

    /// Perform one OAuth exchange to check the GDP credentials
    Token,
}
