//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Conduit - authenticated gateway to upstream AI providers
#[derive(Parser, Debug)]
#[command(name = "conduit")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "CONDUIT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "CONDUIT_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "CONDUIT_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "CONDUIT_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "CONDUIT_LOG_FORMAT", global = true)]
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

    /// Log in to the upstream provider in the browser
    Login {
        /// Provider name (defaults to `oauth.provider`)
        #[arg(long)]
        provider: Option<String>,
    },

    /// Refresh the stored provider token
    Refresh {
        /// Provider name (defaults to `oauth.provider`)
        #[arg(long)]
        provider: Option<String>,
    },

    /// Remove the stored provider token
    Logout {
        /// Provider name (defaults to `oauth.provider`)
        #[arg(long)]
        provider: Option<String>,
    },

    /// Show stored provider tokens
    Status,

    /// Service token management
    #[command(subcommand)]
    Token(TokenCommand),
}

/// Service token subcommands
#[derive(Subcommand, Debug)]
pub enum TokenCommand {
    /// Issue a token; the raw value is printed once
    Create {
        /// Client name
        #[arg(required = true)]
        client_name: String,

        /// Lifetime, e.g. `30d`, `12h` (default: never expires)
        #[arg(long, value_parser = parse_ttl)]
        expires_in: Option<std::time::Duration>,

        /// Metadata entries as `key=value`
        #[arg(long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,
    },

    /// List tokens
    List {
        /// Only tokens of this client
        #[arg(long)]
        client: Option<String>,

        /// Include revoked tokens
        #[arg(long)]
        all: bool,

        /// Output format (text, json)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Show one token
    Info {
        /// Token ID
        id: uuid::Uuid,
    },

    /// Revoke a token (kept for audit)
    Revoke {
        /// Token ID
        id: uuid::Uuid,
    },

    /// Delete a token permanently
    Delete {
        /// Token ID
        id: uuid::Uuid,
    },

    /// Replace a token's metadata
    SetMeta {
        /// Token ID
        id: uuid::Uuid,

        /// Metadata entries as `key=value`; none clears it
        #[arg(long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,
    },

    /// Delete every expired token
    Cleanup,
}

/// Parse `30s`, `15m`, `12h` or `30d`
fn parse_ttl(s: &str) -> Result<std::time::Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("missing unit in '{s}' (use s, m, h or d)"))?;
    let (num, unit) = s.split_at(split);
    let n: u64 = num.parse().map_err(|_| format!("invalid number in '{s}'"))?;
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86_400,
        _ => return Err(format!("unknown unit '{unit}' (use s, m, h or d)")),
    };
    Ok(std::time::Duration::from_secs(secs))
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if k.trim().is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((k.trim().to_string(), v.to_string()))
}
