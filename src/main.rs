//! Conduit - authenticated gateway to upstream AI providers

use std::process::ExitCode;

use chrono::{TimeZone, Utc};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use conduit::{
    Result,
    auth::{CreateTokenRequest, ServiceTokenStore},
    cli::{Cli, Command, TokenCommand},
    config::Config,
    gateway::Gateway,
    oauth::{DelegatedTokenStore, OAuthFlow},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host.clone_from(host);
    }

    let result = match cli.command {
        Some(Command::Serve) | None => run_server(config).await,
        Some(Command::Login { provider }) => run_login(config, provider).await,
        Some(Command::Refresh { provider }) => run_refresh(config, provider).await,
        Some(Command::Logout { provider }) => run_logout(&config, provider),
        Some(Command::Status) => run_status(&config),
        Some(Command::Token(cmd)) => run_token_command(&config, cmd).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

fn delegated_store(config: &Config) -> Result<DelegatedTokenStore> {
    let mut store = DelegatedTokenStore::new(config.token_dir()?);
    if let Some(legacy) = config.storage.resolve_legacy_file() {
        store = store.with_legacy_path(legacy);
    }
    Ok(store)
}

fn with_provider(mut config: Config, provider: Option<String>) -> Config {
    if let Some(p) = provider {
        config.oauth.provider = p;
    }
    config
}

/// Run the gateway server
async fn run_server(config: Config) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        auth = config.auth.enabled,
        "Starting Conduit gateway"
    );

    let store = ServiceTokenStore::open(&config.database_path()?).await?;
    Gateway::new(config, store).run().await?;

    info!("Gateway shutdown complete");
    Ok(())
}

async fn run_login(config: Config, provider: Option<String>) -> Result<()> {
    let config = with_provider(config, provider);
    let store = delegated_store(&config)?;
    let flow = OAuthFlow::new(config.oauth, store)?;

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let token = flow.login(&cancel).await?;
    println!(
        "✅ Logged in to {} (expires {})",
        flow.provider(),
        format_unix(token.expires_at)
    );
    Ok(())
}

async fn run_refresh(config: Config, provider: Option<String>) -> Result<()> {
    let config = with_provider(config, provider);
    let store = delegated_store(&config)?;
    let flow = OAuthFlow::new(config.oauth, store)?;
    let token = flow.refresh().await?;
    println!(
        "✅ Refreshed {} (expires {})",
        flow.provider(),
        format_unix(token.expires_at)
    );
    Ok(())
}

fn run_logout(config: &Config, provider: Option<String>) -> Result<()> {
    let provider = provider.unwrap_or_else(|| config.oauth.provider.clone());
    if delegated_store(config)?.delete(&provider)? {
        println!("✅ Logged out of {provider}");
    } else {
        println!("No stored token for {provider}");
    }
    Ok(())
}

fn run_status(config: &Config) -> Result<()> {
    let store = delegated_store(config)?;
    let doc = store.load()?;
    if doc.providers.is_empty() {
        println!("No stored provider tokens ({})", store.path().display());
        return Ok(());
    }

    for (name, token) in &doc.providers {
        let state = if token.is_expired() { "expired" } else { "valid" };
        println!("📦 {name}");
        println!("   Status: {state}");
        println!("   Expires: {}", format_unix(token.expires_at));
        println!(
            "   Refresh token: {}",
            if token.refresh_token.is_some() { "yes" } else { "no" }
        );
        if let Some(scope) = &token.scope {
            println!("   Scope: {scope}");
        }
    }
    Ok(())
}

async fn run_token_command(config: &Config, cmd: TokenCommand) -> Result<()> {
    let store = ServiceTokenStore::open(&config.database_path()?).await?;

    match cmd {
        TokenCommand::Create {
            client_name,
            expires_in,
            metadata,
        } => {
            let mut request = CreateTokenRequest::new(client_name);
            if let Some(ttl) = expires_in {
                request = request.expires_in(ttl);
            }
            request.metadata = metadata.into_iter().collect();

            let created = store.create_token(request).await?;
            println!("✅ Created token {} for {}", created.info.token_id, created.info.client_name);
            println!("\n   {}\n", created.token);
            println!("⚠️  This is the only time the token is shown.");
        }
        TokenCommand::List {
            client,
            all,
            format,
        } => {
            let tokens = store.list_tokens(client.as_deref(), all).await?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&tokens)?);
            } else if tokens.is_empty() {
                println!("No tokens.");
            } else {
                for t in &tokens {
                    let state = match (t.is_active, t.is_expired()) {
                        (false, _) => "revoked",
                        (true, true) => "expired",
                        (true, false) => "active",
                    };
                    println!("{}  {:<24} {state}", t.token_id, t.client_name);
                }
            }
        }
        TokenCommand::Info { id } => {
            let token = store.get_token_info(id).await?;
            println!("{}", serde_json::to_string_pretty(&token)?);
        }
        TokenCommand::Revoke { id } => {
            store.revoke_token(id).await?;
            println!("✅ Revoked {id}");
        }
        TokenCommand::Delete { id } => {
            store.delete_token(id).await?;
            println!("✅ Deleted {id}");
        }
        TokenCommand::SetMeta { id, metadata } => {
            let metadata = metadata.into_iter().collect();
            store.update_token_metadata(id, &metadata).await?;
            println!("✅ Updated metadata of {id}");
        }
        TokenCommand::Cleanup => {
            let removed = store.cleanup_expired_tokens().await?;
            println!("✅ Removed {removed} expired token(s)");
        }
    }
    Ok(())
}

fn format_unix(secs: i64) -> String {
    Utc.timestamp_opt(secs, 0)
        .single()
        .map_or_else(|| secs.to_string(), |t| t.to_rfc3339())
}
