use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path, State};
use axum::routing::get;
use axum::Json;
use clap::Parser;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tokensync::alias::displayable_alias_text;
use tokensync::config;
use tokensync::errors::TokenStateError;
use tokensync::models::token::{now_millis, TokenMetadata};
use tokensync::service::TokenStateService;

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "tokensync"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tokensync=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Alias { command }) => {
            let cli::AliasCommands::Display { alias } = command;
            println!("{}", displayable_alias_text(&alias));
            Ok(())
        }
        Some(cli::Commands::Token { command }) => {
            let cfg = config::load()?;
            let service = TokenStateService::from_config(&cfg).await?;
            handle_token_command(command, &service).await
        }
        Some(cli::Commands::Serve { port }) => {
            let cfg = config::load()?;
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        None => {
            let cfg = config::load()?;
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run_server(cfg: config::Config, port: u16) -> anyhow::Result<()> {
    tracing::info!(store = ?cfg.remote_store.kind, "Connecting to remote store...");
    let service = Arc::new(TokenStateService::from_config(&cfg).await?);
    service.start().await;

    let app = axum::Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .route("/tokens/:token_id", get(token_state_handler))
        .with_state(service.clone())
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("tokensync node listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let report = service.stop().await;
    tracing::info!(
        written = report.written,
        failed = report.failed,
        "tokensync node stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("shutdown signal received, flushing token state");
}

async fn readiness_check(State(service): State<Arc<TokenStateService>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "pending_writes": service.pending_writes(),
        "cached_tokens": service.local_len(),
    }))
}

async fn metrics_handler(State(service): State<Arc<TokenStateService>>) -> String {
    service.metrics().encode()
}

/// Read-only view of one token, with read-through.
async fn token_state_handler(
    State(service): State<Arc<TokenStateService>>,
    Path(token_id): Path<String>,
) -> Result<Json<serde_json::Value>, TokenStateError> {
    let expiration = service.get_token_expiration(&token_id).await?;
    let max_lifetime = service.get_token_max_lifetime(&token_id).await?;
    let metadata = service.get_token_metadata(&token_id).await?;
    Ok(Json(json!({
        "token": displayable_alias_text(&token_id),
        "expiration": expiration,
        "max_lifetime": max_lifetime,
        "expired": service.is_expired(&token_id).await?,
        "metadata": metadata,
    })))
}

async fn handle_token_command(
    cmd: cli::TokenCommands,
    service: &TokenStateService,
) -> anyhow::Result<()> {
    match cmd {
        cli::TokenCommands::Add {
            token_id,
            ttl,
            max_lifetime,
            user,
            comment,
        } => {
            let token_id = token_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let now = now_millis();
            let expiration = now.saturating_add(i64::try_from(ttl.saturating_mul(1000))?);
            service.add_token(&token_id, now, expiration, max_lifetime)?;

            if let Some(user) = user {
                let metadata = TokenMetadata {
                    user_name: user,
                    comment,
                    enabled: true,
                };
                service.add_metadata(&token_id, metadata).await?;
            }

            let report = service.flush_now().await;
            if report.failed > 0 {
                anyhow::bail!("{} alias writes failed, token state not persisted", report.failed);
            }
            println!("Token recorded:");
            println!("  ID:         {}", token_id);
            println!("  Expiration: {}", expiration);
        }
        cli::TokenCommands::Renew {
            token_id,
            extension_ms,
        } => {
            let expiration = service
                .renew_token(&token_id, extension_ms)
                .await
                .with_context(|| format!("renewing {}", displayable_alias_text(&token_id)))?;
            let report = service.flush_now().await;
            if report.failed > 0 {
                anyhow::bail!("renewal could not be persisted");
            }
            println!("Renewed {} until {}", displayable_alias_text(&token_id), expiration);
        }
        cli::TokenCommands::Show { token_id } => {
            let expiration = service.get_token_expiration(&token_id).await?;
            let max_lifetime = service.get_token_max_lifetime(&token_id).await?;
            let metadata = service.get_token_metadata(&token_id).await?;
            let expired = service.is_expired(&token_id).await?;

            println!("Token {}", displayable_alias_text(&token_id));
            println!("  Expiration:   {}", expiration);
            match max_lifetime {
                Some(max) => println!("  Max lifetime: {}", max),
                None => println!("  Max lifetime: none"),
            }
            println!("  Expired:      {}", expired);
            if let Some(meta) = metadata {
                println!("  User:         {}", meta.user_name);
                if let Some(comment) = meta.comment {
                    println!("  Comment:      {}", comment);
                }
                println!("  Enabled:      {}", meta.enabled);
            }
        }
    }
    Ok(())
}
