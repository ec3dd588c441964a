//! tdk-agent entry point.
//!
//! This file is intentionally thin: it sets up tracing, loads configuration,
//! boots the sync engine, and starts the localhost status server. Route
//! handlers live in `routes.rs`; shared state types live in `state.rs`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tdk_agent::{routes, state};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};
use uuid::Uuid;

use tdk_bus::TabBus;
use tdk_config::EngineSettings;
use tdk_runtime::{Engine, EngineConfig, EngineDeps};
use tdk_transport::{RestClient, RestConfig, TaskChannel, WsChannel, WsConfig};

#[derive(Debug, Parser)]
#[command(name = "tdk-agent", about = "Headless task sync agent")]
struct Args {
    /// Layered YAML config files, later files override earlier ones.
    #[arg(long = "config", value_name = "FILE")]
    config: Vec<String>,

    /// Status server bind address.
    #[arg(long, default_value = "127.0.0.1:8791")]
    addr: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();
    let args = Args::parse();

    let settings = load_settings(&args)?;
    info!(
        workspace = %settings.workspace_id,
        ws = %settings.ws_url,
        api = %settings.api_url,
        "agent configuration resolved"
    );

    let session_id = format!("sess_{}", Uuid::new_v4().simple());

    // Object graph: bus, channel, REST client, then the engine on top.
    let bus = TabBus::new();
    let channel = WsChannel::connect(WsConfig::new(
        settings.ws_url.clone(),
        settings.workspace_id.clone(),
        session_id.clone(),
    ));
    let rest = RestClient::new(RestConfig::new(
        settings.api_url.clone(),
        settings.workspace_id.clone(),
    ));

    let mut engine_cfg = EngineConfig::new(settings.workspace_id.clone());
    engine_cfg.session_id = session_id;
    engine_cfg.store_path = Some(PathBuf::from(&settings.store_path));
    engine_cfg.reduced_data = settings.reduced_data;
    engine_cfg.idle.base_interval = std::time::Duration::from_secs(settings.idle_interval_secs);
    engine_cfg.prefetch.max_concurrent = settings.prefetch_concurrency;

    let engine = Arc::new(
        Engine::bootstrap(
            engine_cfg,
            EngineDeps {
                channel: channel as Arc<dyn TaskChannel>,
                rest,
                bus,
            },
        )
        .await
        .context("engine bootstrap failed")?,
    );
    info!(
        painted = engine.boot.painted_tasks,
        paint_ms = engine.boot.cache_paint_ms,
        resumed_sequence = engine.boot.resumed_sequence,
        "engine bootstrapped"
    );

    let app = routes::build_router(state::AppState::new(Arc::clone(&engine)))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive());

    info!("tdk-agent listening on http://{}", args.addr);
    let listener = tokio::net::TcpListener::bind(args.addr).await?;

    tokio::select! {
        served = axum::serve(listener, app) => {
            served.context("status server crashed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    engine.shutdown();
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn load_settings(args: &Args) -> Result<EngineSettings> {
    let settings = if args.config.is_empty() {
        EngineSettings::default()
    } else {
        let paths: Vec<&str> = args.config.iter().map(String::as_str).collect();
        let loaded = tdk_config::load_config_layers(&paths)?;
        info!(config_hash = %loaded.hash, "layered config loaded");
        EngineSettings::from_value(&loaded.document)
    };
    Ok(settings.apply_env())
}
