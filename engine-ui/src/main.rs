//! Engine API server - HTTP and live event streams over the run store.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use clap::Parser;
use engine::container::ContainerManager;
use engine::container::docker::DockerCli;
use engine::events::{EventBus, EventLog, JsonlEventRepository};
use engine::io::config::{config_path, load_config};
use engine::llm::OpenAiCompatible;
use engine::workflow::WorkflowEngine;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "engine-ui")]
#[command(about = "HTTP API and live event streams for engine runs")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Directory holding `config.toml` and the run store
    #[arg(long, default_value = ".engine")]
    data_dir: PathBuf,
}

fn build_engine(data_dir: &std::path::Path) -> anyhow::Result<Arc<WorkflowEngine>> {
    let config = load_config(&config_path(data_dir))?;
    let repo = JsonlEventRepository::open(data_dir)
        .with_context(|| format!("open run store in {}", data_dir.display()))?;
    let log = Arc::new(EventLog::new(Arc::new(repo)));
    let bus = Arc::new(EventBus::new(config.bus_capacity));
    let llm = Arc::new(OpenAiCompatible::from_config(&config.llm)?);
    let containers = Arc::new(ContainerManager::new(Arc::new(DockerCli::from_config(
        &config.container,
        &config.exec,
    ))));
    Ok(Arc::new(WorkflowEngine::new(
        config, log, bus, llm, containers,
    )?))
}

fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", routes::api_router())
        .route("/events", get(sse::changes_handler))
        .route("/events/{run_id}", get(sse::run_events_handler))
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("engine_ui=info".parse()?),
        )
        .init();

    let args = Args::parse();

    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("create {}", args.data_dir.display()))?;
    let data_dir = args.data_dir.canonicalize().unwrap_or(args.data_dir);
    info!(data_dir = %data_dir.display(), "starting engine-ui");

    let engine = build_engine(&data_dir)?;
    let state = AppState::new(data_dir, engine);

    sse::start_file_watcher(state.clone());

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state)).await?;

    Ok(())
}
