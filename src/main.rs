use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::prelude::*;

use vector_index_mcp::config::{Settings, TABLE_NAME};
use vector_index_mcp::embedder::{EmbeddingProvider, FastembedProvider};
use vector_index_mcp::indexer::Indexer;
use vector_index_mcp::server;
use vector_index_mcp::state::AppState;
use vector_index_mcp::status::StatusRegistry;
use vector_index_mcp::store::ChunkStore;
use vector_index_mcp::watcher::ProjectWatcher;

const USAGE: &str = "usage: vector-index-mcp <project_path>";

#[tokio::main]
async fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let project_root = match (args.next(), args.next()) {
        (Some(path), None) => PathBuf::from(path),
        _ => {
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    let settings = match Settings::from_env(&project_root) {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            eprintln!("startup failed: {e}");
            return ExitCode::from(1);
        }
    };

    let _log_guard = init_tracing(&settings);
    install_panic_hook();

    info!(
        project_root = %settings.project_root.display(),
        lancedb_uri = %settings.lancedb_uri,
        embedding_model = %settings.embedding_model_name,
        ignore_patterns = ?settings.ignore_patterns,
        listen = format!("{}:{}", settings.host, settings.port),
        "vector-index-mcp starting"
    );

    match run(settings).await {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("startup failed: {e}");
            eprintln!("startup failed: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(settings: Arc<Settings>) -> anyhow::Result<()> {
    let status = Arc::new(StatusRegistry::new(
        settings.project_root.to_string_lossy().to_string(),
    ));

    // The model loads once per process and pins the vector dimension the
    // store is opened with.
    let model_name = settings.embedding_model_name.clone();
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(
        tokio::task::spawn_blocking(move || FastembedProvider::load(&model_name)).await??,
    );

    let store = ChunkStore::open_or_create(
        &settings.lancedb_uri,
        TABLE_NAME,
        embedder.dimension(),
    )
    .await?;

    let indexer = Arc::new(Indexer::new(
        settings.clone(),
        store,
        embedder,
        status.clone(),
    )?);

    // Startup done: idle until the first index trigger. The watcher still
    // picks up individual file changes immediately.
    status.mark_idle();
    let watcher = ProjectWatcher::spawn(indexer.clone())?;

    let app = server::create_app(AppState::new(settings.clone(), indexer.clone()));
    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the event subscription first, then let the in-flight writer
    // finish before the store handle drops.
    watcher.shutdown();
    indexer.shutdown().await;
    Ok(())
}

fn init_tracing(settings: &Settings) -> tracing_appender::non_blocking::WorkerGuard {
    let log_dir = std::env::var("VECTOR_INDEX_LOG_DIR").unwrap_or_else(|_| {
        settings
            .project_root
            .join(".vector-index-mcp")
            .join("logs")
            .to_string_lossy()
            .to_string()
    });
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, "vector-index-mcp.log");
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let default_directive = format!(
        "vector_index_mcp={},tower_http=info",
        settings.log_level.to_ascii_lowercase()
    );
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_directive.into());

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    guard
}

fn install_panic_hook() {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        error!(target: "vector_index_mcp::panic", location = %location, payload = %payload, "PANIC: thread panicked");
        default_panic(info);
    }));
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, initiating shutdown"); },
        _ = terminate => { info!("received terminate signal, initiating shutdown"); },
    }
}
