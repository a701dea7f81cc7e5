//! CampusDock server binary

use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use campusdock::config::{Cli, Command, ServeArgs, ServerConfig};
use campusdock::state::AppState;
use campusdock::store::SqliteConnector;
use campusdock::{api, cmd_status, logging, paths, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let data_dir = paths::init_data_dir(cli.data_dir.as_deref());

    let command = match cli.command {
        Some(command) => command,
        None => Command::Start(ServeArgs::from_env()?),
    };

    match command {
        Command::Start(args) => {
            let config = ServerConfig::from_args(&args, data_dir)?;
            serve(config).await
        }
        Command::Status(args) => cmd_status::run(&args, &data_dir).await,
        Command::GenerateToken => cmd_status::generate_token(&data_dir),
    }
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    paths::ensure_dirs().context("failed to create data directory")?;
    let logging = logging::init_logging(&config.log)?;

    info!(
        component = "server",
        event = "server.starting",
        version = VERSION,
        run_id = %logging.run_id,
        bind = %config.bind,
        data_dir = %config.data_dir.display(),
        sweep_interval_secs = config.sweep_interval.as_secs(),
        session_idle_secs = config.session_idle.as_secs(),
        store_idle_secs = config.store_idle.as_secs(),
        admin_token = config.admin_token.is_some(),
        "Starting CampusDock server"
    );

    let state = AppState::new(SqliteConnector::new(&config.db_path), config.store_idle);
    let sweeper = state
        .registry
        .spawn_sweeper(config.sweep_interval, config.session_idle);

    let app = api::router(state.clone(), config.admin_token.clone());

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(
        component = "server",
        event = "server.listening",
        bind = %config.bind,
        "Listening on {}",
        config.bind
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();
    state.store.close_now("shutdown").await;
    info!(
        component = "server",
        event = "server.stopped",
        "CampusDock server stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available; run until killed.
        std::future::pending::<()>().await;
    }
    info!(
        component = "server",
        event = "server.shutdown_requested",
        "Shutdown requested"
    );
}
