use std::net::SocketAddr;
use std::path::Path;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use workbench_gateway::config::Config;
use workbench_gateway::{serve, spawn_session_sweeper, AppState};

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    // Claim the server pid for child processes and tooling.
    std::env::set_var("VSCODE_PID", std::process::id().to_string());

    tracing::info!(
        app_root = %config.app_root.display(),
        commit = config.commit.as_deref().unwrap_or("unknown"),
        "workbench gateway configured"
    );

    let state = AppState::new(config);
    spawn_session_sweeper(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%addr, %err, "failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!(%addr, "workbench gateway listening");

    if let Err(err) = serve(listener, state).await {
        tracing::error!(%err, "server error");
        std::process::exit(1);
    }
}
