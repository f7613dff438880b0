pub mod broker;
pub mod channels;
pub mod config;
pub mod error;
pub mod exthost;
pub mod http;
pub mod protocol;
pub mod uri;
pub mod ws;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tower_http::trace::TraceLayer;

use broker::exthost::ExtHostSession;
use broker::management::ManagementSession;
use broker::registry::SessionRegistry;
use channels::debug::DebugBroadcast;
use channels::extensions::ExtensionScanner;
use channels::fs::RemoteFilesystemChannel;
use channels::logger::LogLevelHandle;
use config::Config;

/// Shared application state available to the accept loop, the HTTP routes,
/// and the session broker.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub management: Arc<SessionRegistry<ManagementSession>>,
    pub exthost: Arc<SessionRegistry<ExtHostSession>>,
    pub debug_hub: DebugBroadcast,
    pub log_level: Arc<LogLevelHandle>,
    pub scanner: Arc<ExtensionScanner>,
    /// One disk provider shared by every management session.
    pub filesystem: Arc<RemoteFilesystemChannel>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let scanner = Arc::new(ExtensionScanner::new(
            config.builtin_extensions_dir.clone(),
            config.user_extensions_dir.clone(),
        ));
        let log_level = LogLevelHandle::new(LogLevelHandle::parse(&config.log_level));
        Self {
            management: Arc::new(SessionRegistry::new()),
            exthost: Arc::new(SessionRegistry::new()),
            debug_hub: DebugBroadcast::new(),
            log_level,
            scanner,
            filesystem: Arc::new(RemoteFilesystemChannel::new()),
            config,
        }
    }
}

/// Run the accept loop on an already-bound listener. Never returns except on
/// listener failure.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> std::io::Result<()> {
    let router = http::routes::router()
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    loop {
        let (stream, _peer) = listener.accept().await?;
        let state = state.clone();
        let router = router.clone();
        tokio::spawn(http::connection::handle_connection(stream, router, state));
    }
}

/// Periodically dispose management sessions that stayed disconnected past
/// the TTL.
pub fn spawn_session_sweeper(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let now = Instant::now();
            let mut expired = Vec::new();
            state.management.for_each(|token, session| {
                if session.expired(now) {
                    expired.push((token.to_string(), session.clone()));
                }
            });
            for (token, session) in expired {
                tracing::debug!(%token, "sweeping expired management session");
                session.request_dispose();
            }
        }
    });
}
