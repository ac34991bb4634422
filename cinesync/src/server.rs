//! Server lifecycle
//!
//! Builds the service graph, starts every background loop, serves HTTP +
//! WebSocket traffic, and on a termination signal closes all clients with
//! a going-away frame before the listener stops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::time::Duration;
use tracing::info;

use cinesync_core::metrics::Counters;
use cinesync_core::service::{AuthStore, FfmpegEncoder, StateCore, VideoCatalog};
use cinesync_core::Config;

use crate::http::{self, AppState};
use crate::ws::SyncHub;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);

    // Service graph, leaves first.
    let counters = Arc::new(Counters::default());
    let auth = Arc::new(AuthStore::new(&config.auth));
    let state = StateCore::new(config.sync.clone());
    let encoder = Arc::new(FfmpegEncoder::new(&config.video));
    let catalog = VideoCatalog::new(&config.video, encoder, counters.clone());
    let hub = Arc::new(SyncHub::new(
        state.clone(),
        auth.clone(),
        catalog.clone(),
        counters.clone(),
        config.sync.clone(),
    ));
    // StateCore pushes outbound traffic through the hub without knowing
    // the channel type.
    state.set_notifier(hub.clone());

    // Background loops. The state's rate and broadcast loops start lazily
    // on the first play.
    let sweeper = auth
        .clone()
        .spawn_sweeper(Duration::from_millis(config.auth.sweep_interval_ms));
    catalog.start_scan(Duration::from_millis(config.video.scan_interval_ms));
    hub.clone().spawn_heartbeat();
    let summary = counters
        .clone()
        .spawn_summary(Duration::from_millis(config.logging.summary_interval_ms));

    let app_state = AppState {
        config: config.clone(),
        auth,
        state: state.clone(),
        catalog: catalog.clone(),
        hub: hub.clone(),
        started_at: Instant::now(),
    };
    let router = http::create_router(app_state);

    let addr = config.listen_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, video_root = %config.video.root, "server listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!(clients = hub.connection_count(), "shutdown signal received");
        // Saying goodbye first lets every WebSocket drain, which in turn
        // lets the graceful shutdown below complete.
        hub.shutdown();
        state.shutdown();
        catalog.stop_scan();
        sweeper.abort();
        summary.abort();
    })
    .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
