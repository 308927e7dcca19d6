use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use rigtime::config::Config;
use rigtime::engine::Engine;
use rigtime::notify::NotifyHub;
use rigtime::server::{self, ServerContext};
use rigtime::sweeper;
use rigtime::time::SystemClock;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cfg = Config::from_env();
    rigtime::observability::init(cfg.metrics_port)?;

    std::fs::create_dir_all(&cfg.data_dir)?;
    let wal_path = cfg.data_dir.join("rigtime.wal");
    let engine = Arc::new(Engine::new(
        wal_path.clone(),
        Arc::new(NotifyHub::new()),
        Arc::new(SystemClock),
        cfg.engine(),
    )?);

    let shutdown_token = CancellationToken::new();
    let ctx = Arc::new(ServerContext::new(
        engine.clone(),
        cfg.watch_reconcile,
        shutdown_token.clone(),
    ));
    let invalidator = ctx.cache.spawn_invalidator(shutdown_token.child_token());
    let compactor = tokio::spawn(sweeper::run_compactor(
        engine.clone(),
        cfg.compact_threshold,
        cfg.sweep_interval,
        shutdown_token.child_token(),
    ));
    let sessions = tokio::spawn(sweeper::run_session_sweeper(
        engine.clone(),
        cfg.sweep_interval,
        shutdown_token.child_token(),
    ));

    let max_connections = cfg.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = cfg.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("rigtime listening on {addr}");
    info!("  wal: {}", wal_path.display());
    info!("  max_connections: {max_connections}");
    info!("  venue_utc_offset_minutes: {}", cfg.venue_utc_offset_minutes);
    info!("  time parsing: {:?}", cfg.engine().parse_mode());
    info!(
        "  metrics: {}",
        cfg.metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("SIGTERM handler unavailable: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(rigtime::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(rigtime::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(rigtime::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let ctx = ctx.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = server::process_connection(socket, ctx).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(rigtime::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Idle connections and watch streams end on cancel; requests in flight finish.
    shutdown_token.cancel();

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    let _ = tokio::join!(invalidator, compactor, sessions);
    info!("rigtime stopped");
    Ok(())
}
