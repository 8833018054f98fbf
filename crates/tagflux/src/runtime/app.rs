use crate::runtime::config::RuntimeConfig;
use crate::runtime::logging::init_tracing;
use futures::future::join_all;
use std::time::Duration;
use tagflux_core::SettingsStore;
use tagflux_link::metrics::{init_metrics, serve_metrics};
use tagflux_link::{AcquisitionMode, LinkEvent, SessionManager};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Floor for the per-connection scan tick; protects devices from
/// misconfigured zero/near-zero intervals.
const MIN_SCAN_INTERVAL: Duration = Duration::from_millis(100);

pub async fn run(config: RuntimeConfig) {
    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());

    init_metrics();
    let _metrics_handle = config.metrics_addr.clone().map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr)
    });

    let store = SettingsStore::new(&config.settings_path);
    let settings = store.load();
    info!(
        settings = %store.path().display(),
        connections = settings.connections.len(),
        "tagflux starting"
    );

    let mut sessions: Vec<(SessionManager, Duration)> = Vec::new();
    for connection in settings.connections {
        if !connection.enabled {
            info!(connection = %connection.name, "connection disabled, skipping");
            continue;
        }
        let scan_interval =
            Duration::from_millis(connection.scan_interval_ms).max(MIN_SCAN_INTERVAL);
        match SessionManager::from_config(connection.clone()) {
            Ok(session) => sessions.push((session, scan_interval)),
            Err(e) => {
                error!(connection = %connection.name, error = %e, "cannot build session");
            }
        }
    }

    if sessions.is_empty() {
        warn!("no enabled connections configured; idling until shutdown");
    }

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    for (session, scan_interval) in &sessions {
        tasks.push(tokio::spawn(drive_session(
            session.clone(),
            *scan_interval,
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(log_events(session.clone(), shutdown.clone())));
    }

    match config.run_seconds {
        Some(seconds) => {
            info!(seconds, "Running for limited duration");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
            }
        }
        None => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }

    info!("shutting down");
    shutdown.cancel();
    join_all(tasks).await;
    for (session, _) in &sessions {
        session.shutdown().await;
    }
    info!("shutdown complete");
}

/// Per-connection driver: the "external scheduler" for the session. Each
/// tick retries a dead connection and, for poll-only backends, runs one
/// read sweep. Push backends only need the connect retry; their data flows
/// through the subscription.
async fn drive_session(session: SessionManager, scan_interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(scan_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if !session.is_connected() {
                    if let Err(e) = session.connect().await {
                        debug!(connection = %session.name(), error = %e, "connect retry failed");
                        continue;
                    }
                }
                if session.mode().await == AcquisitionMode::Poll {
                    if let Err(e) = session.poll_sweep().await {
                        debug!(connection = %session.name(), error = %e, "poll sweep skipped");
                    }
                }
            }
        }
    }
}

/// Stand-in for the downstream consumers (UI, logger, plotter): turns
/// session events into structured log lines.
async fn log_events(session: SessionManager, shutdown: CancellationToken) {
    let mut events = session.subscribe_events();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(LinkEvent::StatusChanged { connection, connected }) => {
                    info!(connection = %connection, connected, "connection status changed");
                }
                Ok(LinkEvent::Data { connection, values }) => {
                    for value in &values {
                        debug!(
                            connection = %connection,
                            tag = %value.acquired.tag,
                            value = ?value.acquired.value,
                            state = value.state.as_str(),
                            "value"
                        );
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(connection = %session.name(), skipped, "event consumer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
