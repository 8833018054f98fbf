use crate::error::LinkError;
use crate::metrics::RECONNECT_ATTEMPTS_TOTAL;
use crate::session::{spawn_liveness_watcher, SessionInner, CONNECT_GATE_TIMEOUT};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const INITIAL_DELAY: Duration = Duration::from_secs(2);
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Launch the background reconnect loop for a session that lost liveness.
///
/// The `reconnect_busy` flag is the handler's Ready/InProgress state:
/// repeated liveness failures while an attempt is already running are
/// ignored, so overlapping reconnects cannot happen. The loop backs off
/// exponentially from 2 s to a 30 s ceiling and aborts as soon as the
/// current connection epoch is cancelled (which `disconnect` does).
pub(crate) fn spawn(inner: Arc<SessionInner>) {
    if inner.reconnect_busy.swap(true, Ordering::AcqRel) {
        return;
    }
    tokio::spawn(async move {
        let scope = inner.current_scope();
        let mut delay = INITIAL_DELAY;
        loop {
            tokio::select! {
                _ = scope.cancelled() => {
                    info!(connection = %inner.name, "reconnect cancelled");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            RECONNECT_ATTEMPTS_TOTAL.inc();
            match attempt(&inner).await {
                Ok(()) => {
                    info!(connection = %inner.name, "reconnected");
                    break;
                }
                Err(e) => {
                    delay = (delay * 2).min(MAX_DELAY);
                    warn!(
                        connection = %inner.name,
                        error = %e,
                        next_attempt_in = ?delay,
                        "reconnect attempt failed"
                    );
                }
            }
        }
        inner.reconnect_busy.store(false, Ordering::Release);
    });
}

/// One reconnect attempt under the gate. The stale transport half is torn
/// down first; on success a fresh epoch replaces the old one, so the prior
/// session's liveness hook is detached before the new one is attached and
/// `connected` flips true. Acquisition then restarts against the new
/// session.
async fn attempt(inner: &Arc<SessionInner>) -> Result<(), LinkError> {
    // Someone else (an explicit connect) may have restored the session
    // while this handler was backing off.
    if inner.connected.load(Ordering::Acquire) {
        return Ok(());
    }
    let permit = inner.gate.acquire("reconnect", CONNECT_GATE_TIMEOUT).await?;
    if inner.connected.load(Ordering::Acquire) {
        return Ok(());
    }
    {
        let mut transport = inner.transport.lock().await;
        transport.disconnect().await;
        transport.connect().await?;
    }
    let scope = inner.new_scope();
    spawn_liveness_watcher(Arc::clone(inner), scope);
    inner.set_connected(true);
    drop(permit);
    inner.acquisition.start(inner).await;
    Ok(())
}
