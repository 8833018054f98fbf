use crate::acquisition::AcquisitionEngine;
use crate::coordinator::{self, ReconfigPlan};
use crate::error::LinkError;
use crate::event::LinkEvent;
use crate::gate::ConcurrencyGate;
use crate::metrics::{
    ACQUISITION_ERRORS_TOTAL, ALARM_TRANSITIONS_TOTAL, CONNECTED_SESSIONS, VALUES_ACQUIRED_TOTAL,
};
use crate::reconnect;
use crate::transport::{transport_for, AcquisitionMode, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tagflux_core::{
    AnalyticsEngine, ClassifiedValue, ConnectionConfig, Quality, TagRuntime,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) const CONNECT_GATE_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DISCONNECT_GATE_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const OP_GATE_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const TAG_READ_TIMEOUT: Duration = Duration::from_secs(2);

const EVENT_CHANNEL_SIZE: usize = 256;

/// Owns the network session to one endpoint or device: connect/disconnect,
/// liveness monitoring, backoff-driven reconnection, and the acquisition
/// engine running on top of the session.
///
/// Cheaply cloneable; all clones drive the same underlying session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    pub(crate) name: String,
    /// Captured deep copy of the configuration; swapped on reconfiguration.
    pub(crate) config: Mutex<ConnectionConfig>,
    pub(crate) transport: tokio::sync::Mutex<Box<dyn Transport>>,
    pub(crate) gate: ConcurrencyGate,
    pub(crate) connected: AtomicBool,
    pub(crate) events: broadcast::Sender<LinkEvent>,
    pub(crate) analytics: Mutex<AnalyticsEngine>,
    pub(crate) acquisition: AcquisitionEngine,
    pub(crate) reconnect_busy: AtomicBool,
    /// Manager lifetime; cancelled only when the manager shuts down.
    cancel: CancellationToken,
    /// Per-connection-epoch token. Replaced on every successful (re)connect,
    /// cancelled on disconnect; owns the liveness watcher and notification
    /// tasks of its epoch.
    scope: Mutex<CancellationToken>,
}

impl SessionManager {
    pub fn new(config: ConnectionConfig, transport: Box<dyn Transport>) -> Result<Self, LinkError> {
        coordinator::validate(&config)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let analytics = AnalyticsEngine::new(&config.tags);
        let cancel = CancellationToken::new();
        let scope = cancel.child_token();
        Ok(Self {
            inner: Arc::new(SessionInner {
                name: config.name.clone(),
                config: Mutex::new(config),
                transport: tokio::sync::Mutex::new(transport),
                gate: ConcurrencyGate::new(),
                connected: AtomicBool::new(false),
                events,
                analytics: Mutex::new(analytics),
                acquisition: AcquisitionEngine::new(),
                reconnect_busy: AtomicBool::new(false),
                cancel,
                scope: Mutex::new(scope),
            }),
        })
    }

    /// Build a manager with the adapter matching the configured backend.
    pub fn from_config(config: ConnectionConfig) -> Result<Self, LinkError> {
        let transport = transport_for(&config.backend)?;
        Self::new(config, transport)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of a tag's live state for observation (UI, tests).
    pub fn tag_runtime(&self, tag: &str) -> Option<TagRuntime> {
        self.inner.analytics.lock().unwrap().runtime(tag).cloned()
    }

    pub async fn mode(&self) -> AcquisitionMode {
        self.inner.transport.lock().await.mode()
    }

    /// Establish the session. Idempotent: a call while already connected
    /// returns success without touching the network. On any failure the
    /// transport is torn down again so no partially-open resources remain.
    pub async fn connect(&self) -> Result<(), LinkError> {
        let inner = &self.inner;
        if inner.connected.load(Ordering::Acquire) {
            debug!(connection = %inner.name, "connect: already connected");
            return Ok(());
        }
        let permit = inner.gate.acquire("connect", CONNECT_GATE_TIMEOUT).await?;
        // Re-check: a background reconnect may have won the gate first.
        if inner.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        info!(connection = %inner.name, "connecting");
        {
            let mut transport = inner.transport.lock().await;
            if let Err(e) = transport.connect().await {
                transport.disconnect().await;
                warn!(connection = %inner.name, error = %e, "connect failed");
                return Err(e);
            }
        }
        // Liveness hook attaches before connected flips true, so a session
        // that dies immediately is still noticed.
        let scope = inner.new_scope();
        spawn_liveness_watcher(Arc::clone(inner), scope);
        inner.set_connected(true);
        drop(permit);
        // Acquisition takes the gate itself, so the permit is released first.
        inner.acquisition.start(inner).await;
        Ok(())
    }

    /// Stop acquisition, cancel any in-flight reconnect, and tear the
    /// session down. Idempotent; safe to call when never connected.
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        let inner = &self.inner;
        inner.cancel_scope();
        inner.acquisition.stop(inner).await;
        let _permit = inner
            .gate
            .acquire("disconnect", DISCONNECT_GATE_TIMEOUT)
            .await?;
        inner.transport.lock().await.disconnect().await;
        if inner.set_connected(false) {
            info!(connection = %inner.name, "disconnected");
        }
        Ok(())
    }

    /// Apply a new configuration, deciding whether a reconnect, an
    /// acquisition restart, or no network action is required. Operates on
    /// its own deep copy of `new_config`.
    pub async fn reconfigure(&self, new_config: &ConnectionConfig) -> Result<ReconfigPlan, LinkError> {
        coordinator::validate(new_config)?;
        let new_config = new_config.clone();
        let inner = &self.inner;
        let plan = {
            let current = inner.config.lock().unwrap();
            coordinator::plan(&current, &new_config, self.is_connected())
        };
        info!(connection = %inner.name, plan = ?plan, "applying configuration");
        match plan {
            ReconfigPlan::Stored => {
                // Applied lazily: the next explicit connect uses the new
                // endpoint parameters.
                inner.transport.lock().await.apply_backend(&new_config.backend);
                inner.install_config(new_config);
            }
            ReconfigPlan::InPlace => {
                inner.install_config(new_config);
            }
            ReconfigPlan::RestartAcquisition => {
                inner.acquisition.stop(inner).await;
                inner.install_config(new_config);
                inner.acquisition.start(inner).await;
            }
            ReconfigPlan::Reconnect => {
                self.disconnect().await?;
                inner.transport.lock().await.apply_backend(&new_config.backend);
                inner.install_config(new_config);
                self.connect().await?;
            }
        }
        Ok(plan)
    }

    /// One gated read sweep over all active tags. Driven by an external
    /// scheduler for poll-mode backends.
    pub async fn poll_sweep(&self) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        self.inner.acquisition.poll_sweep(&self.inner).await
    }

    /// Cancel all background activity. The session cannot be reused after.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Err(e) = self.disconnect().await {
            debug!(connection = %self.inner.name, error = %e, "shutdown disconnect");
        }
    }
}

impl SessionInner {
    pub(crate) fn config_snapshot(&self) -> ConnectionConfig {
        self.config.lock().unwrap().clone()
    }

    fn install_config(&self, config: ConnectionConfig) {
        self.analytics.lock().unwrap().apply_config(&config.tags);
        *self.config.lock().unwrap() = config;
    }

    pub(crate) fn classify_batch(
        &self,
        batch: Vec<tagflux_core::AcquiredValue>,
    ) -> Vec<ClassifiedValue> {
        let mut analytics = self.analytics.lock().unwrap();
        batch.into_iter().map(|raw| analytics.ingest(raw)).collect()
    }

    /// Returns true when the flag actually changed.
    pub(crate) fn set_connected(&self, connected: bool) -> bool {
        let changed = self.connected.swap(connected, Ordering::AcqRel) != connected;
        if changed {
            if connected {
                CONNECTED_SESSIONS.inc();
            } else {
                CONNECTED_SESSIONS.dec();
            }
            let _ = self.events.send(LinkEvent::StatusChanged {
                connection: self.name.clone(),
                connected,
            });
        }
        changed
    }

    pub(crate) fn emit_data(&self, values: Vec<ClassifiedValue>) {
        if values.is_empty() {
            return;
        }
        VALUES_ACQUIRED_TOTAL.inc_by(values.len() as u64);
        for value in &values {
            if value.acquired.quality == Quality::Bad {
                ACQUISITION_ERRORS_TOTAL.inc();
            }
            if let Some(t) = &value.transition {
                ALARM_TRANSITIONS_TOTAL.inc();
                match &value.message {
                    Some(msg) => warn!(
                        connection = %self.name,
                        tag = %t.tag,
                        from = t.from.as_str(),
                        to = t.to.as_str(),
                        "{}",
                        msg
                    ),
                    None => info!(
                        connection = %self.name,
                        tag = %t.tag,
                        from = t.from.as_str(),
                        to = t.to.as_str(),
                        "alarm state changed"
                    ),
                }
            }
        }
        let _ = self.events.send(LinkEvent::Data {
            connection: self.name.clone(),
            values,
        });
    }

    /// Start a fresh connection epoch: the previous epoch's tasks (liveness
    /// watcher, notification pump) are cancelled and a new token issued.
    pub(crate) fn new_scope(&self) -> CancellationToken {
        let mut slot = self.scope.lock().unwrap();
        slot.cancel();
        let fresh = self.cancel.child_token();
        *slot = fresh.clone();
        fresh
    }

    pub(crate) fn current_scope(&self) -> CancellationToken {
        self.scope.lock().unwrap().clone()
    }

    pub(crate) fn cancel_scope(&self) {
        self.scope.lock().unwrap().cancel();
    }
}

/// Watch the transport's keep-alive signal for the current epoch. A dead
/// signal flips the session to disconnected and hands off to the reconnect
/// handler; the watcher then exits (reconnection attaches a new one).
pub(crate) fn spawn_liveness_watcher(inner: Arc<SessionInner>, scope: CancellationToken) {
    tokio::spawn(async move {
        let mut liveness = { inner.transport.lock().await.liveness() };
        loop {
            // Check the current value first: a signal that died before the
            // watcher attached must not be missed.
            if !*liveness.borrow_and_update() {
                warn!(connection = %inner.name, "session liveness lost");
                inner.set_connected(false);
                // The handler's own busy flag keeps attempts from
                // overlapping, so spawning unconditionally is safe.
                reconnect::spawn(Arc::clone(&inner));
                break;
            }
            tokio::select! {
                _ = scope.cancelled() => break,
                changed = liveness.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    });
}
