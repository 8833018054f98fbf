use crate::error::LinkError;
use crate::session::{SessionInner, OP_GATE_TIMEOUT, TAG_READ_TIMEOUT};
use crate::transport::{AcquisitionMode, SubscriptionItem};
use std::collections::HashMap;
use std::time::Duration;
use tagflux_core::{clock, AcquiredValue, TagAddress, TagConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Floor for the derived publishing interval; servers reject or misbehave
/// below this.
const MIN_PUBLISHING_INTERVAL: Duration = Duration::from_millis(100);

const NOTIFICATION_CHANNEL_SIZE: usize = 256;

struct PushSubscription {
    notify_task: JoinHandle<()>,
}

/// Drives data flow once a session exists. Push-capable backends get a
/// server-side subscription over the active tag set plus a notification
/// pump; poll-only backends are swept on demand by an external scheduler
/// through `poll_sweep`.
pub struct AcquisitionEngine {
    active: tokio::sync::Mutex<Option<PushSubscription>>,
}

impl AcquisitionEngine {
    pub(crate) fn new() -> Self {
        Self {
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Start acquisition for the current configuration. Any previous
    /// subscription is torn down first. Failures are absorbed: a backend
    /// that cannot subscribe right now will be retried by the next
    /// reconnect or reconfiguration, and rejected items surface as
    /// Error-quality values rather than aborting the rest.
    pub(crate) async fn start(&self, inner: &std::sync::Arc<SessionInner>) {
        self.stop(inner).await;

        let config = inner.config_snapshot();
        let active_tags: Vec<TagConfig> = config.active_tags().cloned().collect();
        if active_tags.is_empty() {
            debug!(connection = %inner.name, "no active tags, acquisition idle");
            return;
        }

        let mode = { inner.transport.lock().await.mode() };
        match mode {
            AcquisitionMode::Push => self.start_push(inner, &active_tags).await,
            AcquisitionMode::Poll => {
                info!(
                    connection = %inner.name,
                    tags = active_tags.len(),
                    scan_interval_ms = config.scan_interval_ms,
                    "poll acquisition ready"
                );
            }
        }
    }

    async fn start_push(&self, inner: &std::sync::Arc<SessionInner>, tags: &[TagConfig]) {
        let permit = match inner.gate.acquire("subscribe", OP_GATE_TIMEOUT).await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(connection = %inner.name, error = %e, "subscribe skipped");
                return;
            }
        };

        let publishing_interval = derive_publishing_interval(tags);
        let items: Vec<SubscriptionItem> = tags
            .iter()
            .map(|t| SubscriptionItem {
                tag: t.name.clone(),
                address: t.address.clone(),
                sampling_interval: Duration::from_millis(t.sampling_interval_ms),
            })
            .collect();

        let (tx, mut rx) = mpsc::channel(NOTIFICATION_CHANNEL_SIZE);
        let outcome = {
            let mut transport = inner.transport.lock().await;
            transport.subscribe(&items, publishing_interval, tx).await
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(connection = %inner.name, error = %e, "subscription failed");
                return;
            }
        };

        info!(
            connection = %inner.name,
            accepted = outcome.accepted.len(),
            rejected = outcome.rejected.len(),
            publishing_interval_ms = publishing_interval.as_millis() as u64,
            "subscription live"
        );

        // Items the server refused are marked Error on their tag without
        // aborting the rest.
        if !outcome.rejected.is_empty() {
            let now = clock::unix_us();
            let batch = outcome
                .rejected
                .iter()
                .map(|(tag, reason)| AcquiredValue::bad(tag.clone(), now, reason.clone()))
                .collect();
            inner.emit_data(inner.classify_batch(batch));
        }

        // Immediate one-shot read of the accepted items, so observers see a
        // value before the first change notification arrives.
        let addresses: HashMap<&str, &TagAddress> = items
            .iter()
            .map(|i| (i.tag.as_str(), &i.address))
            .collect();
        let mut initial = Vec::with_capacity(outcome.accepted.len());
        {
            let mut transport = inner.transport.lock().await;
            for tag in &outcome.accepted {
                let Some(address) = addresses.get(tag.as_str()) else {
                    continue;
                };
                let acquired =
                    match tokio::time::timeout(TAG_READ_TIMEOUT, transport.read(address)).await {
                        Ok(Ok(sample)) => {
                            AcquiredValue::good(tag.clone(), sample.value, sample.timestamp_us)
                        }
                        Ok(Err(e)) => AcquiredValue::bad(tag.clone(), clock::unix_us(), e.to_string()),
                        Err(_) => {
                            AcquiredValue::bad(tag.clone(), clock::unix_us(), "initial read timed out")
                        }
                    };
                initial.push(acquired);
            }
        }
        inner.emit_data(inner.classify_batch(initial));
        drop(permit);

        // Notification pump: runs outside the gate for the rest of the
        // epoch and only touches per-tag state.
        let scope = inner.current_scope();
        let pump_inner = std::sync::Arc::clone(inner);
        let notify_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = scope.cancelled() => break,
                    received = rx.recv() => {
                        let Some(raw) = received else { break };
                        pump_inner.emit_data(pump_inner.classify_batch(vec![raw]));
                    }
                }
            }
        });

        *self.active.lock().await = Some(PushSubscription { notify_task });
    }

    /// Tear down the push subscription if one is running. Safe to call when
    /// nothing is.
    pub(crate) async fn stop(&self, inner: &std::sync::Arc<SessionInner>) {
        let Some(subscription) = self.active.lock().await.take() else {
            return;
        };
        subscription.notify_task.abort();
        match inner.gate.acquire("unsubscribe", OP_GATE_TIMEOUT).await {
            Ok(_permit) => {
                if let Err(e) = inner.transport.lock().await.unsubscribe().await {
                    debug!(connection = %inner.name, error = %e, "unsubscribe failed");
                }
            }
            Err(e) => {
                warn!(connection = %inner.name, error = %e, "unsubscribe skipped");
            }
        }
        info!(connection = %inner.name, "acquisition stopped");
    }

    /// One scheduled read sweep over all active tags. Each tag read is
    /// independently guarded: a failure or timeout yields an Error-quality
    /// value for that tag only and the sweep continues.
    pub(crate) async fn poll_sweep(
        &self,
        inner: &std::sync::Arc<SessionInner>,
    ) -> Result<(), LinkError> {
        let _permit = inner.gate.acquire("poll sweep", OP_GATE_TIMEOUT).await?;
        let config = inner.config_snapshot();
        let mut batch = Vec::new();
        {
            let mut transport = inner.transport.lock().await;
            for tag in config.active_tags() {
                let acquired = match tokio::time::timeout(
                    TAG_READ_TIMEOUT,
                    transport.read(&tag.address),
                )
                .await
                {
                    Ok(Ok(sample)) => {
                        AcquiredValue::good(tag.name.clone(), sample.value, sample.timestamp_us)
                    }
                    Ok(Err(e)) => {
                        AcquiredValue::bad(tag.name.clone(), clock::unix_us(), e.to_string())
                    }
                    Err(_) => {
                        AcquiredValue::bad(tag.name.clone(), clock::unix_us(), "read timed out")
                    }
                };
                batch.push(acquired);
            }
        }
        drop(_permit);
        inner.emit_data(inner.classify_batch(batch));
        Ok(())
    }
}

/// Publishing interval for a new subscription: the fastest requested
/// per-tag sampling interval among active tags, clamped to a sane minimum.
fn derive_publishing_interval(tags: &[TagConfig]) -> Duration {
    tags.iter()
        .map(|t| Duration::from_millis(t.sampling_interval_ms))
        .min()
        .unwrap_or(MIN_PUBLISHING_INTERVAL)
        .max(MIN_PUBLISHING_INTERVAL)
}
