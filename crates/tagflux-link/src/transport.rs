use crate::error::LinkError;
use async_trait::async_trait;
use std::time::Duration;
use tagflux_core::{AcquiredValue, BackendConfig, TagAddress, TagValue};
use tokio::sync::{mpsc, watch};

/// How a backend delivers values: server-side push notifications, or
/// request/response polling only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMode {
    Push,
    Poll,
}

/// One tag registered for push delivery.
#[derive(Debug, Clone)]
pub struct SubscriptionItem {
    pub tag: String,
    pub address: TagAddress,
    pub sampling_interval: Duration,
}

/// Result of a subscribe call. Registration failures are per item and never
/// abort the remaining items.
#[derive(Debug, Default)]
pub struct SubscribeOutcome {
    pub accepted: Vec<String>,
    pub rejected: Vec<(String, String)>,
}

/// One value read from the device, with the backend's best timestamp
/// (source time preferred, then server time, then local clock).
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub value: TagValue,
    pub timestamp_us: u64,
}

/// Narrow seam over a vendor transport: connect, disconnect, read,
/// subscribe, and a liveness signal. One adapter per protocol backend keeps
/// SDK churn away from the session and analytics layers.
///
/// Implementations are driven from behind the connection gate through an
/// async mutex, so `Send` suffices and `&mut self` methods never race; the
/// subscribe sink is the only path that delivers data outside the gate.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<(), LinkError>;

    /// Tear down the session. Best effort and idempotent; must be safe to
    /// call when never connected.
    async fn disconnect(&mut self);

    async fn read(&mut self, address: &TagAddress) -> Result<Sample, LinkError>;

    /// Create a server-side subscription delivering change notifications
    /// into `sink`. Only meaningful when `mode()` is `Push`.
    async fn subscribe(
        &mut self,
        items: &[SubscriptionItem],
        publishing_interval: Duration,
        sink: mpsc::Sender<AcquiredValue>,
    ) -> Result<SubscribeOutcome, LinkError>;

    async fn unsubscribe(&mut self) -> Result<(), LinkError>;

    /// Adopt new endpoint/identity parameters. Takes effect on the next
    /// connect; the current session, if any, is not touched.
    fn apply_backend(&mut self, backend: &BackendConfig);

    /// Observed keep-alive state. Flips to `false` when the transport
    /// notices the session has died; the session manager reacts by driving
    /// reconnection.
    fn liveness(&self) -> watch::Receiver<bool>;

    fn mode(&self) -> AcquisitionMode;
}

/// Build the transport adapter for a configured backend.
pub fn transport_for(backend: &BackendConfig) -> Result<Box<dyn Transport>, LinkError> {
    match backend {
        BackendConfig::Modbus { host, port, unit_id } => Ok(Box::new(
            crate::modbus::ModbusTransport::new(host.clone(), *port, *unit_id),
        )),
        #[cfg(feature = "opcua")]
        BackendConfig::OpcUa { endpoint_url, auth } => Ok(Box::new(
            crate::opcua::OpcUaTransport::new(endpoint_url.clone(), auth.clone()),
        )),
        #[cfg(not(feature = "opcua"))]
        BackendConfig::OpcUa { .. } => Err(LinkError::InvalidConfig(
            "built without OPC UA support (enable the 'opcua' feature)".to_string(),
        )),
    }
}
