#![cfg(feature = "opcua")]

//! OPC UA client adapter.
//!
//! The vendor SDK (`opcua` crate) is kept entirely behind the `Transport`
//! seam: sessions, subscriptions and monitored items never leak out.
//! Security is SecurityPolicy=None with anonymous or username identity;
//! certificate provisioning is out of scope for this client.

use crate::error::LinkError;
use crate::transport::{AcquisitionMode, Sample, SubscribeOutcome, SubscriptionItem, Transport};
use async_trait::async_trait;
use opcua::client::prelude::*;
use opcua::sync::RwLock;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tagflux_core::{clock, AcquiredValue, BackendConfig, OpcUaAuth, Quality, TagAddress, TagValue};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

// Subscription tuning; lifetime must be at least 3x the keep-alive count.
const KEEP_ALIVE_COUNT: u32 = 10;
const LIFETIME_COUNT: u32 = 30;

pub struct OpcUaTransport {
    endpoint_url: String,
    auth: OpcUaAuth,
    session: Option<Arc<RwLock<Session>>>,
    subscription_id: Option<u32>,
    /// client handle -> tag name, shared with the data-change callback.
    handles: Arc<Mutex<HashMap<u32, String>>>,
    liveness: watch::Sender<bool>,
}

impl OpcUaTransport {
    pub fn new(endpoint_url: String, auth: OpcUaAuth) -> Self {
        let (liveness, _) = watch::channel(false);
        Self {
            endpoint_url,
            auth,
            session: None,
            subscription_id: None,
            handles: Arc::new(Mutex::new(HashMap::new())),
            liveness,
        }
    }

    fn session(&self) -> Result<&Arc<RwLock<Session>>, LinkError> {
        self.session.as_ref().ok_or(LinkError::NotConnected)
    }

    fn parse_node(&self, address: &TagAddress) -> Result<NodeId, LinkError> {
        match address {
            TagAddress::NodeId(s) => NodeId::from_str(s)
                .map_err(|_| LinkError::Read(format!("invalid node id '{}'", s))),
            TagAddress::Register { address, .. } => Err(LinkError::Read(format!(
                "register {} is not an OPC UA address",
                address
            ))),
        }
    }
}

#[async_trait]
impl Transport for OpcUaTransport {
    async fn connect(&mut self) -> Result<(), LinkError> {
        if self.session.is_some() {
            return Ok(());
        }
        let mut client = ClientBuilder::new()
            .application_name("tagflux")
            .application_uri("urn:tagflux:client")
            .product_uri("urn:tagflux:client")
            .trust_server_certs(true)
            .create_sample_keypair(true)
            .session_retry_limit(0)
            .client()
            .ok_or_else(|| LinkError::Connect("failed to build OPC UA client".to_string()))?;

        let identity = match &self.auth {
            OpcUaAuth::Anonymous => IdentityToken::Anonymous,
            OpcUaAuth::UserName { user, password } => {
                IdentityToken::UserName(user.clone(), password.clone())
            }
        };

        let endpoint: EndpointDescription = (
            self.endpoint_url.as_ref(),
            SecurityPolicy::None.to_str(),
            MessageSecurityMode::None,
            UserTokenPolicy::anonymous(),
        )
            .into();

        let session = client
            .connect_to_endpoint(endpoint, identity)
            .map_err(|status| {
                LinkError::Connect(format!("{}: {}", self.endpoint_url, status))
            })?;

        {
            let session_ref = session.read();
            let liveness = self.liveness.clone();
            session_ref.set_connection_status_callback(ConnectionStatusCallback::new(
                move |connected| {
                    liveness.send_replace(connected);
                },
            ));
            let liveness = self.liveness.clone();
            session_ref.set_session_closed_callback(SessionClosedCallback::new(move |status| {
                warn!(%status, "OPC UA session closed");
                liveness.send_replace(false);
            }));
        }

        info!(endpoint = %self.endpoint_url, "OPC UA session established");
        self.session = Some(session);
        self.liveness.send_replace(true);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.subscription_id = None;
        self.handles.lock().unwrap().clear();
        if let Some(session) = self.session.take() {
            session.read().disconnect();
            info!(endpoint = %self.endpoint_url, "OPC UA session closed");
        }
        self.liveness.send_replace(false);
    }

    async fn read(&mut self, address: &TagAddress) -> Result<Sample, LinkError> {
        let node_id = self.parse_node(address)?;
        let session = self.session()?;
        let results = session
            .read()
            .read(
                &[ReadValueId::from(&node_id)],
                TimestampsToReturn::Both,
                0.0,
            )
            .map_err(|status| LinkError::Read(format!("{}: {}", node_id, status)))?;
        let data_value = results
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::Read(format!("{}: empty read result", node_id)))?;
        data_value_to_sample(&data_value)
            .ok_or_else(|| LinkError::Read(format!("{}: no usable value", node_id)))
    }

    async fn subscribe(
        &mut self,
        items: &[SubscriptionItem],
        publishing_interval: Duration,
        sink: mpsc::Sender<AcquiredValue>,
    ) -> Result<SubscribeOutcome, LinkError> {
        let session = self.session()?.clone();
        let handles = Arc::clone(&self.handles);

        let callback_handles = Arc::clone(&self.handles);
        let subscription_id = session
            .read()
            .create_subscription(
                publishing_interval.as_millis() as f64,
                LIFETIME_COUNT,
                KEEP_ALIVE_COUNT,
                0,
                0,
                true,
                DataChangeCallback::new(move |changed_items| {
                    let names = callback_handles.lock().unwrap();
                    for item in changed_items {
                        let Some(tag) = names.get(&item.client_handle()) else {
                            continue;
                        };
                        let value = notification_to_value(tag, item.last_value());
                        // Queue full means a newer value is right behind;
                        // dropping matches the latest-value-only contract.
                        let _ = sink.try_send(value);
                    }
                }),
            )
            .map_err(|status| LinkError::Subscribe(status.to_string()))?;

        let mut requests = Vec::with_capacity(items.len());
        let mut request_tags = Vec::with_capacity(items.len());
        let mut outcome = SubscribeOutcome::default();
        for (index, item) in items.iter().enumerate() {
            let node_id = match self.parse_node(&item.address) {
                Ok(node_id) => node_id,
                Err(e) => {
                    outcome.rejected.push((item.tag.clone(), e.to_string()));
                    continue;
                }
            };
            let client_handle = index as u32 + 1;
            requests.push(MonitoredItemCreateRequest {
                item_to_monitor: ReadValueId::from(&node_id),
                monitoring_mode: MonitoringMode::Reporting,
                requested_parameters: MonitoringParameters {
                    client_handle,
                    sampling_interval: item.sampling_interval.as_millis() as f64,
                    filter: ExtensionObject::null(),
                    // Latest value only: depth-one queue, discard oldest.
                    queue_size: 1,
                    discard_oldest: true,
                },
            });
            request_tags.push((client_handle, item.tag.clone()));
        }

        if !requests.is_empty() {
            let results = session
                .read()
                .create_monitored_items(subscription_id, TimestampsToReturn::Both, &requests)
                .map_err(|status| LinkError::Subscribe(status.to_string()))?;
            let mut names = handles.lock().unwrap();
            for ((client_handle, tag), result) in request_tags.into_iter().zip(results) {
                if result.status_code.is_good() {
                    names.insert(client_handle, tag.clone());
                    outcome.accepted.push(tag);
                } else {
                    outcome
                        .rejected
                        .push((tag, result.status_code.to_string()));
                }
            }
        }

        self.subscription_id = Some(subscription_id);
        Ok(outcome)
    }

    async fn unsubscribe(&mut self) -> Result<(), LinkError> {
        self.handles.lock().unwrap().clear();
        let Some(subscription_id) = self.subscription_id.take() else {
            return Ok(());
        };
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        session
            .read()
            .delete_subscription(subscription_id)
            .map(|_| ())
            .map_err(|status| LinkError::Subscribe(status.to_string()))
    }

    fn apply_backend(&mut self, backend: &BackendConfig) {
        if let BackendConfig::OpcUa { endpoint_url, auth } = backend {
            self.endpoint_url = endpoint_url.clone();
            self.auth = auth.clone();
        }
    }

    fn liveness(&self) -> watch::Receiver<bool> {
        self.liveness.subscribe()
    }

    fn mode(&self) -> AcquisitionMode {
        AcquisitionMode::Push
    }
}

fn variant_to_tag_value(variant: &Variant) -> Option<TagValue> {
    match variant {
        Variant::Boolean(v) => Some(TagValue::Bool(*v)),
        Variant::SByte(v) => Some(TagValue::Integer(i64::from(*v))),
        Variant::Byte(v) => Some(TagValue::Integer(i64::from(*v))),
        Variant::Int16(v) => Some(TagValue::Integer(i64::from(*v))),
        Variant::UInt16(v) => Some(TagValue::Integer(i64::from(*v))),
        Variant::Int32(v) => Some(TagValue::Integer(i64::from(*v))),
        Variant::UInt32(v) => Some(TagValue::Integer(i64::from(*v))),
        Variant::Int64(v) => Some(TagValue::Integer(*v)),
        Variant::UInt64(v) => Some(TagValue::Integer(*v as i64)),
        Variant::Float(v) => Some(TagValue::Float(f64::from(*v))),
        Variant::Double(v) => Some(TagValue::Float(*v)),
        Variant::String(v) => Some(TagValue::Text(v.to_string())),
        _ => None,
    }
}

fn timestamp_us(data_value: &DataValue) -> u64 {
    let to_us = |dt: &DateTime| {
        let micros = dt.as_chrono().timestamp_micros();
        (micros > 0).then_some(micros as u64)
    };
    clock::resolve_timestamp(
        data_value.source_timestamp.as_ref().and_then(to_us),
        data_value.server_timestamp.as_ref().and_then(to_us),
    )
}

fn data_value_to_sample(data_value: &DataValue) -> Option<Sample> {
    let good = data_value
        .status
        .map(|status| status.is_good())
        .unwrap_or(true);
    if !good {
        return None;
    }
    let value = data_value.value.as_ref().and_then(variant_to_tag_value)?;
    Some(Sample {
        value,
        timestamp_us: timestamp_us(data_value),
    })
}

fn notification_to_value(tag: &str, data_value: &DataValue) -> AcquiredValue {
    let good = data_value
        .status
        .map(|status| status.is_good())
        .unwrap_or(true);
    if !good {
        let status = data_value.status.unwrap_or(StatusCode::BadUnexpectedError);
        return AcquiredValue::bad(tag, timestamp_us(data_value), status.to_string());
    }
    match data_value.value.as_ref().and_then(variant_to_tag_value) {
        Some(value) => AcquiredValue {
            tag: tag.to_string(),
            value: Some(value),
            timestamp_us: timestamp_us(data_value),
            quality: Quality::Good,
            error: None,
        },
        None => AcquiredValue::bad(tag, timestamp_us(data_value), "unsupported variant type"),
    }
}
