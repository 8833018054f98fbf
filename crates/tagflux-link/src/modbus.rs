use crate::error::LinkError;
use crate::transport::{AcquisitionMode, Sample, SubscribeOutcome, SubscriptionItem, Transport};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tagflux_core::{clock, AcquiredValue, BackendConfig, RegisterKind, TagAddress, TagValue};
use tokio::sync::{mpsc, watch};
use tokio_modbus::client::{tcp, Context, Reader};
use tokio_modbus::slave::Slave;
use tracing::{debug, info, warn};

/// Poll-only Modbus TCP adapter. One register or bit per tag; devices have
/// no timestamps of their own, so samples carry the local clock.
pub struct ModbusTransport {
    host: String,
    port: u16,
    unit_id: u8,
    ctx: Option<Context>,
    liveness: watch::Sender<bool>,
}

impl ModbusTransport {
    pub fn new(host: String, port: u16, unit_id: u8) -> Self {
        let (liveness, _) = watch::channel(false);
        Self {
            host,
            port,
            unit_id,
            ctx: None,
            liveness,
        }
    }

    fn mark_dead(&self, reason: &str) {
        debug!(reason, "modbus transport marked dead");
        self.liveness.send_replace(false);
    }
}

#[async_trait]
impl Transport for ModbusTransport {
    async fn connect(&mut self) -> Result<(), LinkError> {
        if self.ctx.is_some() {
            return Ok(());
        }
        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| LinkError::InvalidConfig(format!("bad modbus address: {}", e)))?;
        let ctx = tcp::connect_slave(addr, Slave(self.unit_id))
            .await
            .map_err(|e| LinkError::Connect(format!("{}: {}", addr, e)))?;
        info!(addr = %addr, unit_id = self.unit_id, "modbus connected");
        self.ctx = Some(ctx);
        self.liveness.send_replace(true);
        Ok(())
    }

    async fn disconnect(&mut self) {
        // Dropping the context closes the TCP stream.
        if self.ctx.take().is_some() {
            info!(host = %self.host, "modbus disconnected");
        }
        self.liveness.send_replace(false);
    }

    async fn read(&mut self, address: &TagAddress) -> Result<Sample, LinkError> {
        let (register, kind) = match address {
            TagAddress::Register { address, kind } => (*address, *kind),
            TagAddress::NodeId(node) => {
                return Err(LinkError::Read(format!(
                    "node id '{}' is not a modbus address",
                    node
                )))
            }
        };
        let ctx = self.ctx.as_mut().ok_or(LinkError::NotConnected)?;

        let value = match kind {
            RegisterKind::Holding => ctx
                .read_holding_registers(register, 1)
                .await
                .map(|words| words.first().map(|w| TagValue::Integer(i64::from(*w)))),
            RegisterKind::Input => ctx
                .read_input_registers(register, 1)
                .await
                .map(|words| words.first().map(|w| TagValue::Integer(i64::from(*w)))),
            RegisterKind::Coil => ctx
                .read_coils(register, 1)
                .await
                .map(|bits| bits.first().map(|b| TagValue::Bool(*b))),
            RegisterKind::Discrete => ctx
                .read_discrete_inputs(register, 1)
                .await
                .map(|bits| bits.first().map(|b| TagValue::Bool(*b))),
        };

        match value {
            Ok(Some(value)) => Ok(Sample {
                value,
                timestamp_us: clock::unix_us(),
            }),
            Ok(None) => Err(LinkError::Read(format!(
                "register {}: empty response",
                register
            ))),
            Err(e) => {
                warn!(register, error = %e, "modbus read failed");
                self.mark_dead("read error");
                Err(LinkError::Read(format!("register {}: {}", register, e)))
            }
        }
    }

    async fn subscribe(
        &mut self,
        _items: &[SubscriptionItem],
        _publishing_interval: Duration,
        _sink: mpsc::Sender<AcquiredValue>,
    ) -> Result<SubscribeOutcome, LinkError> {
        Err(LinkError::Subscribe(
            "modbus has no server-side subscriptions".to_string(),
        ))
    }

    async fn unsubscribe(&mut self) -> Result<(), LinkError> {
        Ok(())
    }

    fn apply_backend(&mut self, backend: &BackendConfig) {
        if let BackendConfig::Modbus { host, port, unit_id } = backend {
            self.host = host.clone();
            self.port = *port;
            self.unit_id = *unit_id;
        }
    }

    fn liveness(&self) -> watch::Receiver<bool> {
        self.liveness.subscribe()
    }

    fn mode(&self) -> AcquisitionMode {
        AcquisitionMode::Poll
    }
}
