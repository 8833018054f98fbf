pub mod coordinator;
pub mod error;
pub mod event;
pub mod gate;
pub mod metrics;
pub mod modbus;
#[cfg(feature = "opcua")]
pub mod opcua;
pub mod session;
pub mod transport;

mod acquisition;
mod reconnect;

pub use coordinator::ReconfigPlan;
pub use error::LinkError;
pub use event::LinkEvent;
pub use gate::{ConcurrencyGate, GatePermit};
pub use session::SessionManager;
pub use transport::{
    transport_for, AcquisitionMode, Sample, SubscribeOutcome, SubscriptionItem, Transport,
};
