use tagflux_core::ClassifiedValue;

/// Events emitted by a session for logging, UI and plotting consumers.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    StatusChanged {
        connection: String,
        connected: bool,
    },
    /// Post-classification values; one entry per push notification, one
    /// batch per poll sweep.
    Data {
        connection: String,
        values: Vec<ClassifiedValue>,
    },
}
