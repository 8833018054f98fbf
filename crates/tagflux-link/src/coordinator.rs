use crate::error::LinkError;
use std::collections::HashSet;
use tagflux_core::{ConnectionConfig, TagAddress};

/// Network action required to move a running session from one
/// configuration to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigPlan {
    /// Not connected: store the configuration, applied lazily on the next
    /// explicit connect.
    Stored,
    /// Endpoint identity changed: full disconnect + reconnect.
    Reconnect,
    /// The active acquisition set changed: re-subscribe on the existing
    /// session, no reconnect.
    RestartAcquisition,
    /// Only non-acquisition values changed (alarm limits, messages,
    /// outlier settings): apply in place, no network action.
    InPlace,
}

/// Decide the cheapest action that makes `new` effective.
pub fn plan(old: &ConnectionConfig, new: &ConnectionConfig, connected: bool) -> ReconfigPlan {
    if !connected {
        return ReconfigPlan::Stored;
    }
    if endpoint_changed(old, new) {
        return ReconfigPlan::Reconnect;
    }
    if acquisition_changed(old, new) {
        return ReconfigPlan::RestartAcquisition;
    }
    ReconfigPlan::InPlace
}

/// Any identity, auth or address field differs. These all live in the
/// backend variant, so comparing it covers endpoint URL, host, port, unit
/// id and credentials at once.
fn endpoint_changed(old: &ConnectionConfig, new: &ConnectionConfig) -> bool {
    old.backend != new.backend
}

/// The set of {address, sampling interval} pairs among *active* tags
/// differs, compared order-independently. Inactive tags and analytics-only
/// fields do not count.
fn acquisition_changed(old: &ConnectionConfig, new: &ConnectionConfig) -> bool {
    fn acquisition_set(config: &ConnectionConfig) -> HashSet<(TagAddress, u64)> {
        config
            .active_tags()
            .map(|t| (t.address.clone(), t.sampling_interval_ms))
            .collect()
    }
    acquisition_set(old) != acquisition_set(new)
}

/// Reject configurations that violate the caller contract. These are
/// programmer errors, not runtime conditions, so they fail hard instead of
/// being absorbed.
pub fn validate(config: &ConnectionConfig) -> Result<(), LinkError> {
    if config.name.trim().is_empty() {
        return Err(LinkError::InvalidConfig(
            "connection name must not be empty".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for tag in &config.tags {
        if tag.name.trim().is_empty() {
            return Err(LinkError::InvalidConfig(format!(
                "connection '{}' has a tag with an empty name",
                config.name
            )));
        }
        if !seen.insert(tag.name.as_str()) {
            return Err(LinkError::InvalidConfig(format!(
                "duplicate tag name '{}' in connection '{}'",
                tag.name, config.name
            )));
        }
    }
    Ok(())
}
