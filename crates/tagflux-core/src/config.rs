use serde::{Deserialize, Serialize};

/// One monitored endpoint or device together with its tag list.
///
/// Cloning a `ConnectionConfig` is the deep-copy mechanism used whenever a
/// configuration crosses an ownership boundary (reconfiguration, session
/// capture): every field is an owned value, so `Clone` yields a structural
/// copy that later edits of the original cannot disturb.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    pub backend: BackendConfig,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Poll-sweep period for backends without server-side push.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_ms: u64,
    #[serde(default)]
    pub tags: Vec<TagConfig>,
}

impl ConnectionConfig {
    pub fn active_tags(&self) -> impl Iterator<Item = &TagConfig> {
        self.tags.iter().filter(|t| t.active)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum BackendConfig {
    OpcUa {
        endpoint_url: String,
        #[serde(default)]
        auth: OpcUaAuth,
    },
    Modbus {
        host: String,
        #[serde(default = "default_modbus_port")]
        port: u16,
        #[serde(default)]
        unit_id: u8,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpcUaAuth {
    #[default]
    Anonymous,
    UserName {
        user: String,
        password: String,
    },
}

/// A named, individually addressable data point on a device or server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagConfig {
    /// Display key; must be unique within a connection.
    pub name: String,
    pub address: TagAddress,
    #[serde(default = "default_sampling_interval")]
    pub sampling_interval_ms: u64,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_true")]
    pub alarms_enabled: bool,
    #[serde(default)]
    pub limits: AlarmLimits,
    /// Template rendered on alarm transitions; `{tag}`, `{value}`, `{limit}`
    /// and `{state}` placeholders are substituted.
    #[serde(default)]
    pub alarm_message: Option<String>,
    #[serde(default)]
    pub outlier: OutlierConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagAddress {
    /// OPC UA node id string, e.g. `ns=2;s=Line1.Pump.Flow`.
    NodeId(String),
    /// Modbus register or bit address.
    Register { address: u16, kind: RegisterKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Holding,
    Input,
    Coil,
    Discrete,
}

/// Threshold limits. Each limit is independently optional; an unset limit
/// never matches.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AlarmLimits {
    pub high_high: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub low_low: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutlierConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Samples required before the baseline is considered established.
    #[serde(default = "default_baseline_samples")]
    pub baseline_samples: u32,
    /// Standard-deviation multiple beyond which a value is an outlier.
    #[serde(default = "default_std_dev_factor")]
    pub std_dev_factor: f64,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            baseline_samples: default_baseline_samples(),
            std_dev_factor: default_std_dev_factor(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_scan_interval() -> u64 {
    1_000
}

fn default_sampling_interval() -> u64 {
    1_000
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baseline_samples() -> u32 {
    30
}

fn default_std_dev_factor() -> f64 {
    3.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_gets_defaults() {
        let json = r#"{
            "name": "plant-a",
            "backend": { "protocol": "modbus", "host": "10.0.0.5" },
            "tags": [
                { "name": "flow", "address": { "register": { "address": 40001, "kind": "holding" } } }
            ]
        }"#;
        let cfg: ConnectionConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.scan_interval_ms, 1_000);
        let tag = &cfg.tags[0];
        assert!(tag.active);
        assert!(tag.alarms_enabled);
        assert_eq!(tag.sampling_interval_ms, 1_000);
        assert!(!tag.outlier.enabled);
        assert_eq!(tag.outlier.baseline_samples, 30);
        match &cfg.backend {
            BackendConfig::Modbus { port, unit_id, .. } => {
                assert_eq!(*port, 502);
                assert_eq!(*unit_id, 0);
            }
            _ => panic!("expected modbus backend"),
        }
    }

    #[test]
    fn clone_is_a_deep_copy() {
        let mut original = ConnectionConfig {
            name: "plant-a".to_string(),
            backend: BackendConfig::OpcUa {
                endpoint_url: "opc.tcp://10.0.0.5:4840".to_string(),
                auth: OpcUaAuth::Anonymous,
            },
            enabled: true,
            scan_interval_ms: 1_000,
            tags: vec![TagConfig {
                name: "flow".to_string(),
                address: TagAddress::NodeId("ns=2;s=Flow".to_string()),
                sampling_interval_ms: 500,
                active: true,
                alarms_enabled: true,
                limits: AlarmLimits::default(),
                alarm_message: None,
                outlier: OutlierConfig::default(),
            }],
        };
        let snapshot = original.clone();
        original.tags[0].sampling_interval_ms = 50;
        original.tags[0].limits.high = Some(90.0);
        assert_eq!(snapshot.tags[0].sampling_interval_ms, 500);
        assert_eq!(snapshot.tags[0].limits.high, None);
    }
}
