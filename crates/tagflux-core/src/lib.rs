pub mod alarm;
pub mod analytics;
pub mod baseline;
pub mod clock;
pub mod config;
pub mod store;
pub mod value;

pub use alarm::{evaluate_thresholds, render_alarm_message, AlarmState, ThresholdHit};
pub use analytics::{AlarmTransition, AnalyticsEngine, ClassifiedValue, TagRuntime};
pub use baseline::{BaselineState, STD_DEV_TOLERANCE};
pub use config::{
    AlarmLimits, BackendConfig, ConnectionConfig, OpcUaAuth, OutlierConfig, RegisterKind,
    TagAddress, TagConfig,
};
pub use store::{Settings, SettingsStore};
pub use value::{AcquiredValue, Quality, TagValue};
