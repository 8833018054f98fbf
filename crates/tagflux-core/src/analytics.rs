use crate::alarm::{evaluate_thresholds, render_alarm_message, AlarmState, ThresholdHit};
use crate::baseline::BaselineState;
use crate::config::TagConfig;
use crate::value::{AcquiredValue, Quality, TagValue};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An acquired value after classification, ready for event consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedValue {
    pub acquired: AcquiredValue,
    pub state: AlarmState,
    /// Threshold limit that matched, when the state came from a limit.
    pub limit: Option<f64>,
    /// Present only when the tag's current state actually changed.
    pub transition: Option<AlarmTransition>,
    /// Rendered alarm message, on transitions into an alarm state.
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmTransition {
    pub tag: String,
    pub from: AlarmState,
    pub to: AlarmState,
    pub at_us: u64,
}

/// Live per-tag state: current classification, activation timestamp and the
/// outlier baseline. Owned here and written from exactly one acquisition
/// path at a time; observers read snapshots instead of sharing mutable
/// fields.
#[derive(Debug, Clone, Default)]
pub struct TagRuntime {
    pub state: AlarmState,
    /// Set when entering a non-Normal, non-Error state; cleared on Normal.
    pub active_since_us: Option<u64>,
    pub baseline: BaselineState,
    pub last_value: Option<TagValue>,
    pub last_quality: Quality,
    pub last_timestamp_us: u64,
}

struct TagSlot {
    config: TagConfig,
    runtime: TagRuntime,
}

/// Stateless interface, stateful per tag: every acquired value passes
/// through `ingest`, which combines the threshold evaluator and the outlier
/// detector and maintains the per-tag alarm state machine.
pub struct AnalyticsEngine {
    tags: HashMap<String, TagSlot>,
}

impl AnalyticsEngine {
    pub fn new(tags: &[TagConfig]) -> Self {
        let mut engine = Self {
            tags: HashMap::new(),
        };
        engine.apply_config(tags);
        engine
    }

    /// Install a new tag set. A tag keeps its baseline and alarm state
    /// across reconfiguration unless its outlier settings changed; toggling
    /// or re-parameterizing outlier detection clears the baseline so it
    /// re-accumulates from scratch. Removed tags are dropped.
    pub fn apply_config(&mut self, tags: &[TagConfig]) {
        let mut next: HashMap<String, TagSlot> = HashMap::with_capacity(tags.len());
        for tag in tags {
            let runtime = match self.tags.remove(&tag.name) {
                Some(mut slot) => {
                    if slot.config.outlier != tag.outlier {
                        debug!("outlier settings changed for '{}', baseline reset", tag.name);
                        slot.runtime.baseline.reset();
                    }
                    slot.runtime
                }
                None => TagRuntime::default(),
            };
            next.insert(
                tag.name.clone(),
                TagSlot {
                    config: tag.clone(),
                    runtime,
                },
            );
        }
        self.tags = next;
    }

    pub fn runtime(&self, tag: &str) -> Option<&TagRuntime> {
        self.tags.get(tag).map(|slot| &slot.runtime)
    }

    /// Classify one acquired value and update the owning tag's state.
    ///
    /// Error (bad quality or failed numeric conversion) takes precedence
    /// over everything and resets the baseline; an enabled outlier detector
    /// overrides the threshold result; thresholds otherwise decide.
    pub fn ingest(&mut self, raw: AcquiredValue) -> ClassifiedValue {
        let slot = match self.tags.get_mut(&raw.tag) {
            Some(slot) => slot,
            None => {
                // Not part of the active tag set; classify as Error but
                // there is no state machine to advance.
                return ClassifiedValue {
                    state: AlarmState::Error,
                    limit: None,
                    transition: None,
                    message: None,
                    acquired: AcquiredValue {
                        error: Some(format!("unknown tag '{}'", raw.tag)),
                        ..raw
                    },
                };
            }
        };

        let numeric = if raw.quality == Quality::Bad {
            None
        } else {
            raw.value.as_ref().and_then(TagValue::as_f64)
        };

        let (state, limit) = match numeric {
            None => {
                slot.runtime.baseline.reset();
                (AlarmState::Error, None)
            }
            Some(value) => {
                let hit = if slot.config.alarms_enabled {
                    evaluate_thresholds(value, &slot.config.limits)
                } else {
                    ThresholdHit::normal()
                };
                let outlier = slot.config.outlier.enabled
                    && slot.runtime.baseline.observe(value, &slot.config.outlier);
                if outlier {
                    // The outlier detector has the final say over the
                    // threshold result for live classification.
                    (AlarmState::Outlier, None)
                } else {
                    (hit.state, hit.limit)
                }
            }
        };

        slot.runtime.last_value = raw.value.clone();
        slot.runtime.last_quality = raw.quality;
        slot.runtime.last_timestamp_us = raw.timestamp_us;

        let transition = if state != slot.runtime.state {
            let from = slot.runtime.state;
            slot.runtime.state = state;
            if state == AlarmState::Normal {
                slot.runtime.active_since_us = None;
            } else if state.is_alarm() {
                slot.runtime.active_since_us = Some(raw.timestamp_us);
            }
            Some(AlarmTransition {
                tag: raw.tag.clone(),
                from,
                to: state,
                at_us: raw.timestamp_us,
            })
        } else {
            None
        };

        let message = match (&transition, numeric) {
            (Some(t), Some(value)) if t.to.is_alarm() => slot
                .config
                .alarm_message
                .as_deref()
                .map(|tpl| render_alarm_message(tpl, &raw.tag, value, limit, t.to)),
            _ => None,
        };

        ClassifiedValue {
            acquired: raw,
            state,
            limit,
            transition,
            message,
        }
    }
}
