use crate::config::AlarmLimits;
use serde::{Deserialize, Serialize};

/// Classification of a tag's most recent value. At most one state is
/// current per tag at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    #[default]
    Normal,
    Low,
    High,
    LowLow,
    HighHigh,
    Outlier,
    Error,
}

impl AlarmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmState::Normal => "normal",
            AlarmState::Low => "low",
            AlarmState::High => "high",
            AlarmState::LowLow => "low_low",
            AlarmState::HighHigh => "high_high",
            AlarmState::Outlier => "outlier",
            AlarmState::Error => "error",
        }
    }

    /// True for states that carry an activation timestamp.
    pub fn is_alarm(&self) -> bool {
        !matches!(self, AlarmState::Normal | AlarmState::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdHit {
    pub state: AlarmState,
    /// The limit that matched, when one did.
    pub limit: Option<f64>,
}

impl ThresholdHit {
    pub fn normal() -> Self {
        Self {
            state: AlarmState::Normal,
            limit: None,
        }
    }
}

/// Evaluate a numeric value against configured limits.
///
/// Strict precedence: HighHigh, then LowLow, then High, then Low. The most
/// extreme condition wins even when several limits would match, so a value
/// past both High and HighHigh reports HighHigh. Unset limits are skipped.
pub fn evaluate_thresholds(value: f64, limits: &AlarmLimits) -> ThresholdHit {
    if let Some(hh) = limits.high_high {
        if value >= hh {
            return ThresholdHit {
                state: AlarmState::HighHigh,
                limit: Some(hh),
            };
        }
    }
    if let Some(ll) = limits.low_low {
        if value <= ll {
            return ThresholdHit {
                state: AlarmState::LowLow,
                limit: Some(ll),
            };
        }
    }
    if let Some(h) = limits.high {
        if value >= h {
            return ThresholdHit {
                state: AlarmState::High,
                limit: Some(h),
            };
        }
    }
    if let Some(l) = limits.low {
        if value <= l {
            return ThresholdHit {
                state: AlarmState::Low,
                limit: Some(l),
            };
        }
    }
    ThresholdHit::normal()
}

/// Fill in the `{tag}`, `{value}`, `{limit}` and `{state}` placeholders of
/// an alarm message template.
pub fn render_alarm_message(
    template: &str,
    tag: &str,
    value: f64,
    limit: Option<f64>,
    state: AlarmState,
) -> String {
    template
        .replace("{tag}", tag)
        .replace("{value}", &format!("{}", value))
        .replace(
            "{limit}",
            &limit.map_or_else(|| "-".to_string(), |l| format!("{}", l)),
        )
        .replace("{state}", state.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> AlarmLimits {
        AlarmLimits {
            high_high: Some(90.0),
            high: Some(80.0),
            low: Some(20.0),
            low_low: Some(10.0),
        }
    }

    #[test]
    fn precedence_most_extreme_wins() {
        assert_eq!(evaluate_thresholds(95.0, &limits()).state, AlarmState::HighHigh);
        assert_eq!(evaluate_thresholds(85.0, &limits()).state, AlarmState::High);
        assert_eq!(evaluate_thresholds(15.0, &limits()).state, AlarmState::Low);
        assert_eq!(evaluate_thresholds(5.0, &limits()).state, AlarmState::LowLow);
        assert_eq!(evaluate_thresholds(50.0, &limits()).state, AlarmState::Normal);
    }

    #[test]
    fn limits_are_inclusive() {
        assert_eq!(evaluate_thresholds(90.0, &limits()).state, AlarmState::HighHigh);
        assert_eq!(evaluate_thresholds(80.0, &limits()).state, AlarmState::High);
        assert_eq!(evaluate_thresholds(20.0, &limits()).state, AlarmState::Low);
        assert_eq!(evaluate_thresholds(10.0, &limits()).state, AlarmState::LowLow);
    }

    #[test]
    fn matched_limit_is_reported() {
        let hit = evaluate_thresholds(95.0, &limits());
        assert_eq!(hit.limit, Some(90.0));
    }

    #[test]
    fn unset_limits_are_skipped() {
        let only_low = AlarmLimits {
            low: Some(20.0),
            ..Default::default()
        };
        assert_eq!(evaluate_thresholds(95.0, &only_low).state, AlarmState::Normal);
        assert_eq!(evaluate_thresholds(15.0, &only_low).state, AlarmState::Low);
    }

    #[test]
    fn message_placeholders_are_substituted() {
        let msg = render_alarm_message(
            "{tag} hit {state} at {value} (limit {limit})",
            "flow",
            95.0,
            Some(90.0),
            AlarmState::HighHigh,
        );
        assert_eq!(msg, "flow hit high_high at 95 (limit 90)");
    }
}
