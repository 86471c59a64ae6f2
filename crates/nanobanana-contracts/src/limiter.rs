use serde::{Deserialize, Deserializer, Serialize};

pub const DEFAULT_LIMIT_MAX: u64 = 100;

/// Ceiling on automatic (render-triggered) API calls.
///
/// Manual runs never consult the limiter; only the automatic path does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterState {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max", deserialize_with = "deserialize_max")]
    pub max: u64,
    #[serde(default)]
    pub used: u64,
}

impl Default for LimiterState {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max: default_max(),
            used: 0,
        }
    }
}

impl LimiterState {
    pub fn new(enabled: bool, max: u64, used: u64) -> Self {
        Self {
            enabled,
            max: max.max(1),
            used,
        }
    }

    pub fn should_proceed(&self) -> bool {
        !self.enabled || self.used < self.max
    }

    pub fn record(self) -> Self {
        Self {
            used: self.used.saturating_add(1),
            ..self
        }
    }

    pub fn reset(self) -> Self {
        Self { used: 0, ..self }
    }

    pub fn remaining(&self) -> Option<u64> {
        self.enabled.then(|| self.max.saturating_sub(self.used))
    }
}

fn default_enabled() -> bool {
    true
}

fn default_max() -> u64 {
    DEFAULT_LIMIT_MAX
}

fn deserialize_max<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    Ok(u64::deserialize(deserializer)?.max(1))
}

#[cfg(test)]
mod tests {
    use super::LimiterState;

    #[test]
    fn enabled_limiter_stops_at_ceiling() {
        assert!(LimiterState::new(true, 3, 2).should_proceed());
        assert!(!LimiterState::new(true, 3, 3).should_proceed());
        assert!(!LimiterState::new(true, 3, 7).should_proceed());
    }

    #[test]
    fn disabled_limiter_always_permits() {
        assert!(LimiterState::new(false, 3, 3).should_proceed());
        assert!(LimiterState::new(false, 1, 500).should_proceed());
    }

    #[test]
    fn record_is_monotonic_and_reset_returns_to_zero() {
        let state = LimiterState::new(true, 2, 0).record().record();
        assert_eq!(state.used, 2);
        assert!(!state.should_proceed());

        let reset = state.reset();
        assert_eq!(reset.used, 0);
        assert_eq!(reset.max, 2);
        assert!(reset.enabled);
    }

    #[test]
    fn max_is_clamped_to_one() {
        assert_eq!(LimiterState::new(true, 0, 0).max, 1);
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() -> anyhow::Result<()> {
        let state: LimiterState = serde_json::from_str(r#"{"used": 4}"#)?;
        assert_eq!(state, LimiterState::new(true, 100, 4));
        assert_eq!(state.remaining(), Some(96));
        Ok(())
    }

    #[test]
    fn stored_zero_max_loads_as_one() -> anyhow::Result<()> {
        let state: LimiterState = serde_json::from_str(r#"{"enabled": true, "max": 0}"#)?;
        assert_eq!(state.max, 1);
        assert!(state.should_proceed());
        assert!(!state.record().should_proceed());
        Ok(())
    }
}
