//! Resolution of the user-facing resize configuration into a validated policy

use std::time::Duration;

use crate::crd::{ExpansionMode, ResizeSpec};

use super::quantity::{parse_duration, parse_quantity};
use super::PolicyError;

pub const DEFAULT_USAGE_THRESHOLD: u8 = 80;
pub const DEFAULT_HYSTERESIS: u8 = 50;
pub const DEFAULT_EMERGENCY_THRESHOLD: u8 = 90;
pub const DEFAULT_GROWTH_FACTOR: f64 = 1.5;
pub const DEFAULT_MIN_INCREMENT: u64 = 1 << 30;
pub const DEFAULT_GRANULARITY: u64 = 1 << 20;
pub const DEFAULT_MAX_ACTIONS_PER_WINDOW: u32 = 3;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(24 * 3_600);
pub const DEFAULT_PROPAGATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_MAX_PENDING_WAL_FILES: i32 = 100;

/// WAL protection settings
#[derive(Clone, Debug, PartialEq)]
pub struct WalSafetyPolicy {
    pub acknowledge_wal_risk: bool,
    pub require_archive_healthy: bool,
    pub max_pending_wal_files: i32,
    pub max_slot_retention_bytes: Option<i64>,
}

impl Default for WalSafetyPolicy {
    fn default() -> Self {
        Self {
            acknowledge_wal_risk: false,
            require_archive_healthy: true,
            max_pending_wal_files: DEFAULT_MAX_PENDING_WAL_FILES,
            max_slot_retention_bytes: None,
        }
    }
}

/// Validated, immutable resize policy for one volume role
#[derive(Clone, Debug, PartialEq)]
pub struct ResizePolicy {
    pub trigger_threshold_percent: u8,
    pub hysteresis_percent: u8,
    pub emergency_threshold_percent: u8,
    /// Trigger when fewer bytes than this remain available
    pub min_available: Option<u64>,
    pub growth_factor: f64,
    pub min_increment: u64,
    pub max_increment: Option<u64>,
    /// Absolute ceiling
    pub max_size: Option<u64>,
    pub granularity: u64,
    pub max_resizes_per_window: u32,
    pub window: Duration,
    pub mode: ExpansionMode,
    pub propagation_timeout: Duration,
    pub wal_safety: WalSafetyPolicy,
}

impl Default for ResizePolicy {
    fn default() -> Self {
        Self {
            trigger_threshold_percent: DEFAULT_USAGE_THRESHOLD,
            hysteresis_percent: DEFAULT_HYSTERESIS,
            emergency_threshold_percent: DEFAULT_EMERGENCY_THRESHOLD,
            min_available: None,
            growth_factor: DEFAULT_GROWTH_FACTOR,
            min_increment: DEFAULT_MIN_INCREMENT,
            max_increment: None,
            max_size: None,
            granularity: DEFAULT_GRANULARITY,
            max_resizes_per_window: DEFAULT_MAX_ACTIONS_PER_WINDOW,
            window: DEFAULT_WINDOW,
            mode: ExpansionMode::Online,
            propagation_timeout: DEFAULT_PROPAGATION_TIMEOUT,
            wal_safety: WalSafetyPolicy::default(),
        }
    }
}

impl ResizePolicy {
    /// Resolve a resize spec, applying defaults.
    ///
    /// Returns `Ok(None)` when auto-resize is disabled for the role.
    pub fn from_spec(spec: Option<&ResizeSpec>) -> Result<Option<Self>, PolicyError> {
        let Some(spec) = spec.filter(|s| s.enabled) else {
            return Ok(None);
        };

        let mut policy = ResizePolicy::default();

        if let Some(triggers) = &spec.triggers {
            if let Some(v) = triggers.usage_threshold {
                policy.trigger_threshold_percent = v;
            }
            if let Some(v) = triggers.hysteresis {
                policy.hysteresis_percent = v;
            }
            if let Some(v) = triggers.emergency_threshold {
                policy.emergency_threshold_percent = v;
            }
            if let Some(v) = &triggers.min_available {
                policy.min_available = Some(parse_quantity(v)?);
            }
        }

        if let Some(expansion) = &spec.expansion {
            if let Some(v) = expansion.growth_factor {
                policy.growth_factor = v;
            }
            if let Some(v) = &expansion.min_increment {
                policy.min_increment = parse_quantity(v)?;
            }
            if let Some(v) = &expansion.max_increment {
                policy.max_increment = Some(parse_quantity(v)?);
            }
            if let Some(v) = &expansion.limit {
                policy.max_size = Some(parse_quantity(v)?);
            }
            if let Some(v) = &expansion.granularity {
                policy.granularity = parse_quantity(v)?;
            }
        }

        if let Some(strategy) = &spec.strategy {
            if let Some(v) = strategy.max_actions_per_window {
                policy.max_resizes_per_window = v;
            }
            if let Some(v) = &strategy.window {
                policy.window = parse_duration(v)?;
            }
            if let Some(v) = strategy.mode {
                policy.mode = v;
            }
            if let Some(v) = &strategy.propagation_timeout {
                policy.propagation_timeout = parse_duration(v)?;
            }
            if let Some(wal) = &strategy.wal_safety_policy {
                let safety = &mut policy.wal_safety;
                if let Some(v) = wal.acknowledge_wal_risk {
                    safety.acknowledge_wal_risk = v;
                }
                if let Some(v) = wal.require_archive_healthy {
                    safety.require_archive_healthy = v;
                }
                if let Some(v) = wal.max_pending_wal_files {
                    safety.max_pending_wal_files = v;
                }
                safety.max_slot_retention_bytes = wal.max_slot_retention_bytes;
            }
        }

        policy.validate()?;
        Ok(Some(policy))
    }

    fn validate(&self) -> Result<(), PolicyError> {
        let invalid = |msg: String| Err(PolicyError::Invalid(msg));

        if self.trigger_threshold_percent == 0 || self.trigger_threshold_percent > 100 {
            return invalid(format!(
                "usageThreshold must be within 1-100, got {}",
                self.trigger_threshold_percent
            ));
        }
        if self.hysteresis_percent >= self.trigger_threshold_percent {
            return invalid(format!(
                "hysteresis ({}) must be below usageThreshold ({})",
                self.hysteresis_percent, self.trigger_threshold_percent
            ));
        }
        if self.emergency_threshold_percent > 100
            || self.emergency_threshold_percent < self.trigger_threshold_percent
        {
            return invalid(format!(
                "emergencyThreshold ({}) must be within usageThreshold ({})-100",
                self.emergency_threshold_percent, self.trigger_threshold_percent
            ));
        }
        if !self.growth_factor.is_finite() || self.growth_factor < 1.0 {
            return invalid(format!(
                "growthFactor must be at least 1.0, got {}",
                self.growth_factor
            ));
        }
        if self.growth_factor == 1.0 && self.min_increment == 0 {
            return invalid("growthFactor 1.0 requires a non-zero minIncrement".to_string());
        }
        if self.granularity == 0 {
            return invalid("granularity must be greater than zero".to_string());
        }
        if let Some(max) = self.max_increment {
            if max < self.min_increment {
                return invalid("maxIncrement must not be below minIncrement".to_string());
            }
        }
        if self.max_resizes_per_window == 0 {
            return invalid("maxActionsPerWindow must be at least 1".to_string());
        }
        if self.wal_safety.max_pending_wal_files < 0 {
            return invalid("maxPendingWALFiles must not be negative".to_string());
        }
        Ok(())
    }
}
