use error_stack::Report;
use serde::Serialize;

use crate::MarketError;
use crate::Result;

/// How an entity's guaranteed share is derived from its maximum capacity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum NominalPolicy {
    /// `nominal = entity frequency / host frequency × max`
    FrequencyRatio { host_frequency_mhz: u64 },
    /// `nominal = fraction × max`, independent of the entity frequency
    BaseCycle { fraction: f64 },
}

impl NominalPolicy {
    /// Guaranteed cycles per second for an entity, never above `max`.
    pub fn nominal(&self, nominal_frequency_mhz: u64, max: u64) -> u64 {
        let ratio = match *self {
            Self::FrequencyRatio { host_frequency_mhz } => {
                nominal_frequency_mhz as f64 / host_frequency_mhz as f64
            }
            Self::BaseCycle { fraction } => fraction,
        };
        ((ratio * max as f64) as u64).min(max)
    }
}

/// Tunable parameters of the auction.
///
/// Triggers and speeds are fractions (`0.95` means 95%), the window size is in
/// cycles per second.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MarketConfig {
    /// Guaranteed share policy
    pub nominal: NominalPolicy,
    /// Relative usage of the capping above which an entity asks for more
    pub trigger_increment: f64,
    /// Relative usage of the capping below which an entity gives cycles back
    pub trigger_decrement: f64,
    /// Relative step applied to the capping of a rising entity
    pub increasing_speed: f64,
    /// Relative step applied to the capping of a falling entity
    pub decreasing_speed: f64,
    /// Maximum cycles one entity may buy in a single bidding round
    pub window_size: u64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            nominal: NominalPolicy::FrequencyRatio {
                host_frequency_mhz: 1000,
            },
            trigger_increment: 0.95,
            trigger_decrement: 0.5,
            increasing_speed: 0.1,
            decreasing_speed: 0.1,
            window_size: 10_000,
        }
    }
}

impl MarketConfig {
    /// Rejects parameter sets the auction cannot run with.
    pub fn validate(&self) -> Result<(), MarketError> {
        match self.nominal {
            NominalPolicy::FrequencyRatio { host_frequency_mhz } if host_frequency_mhz == 0 => {
                return Err(invalid("host frequency must be positive"));
            }
            NominalPolicy::BaseCycle { fraction } if !(fraction > 0.0 && fraction <= 1.0) => {
                return Err(invalid("base-cycle fraction must be in (0, 1]"));
            }
            _ => {}
        }

        if !self.trigger_increment.is_finite() || self.trigger_increment < 0.0 {
            return Err(invalid("trigger_increment must be a non-negative number"));
        }
        if !self.trigger_decrement.is_finite() || self.trigger_decrement < 0.0 {
            return Err(invalid("trigger_decrement must be a non-negative number"));
        }
        if self.trigger_decrement > self.trigger_increment {
            return Err(invalid(
                "trigger_decrement must not exceed trigger_increment",
            ));
        }
        if !self.increasing_speed.is_finite() || self.increasing_speed < 0.0 {
            return Err(invalid("increasing_speed must be a non-negative number"));
        }
        if !(0.0..=1.0).contains(&self.decreasing_speed) {
            return Err(invalid("decreasing_speed must be in [0, 1]"));
        }
        if self.window_size == 0 {
            return Err(invalid("window_size must be positive"));
        }

        Ok(())
    }
}

fn invalid(reason: &str) -> Report<MarketError> {
    error_stack::report!(MarketError::invalid_config(reason))
}
