use serde::Serialize;

/// Cycles per second one fully used CPU provides (microseconds in a second).
pub const CYCLES_PER_CPU: u64 = 1_000_000;

/// Quota currently enforced on an entity, expressed in cycles per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capping {
    #[default]
    Uncapped,
    Limited(u64),
}

impl Capping {
    /// Builds a capping from a raw quota/period pair; a negative quota or a
    /// zero period mean no limit is enforced.
    pub fn from_quota(quota: i64, period: u64) -> Self {
        if quota < 0 || period == 0 {
            return Self::Uncapped;
        }
        Self::Limited((quota as f64 * CYCLES_PER_CPU as f64 / period as f64) as u64)
    }

    pub fn limit(&self) -> Option<u64> {
        match self {
            Self::Uncapped => None,
            Self::Limited(cycles) => Some(*cycles),
        }
    }

    /// Signed form used in reports, `-1` standing for uncapped.
    pub fn as_raw(&self) -> i64 {
        match self {
            Self::Uncapped => -1,
            Self::Limited(cycles) => i64::try_from(*cycles).unwrap_or(i64::MAX),
        }
    }
}

/// Per-tick view of one schedulable entity, as the market sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    pub id: String,
    /// Guaranteed frequency in MHz
    pub nominal_frequency_mhz: u64,
    /// Cycles per second the entity could use at most (vcpus × 1,000,000)
    pub max_capacity: u64,
    /// Cycles per second consumed during the last tick
    pub consumption: u64,
    pub capping: Capping,
    /// Least-squares slope of the recent usage percentages
    pub slope: f64,
    /// False while no consumption counter could be read for the entity
    pub observed: bool,
}

impl EntitySnapshot {
    pub fn new(id: impl Into<String>, nominal_frequency_mhz: u64, max_capacity: u64) -> Self {
        Self {
            id: id.into(),
            nominal_frequency_mhz,
            max_capacity,
            consumption: 0,
            capping: Capping::Uncapped,
            slope: 0.0,
            observed: false,
        }
    }

    pub fn with_consumption(mut self, consumption: u64) -> Self {
        self.consumption = consumption;
        self.observed = true;
        self
    }

    pub fn with_capping(mut self, capping: Capping) -> Self {
        self.capping = capping;
        self
    }

    pub fn with_slope(mut self, slope: f64) -> Self {
        self.slope = slope;
        self
    }

    /// Consumption relative to `capping` (1.0 means the capping is fully used).
    pub fn relative_usage(&self, capping: u64) -> f64 {
        if capping == 0 {
            return if self.consumption == 0 { 0.0 } else { f64::INFINITY };
        }
        self.consumption as f64 / capping as f64
    }
}

/// Demand class of an entity for the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Band {
    /// Usage is not trending: grow slightly above the current usage
    #[display("flat")]
    Flat,
    /// Usage is well below the capping: give cycles back
    #[display("falling")]
    Falling,
    /// Usage is close to the capping: ask for more
    #[display("rising")]
    Rising,
    /// Between the two triggers: keep the capping
    #[display("stable")]
    Stable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capping_from_negative_quota_is_uncapped() {
        assert_eq!(Capping::from_quota(-1, 100_000), Capping::Uncapped);
        assert_eq!(Capping::from_quota(50_000, 0), Capping::Uncapped);
    }

    #[test]
    fn capping_is_normalized_to_one_second() {
        assert_eq!(
            Capping::from_quota(5_000, 10_000),
            Capping::Limited(500_000)
        );
        assert_eq!(
            Capping::from_quota(200_000, 100_000),
            Capping::Limited(2_000_000)
        );
    }

    #[test]
    fn raw_capping_uses_minus_one_sentinel() {
        assert_eq!(Capping::Uncapped.as_raw(), -1);
        assert_eq!(Capping::Limited(42).as_raw(), 42);
    }

    #[test]
    fn relative_usage_handles_zero_capping() {
        let idle = EntitySnapshot::new("vm", 1000, CYCLES_PER_CPU);
        assert_eq!(idle.relative_usage(0), 0.0);

        let busy = idle.with_consumption(10);
        assert!(busy.relative_usage(0).is_infinite());
        assert_eq!(busy.relative_usage(20), 0.5);
    }
}
