use std::sync::Arc;

use market::CYCLES_PER_CPU;

use super::CgroupLayout;
use crate::registry::EntityDescriptor;
use crate::ControllerError;
use crate::Result;

/// Smallest quota the kernel accepts for a CFS period, in µs.
const MIN_QUOTA_US: u64 = 1_000;

/// What an enforcement call ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforced {
    /// A quota of that many µs per period was written
    Quota(u64),
    /// The limit was removed
    Unlimited,
    /// Nothing was written, the control file does not exist
    Skipped,
}

/// Applies a per-second allocation to an entity.
pub trait EnforcementSink: Send + Sync {
    fn apply(
        &self,
        entity: &EntityDescriptor,
        cycles_per_second: u64,
        period: u64,
    ) -> Result<Enforced, ControllerError>;
}

impl<T: EnforcementSink + ?Sized> EnforcementSink for Arc<T> {
    fn apply(
        &self,
        entity: &EntityDescriptor,
        cycles_per_second: u64,
        period: u64,
    ) -> Result<Enforced, ControllerError> {
        (**self).apply(entity, cycles_per_second, period)
    }
}

/// Converts a per-second rate into a quota for `period` µs.
pub fn quota_for(cycles_per_second: u64, period: u64) -> u64 {
    let quota = u128::from(cycles_per_second) * u128::from(period) / u128::from(CYCLES_PER_CPU);
    u64::try_from(quota).unwrap_or(u64::MAX)
}

/// Writes the allocation to the entity's cgroup control files.
#[derive(Debug, Clone, Copy)]
pub struct CgroupEnforcer {
    layout: CgroupLayout,
    unlimit_threshold: f64,
}

impl CgroupEnforcer {
    pub fn new(layout: CgroupLayout, unlimit_threshold: f64) -> Self {
        Self {
            layout,
            unlimit_threshold,
        }
    }

    /// Quota to write, `None` meaning the cap should be lifted.
    fn target_quota(&self, entity: &EntityDescriptor, cycles: u64, period: u64) -> Option<u64> {
        let threshold = (entity.max_capacity as f64 * self.unlimit_threshold) as u64;
        if cycles >= threshold {
            return None;
        }
        Some(quota_for(cycles, period).max(MIN_QUOTA_US))
    }
}

impl EnforcementSink for CgroupEnforcer {
    fn apply(
        &self,
        entity: &EntityDescriptor,
        cycles_per_second: u64,
        period: u64,
    ) -> Result<Enforced, ControllerError> {
        let quota = self.target_quota(entity, cycles_per_second, period);
        let written = self
            .layout
            .write_bandwidth(&entity.control_path, quota, period)?;

        let outcome = match (written, quota) {
            (false, _) => Enforced::Skipped,
            (true, Some(quota)) => Enforced::Quota(quota),
            (true, None) => Enforced::Unlimited,
        };
        tracing::trace!(
            entity = %entity.id,
            cycles = cycles_per_second,
            period = period,
            outcome = ?outcome,
            "applied capping"
        );
        Ok(outcome)
    }
}

/// Sink used when enforcement is disabled: decisions are only logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunEnforcer;

impl EnforcementSink for DryRunEnforcer {
    fn apply(
        &self,
        entity: &EntityDescriptor,
        cycles_per_second: u64,
        period: u64,
    ) -> Result<Enforced, ControllerError> {
        tracing::debug!(
            entity = %entity.id,
            cycles = cycles_per_second,
            quota = quota_for(cycles_per_second, period),
            "enforcement disabled, capping not written"
        );
        Ok(Enforced::Skipped)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::cgroup::testing::*;

    fn entity(dir: &Path, vcpus: u64) -> EntityDescriptor {
        EntityDescriptor {
            id: "vm-a".to_string(),
            vm: "vm-a".to_string(),
            nominal_frequency_mhz: 1000,
            max_capacity: vcpus * CYCLES_PER_CPU,
            control_path: dir.to_path_buf(),
        }
    }

    #[test]
    fn quota_scales_with_period() {
        assert_eq!(quota_for(500_000, 10_000), 5_000);
        assert_eq!(quota_for(1_500_000, 100_000), 150_000);
        assert_eq!(quota_for(0, 100_000), 0);
    }

    #[test]
    fn writes_v2_quota_with_period() {
        let dir = tempfile::tempdir().unwrap();
        write_v2(dir.path(), 0, None, 10_000);
        let enforcer = CgroupEnforcer::new(CgroupLayout::V2, 0.85);

        let outcome = enforcer
            .apply(&entity(dir.path(), 2), 1_200_000, 10_000)
            .unwrap();

        assert_eq!(outcome, Enforced::Quota(12_000));
        assert_eq!(
            fs::read_to_string(dir.path().join("cpu.max")).unwrap(),
            "12000 10000"
        );
    }

    #[test]
    fn near_full_allocation_removes_the_cap() {
        let dir = tempfile::tempdir().unwrap();
        write_v1(dir.path(), 0, 5_000, 10_000);
        let enforcer = CgroupEnforcer::new(CgroupLayout::V1, 0.85);

        let outcome = enforcer
            .apply(&entity(dir.path(), 1), 850_000, 10_000)
            .unwrap();

        assert_eq!(outcome, Enforced::Unlimited);
        assert_eq!(
            fs::read_to_string(dir.path().join("cpu.cfs_quota_us")).unwrap(),
            "-1"
        );
    }

    #[test]
    fn tiny_allocation_is_raised_to_kernel_minimum() {
        let dir = tempfile::tempdir().unwrap();
        write_v1(dir.path(), 0, 5_000, 10_000);
        let enforcer = CgroupEnforcer::new(CgroupLayout::V1, 0.85);

        let outcome = enforcer.apply(&entity(dir.path(), 1), 10, 10_000).unwrap();
        assert_eq!(outcome, Enforced::Quota(MIN_QUOTA_US));
    }

    #[test]
    fn missing_control_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let enforcer = CgroupEnforcer::new(CgroupLayout::V2, 0.85);

        let outcome = enforcer
            .apply(&entity(&dir.path().join("gone"), 1), 100_000, 10_000)
            .unwrap();
        assert_eq!(outcome, Enforced::Skipped);
    }

    #[test]
    fn dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_v2(dir.path(), 0, Some(4_000), 10_000);

        let outcome = DryRunEnforcer
            .apply(&entity(dir.path(), 1), 100_000, 10_000)
            .unwrap();

        assert_eq!(outcome, Enforced::Skipped);
        assert_eq!(
            fs::read_to_string(dir.path().join("cpu.max")).unwrap(),
            "4000 10000\n"
        );
    }
}
