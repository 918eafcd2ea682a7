use std::path::Path;
use std::path::PathBuf;
use std::time::Instant;

use market::Capping;
use market::CYCLES_PER_CPU;

use super::CgroupLayout;

/// One telemetry reading, normalized to a one second basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Cycles per second used since the previous reading; `None` while no
    /// counter delta is available.
    pub consumption: Option<u64>,
    pub capping: Capping,
    /// Enforcement period in µs, 0 when unknown
    pub period: u64,
}

impl Sample {
    fn missing() -> Self {
        Self {
            consumption: None,
            capping: Capping::Uncapped,
            period: 0,
        }
    }
}

/// Delta-based consumption reader for one control directory.
#[derive(Debug)]
pub struct TelemetrySource {
    id: String,
    dir: PathBuf,
    layout: CgroupLayout,
    previous: Option<(u64, Instant)>,
    missing_reported: bool,
}

impl TelemetrySource {
    pub fn new(id: impl Into<String>, dir: impl Into<PathBuf>, layout: CgroupLayout) -> Self {
        Self {
            id: id.into(),
            dir: dir.into(),
            layout,
            previous: None,
            missing_reported: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reads the counters and returns the consumption since the last call.
    ///
    /// Never fails: unreadable files degrade to an unobserved, uncapped sample.
    pub fn refresh(&mut self, now: Instant) -> Sample {
        let usage = match self.layout.read_usage(&self.dir) {
            Ok(usage) => usage,
            Err(e) => {
                tracing::warn!(entity = %self.id, "failed to read usage counter: {e:?}");
                None
            }
        };

        let Some(usage) = usage else {
            if !self.missing_reported {
                tracing::info!(
                    entity = %self.id,
                    dir = %self.dir.display(),
                    "usage counter not available, entity left uncapped"
                );
                self.missing_reported = true;
            }
            self.previous = None;
            return Sample::missing();
        };
        self.missing_reported = false;

        let consumption = match self.previous.replace((usage, now)) {
            Some((previous_usage, previous_at)) => {
                let elapsed = now.saturating_duration_since(previous_at).as_secs_f64();
                // A counter going backwards means the group was recreated
                (elapsed > 0.0 && usage >= previous_usage)
                    .then(|| ((usage - previous_usage) as f64 / elapsed) as u64)
            }
            None => None,
        };

        let (capping, period) = match self.layout.read_bandwidth(&self.dir) {
            Ok(Some(bandwidth)) => (
                Capping::from_quota(bandwidth.quota, bandwidth.period),
                bandwidth.period,
            ),
            Ok(None) => (Capping::Uncapped, 0),
            Err(e) => {
                tracing::warn!(entity = %self.id, "failed to read bandwidth: {e:?}");
                (Capping::Uncapped, 0)
            }
        };

        if let (Some(used), Capping::Limited(limit)) = (consumption, capping) {
            if used > limit {
                tracing::warn!(
                    entity = %self.id,
                    consumption = used,
                    capping = limit,
                    "consumption above capping"
                );
            }
        }

        Sample {
            consumption,
            capping,
            period,
        }
    }
}

/// Percentage of `max` used by `consumption`.
pub fn usage_percent(consumption: u64, max: u64) -> f64 {
    if max == 0 {
        return 0.0;
    }
    consumption as f64 * 100.0 / max as f64
}

/// Number of CPUs `cycles` per second amount to.
pub fn as_cpus(cycles: u64) -> f64 {
    cycles as f64 / CYCLES_PER_CPU as f64
}
