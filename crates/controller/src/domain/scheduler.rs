use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;

use market::Allocation;
use market::EntitySnapshot;
use market::Market;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::cgroup::telemetry::usage_percent;
use crate::cgroup::CgroupLayout;
use crate::cgroup::EnforcementSink;
use crate::cgroup::TelemetrySource;
use crate::metrics::current_time;
use crate::metrics::EntityMetricsParams;
use crate::metrics::MarketMetricsParams;
use crate::metrics::MetricsEncoder;
use crate::registry::EntityDescriptor;
use crate::registry::EntityProvider;
use crate::slope::SlopeEstimator;

pub type SharedMarket = Arc<Mutex<Market>>;
pub type SharedStatus = Arc<RwLock<BTreeMap<String, EntityStatus>>>;

/// Last observation and decision for one entity, as exposed by the API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityStatus {
    pub id: String,
    pub vm: String,
    pub max_capacity: u64,
    /// `None` until two counter readings are available
    pub consumption: Option<u64>,
    /// `-1` when uncapped
    pub capping: i64,
    pub period: u64,
    pub slope: f64,
    pub band: String,
    pub allocation: u64,
    pub balance: u64,
}

/// Outcome of a single frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub entities: usize,
    pub sold: u64,
    pub lost: u64,
    pub iterations: u64,
    pub enforced: usize,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub frame: Duration,
    pub slope_history: usize,
    /// Period used when the control files report none, in µs
    pub default_period: u64,
    pub layout: CgroupLayout,
    /// Tag attached to every metrics line
    pub host: String,
}

struct TrackedEntity {
    descriptor: EntityDescriptor,
    telemetry: TelemetrySource,
    slope: SlopeEstimator,
}

struct Observation {
    snapshot: EntitySnapshot,
    period: u64,
}

/// Fixed-cadence loop: telemetry, market update, enforcement, metrics.
pub struct TickScheduler<P: EntityProvider, S: EnforcementSink> {
    provider: Arc<P>,
    market: SharedMarket,
    sink: S,
    settings: SchedulerSettings,
    encoder: Box<dyn MetricsEncoder>,
    status: SharedStatus,
    tracked: BTreeMap<String, TrackedEntity>,
}

impl<P: EntityProvider, S: EnforcementSink> TickScheduler<P, S> {
    pub fn new(
        provider: Arc<P>,
        market: SharedMarket,
        sink: S,
        settings: SchedulerSettings,
        encoder: Box<dyn MetricsEncoder>,
        status: SharedStatus,
    ) -> Self {
        Self {
            provider,
            market,
            sink,
            settings,
            encoder,
            status,
            tracked: BTreeMap::new(),
        }
    }

    /// Runs one frame. Per-entity failures are logged and never abort it.
    pub fn tick(&mut self, now: Instant) -> TickSummary {
        let descriptors = self.provider.entities();
        self.reconcile(descriptors);

        let observations = self.observe(now);
        let snapshots: Vec<EntitySnapshot> =
            observations.iter().map(|o| o.snapshot.clone()).collect();

        let (allocation, mut summary, bands, balances) = {
            let mut market = self.market.lock().expect("poisoned");
            let allocation = market.update(&snapshots);
            let summary = TickSummary {
                entities: snapshots.len(),
                sold: market.sold(),
                lost: market.lost(),
                iterations: market.iterations(),
                enforced: 0,
            };
            let bands: Vec<String> = snapshots
                .iter()
                .map(|s| market.classify(s).to_string())
                .collect();
            let balances = market.ledger().accounts().clone();
            (allocation, summary, bands, balances)
        };

        summary.enforced = self.enforce(&observations, &allocation);
        self.publish(&observations, &allocation, &bands, &balances, &summary, now);
        summary
    }

    /// Tracks new entities and forgets the ones that disappeared.
    fn reconcile(&mut self, descriptors: Vec<EntityDescriptor>) {
        let mut next = BTreeMap::new();
        for descriptor in descriptors {
            let entry = match self.tracked.remove(&descriptor.id) {
                Some(mut tracked) if tracked.descriptor.control_path == descriptor.control_path => {
                    tracked.descriptor = descriptor;
                    tracked
                }
                _ => {
                    tracing::debug!(entity = %descriptor.id, "tracking entity");
                    TrackedEntity {
                        telemetry: TelemetrySource::new(
                            descriptor.id.clone(),
                            descriptor.control_path.clone(),
                            self.settings.layout,
                        ),
                        slope: SlopeEstimator::new(self.settings.slope_history),
                        descriptor,
                    }
                }
            };
            next.insert(entry.descriptor.id.clone(), entry);
        }

        for id in self.tracked.keys() {
            tracing::info!(entity = %id, "entity gone, no longer traded");
        }
        self.tracked = next;
    }

    fn observe(&mut self, now: Instant) -> Vec<Observation> {
        let default_period = self.settings.default_period;
        self.tracked
            .values_mut()
            .map(|tracked| {
                let descriptor = &tracked.descriptor;
                let sample = tracked.telemetry.refresh(now);

                if let Some(consumption) = sample.consumption {
                    tracked
                        .slope
                        .add_sample(usage_percent(consumption, descriptor.max_capacity));
                }

                let mut snapshot = EntitySnapshot::new(
                    descriptor.id.clone(),
                    descriptor.nominal_frequency_mhz,
                    descriptor.max_capacity,
                )
                .with_capping(sample.capping)
                .with_slope(tracked.slope.slope());
                if let Some(consumption) = sample.consumption {
                    snapshot = snapshot.with_consumption(consumption);
                }

                Observation {
                    snapshot,
                    period: if sample.period > 0 {
                        sample.period
                    } else {
                        default_period
                    },
                }
            })
            .collect()
    }

    /// Applies the allocation and returns how many entities got a new capping.
    fn enforce(&self, observations: &[Observation], allocation: &Allocation) -> usize {
        let mut enforced = 0;
        for observation in observations {
            let id = &observation.snapshot.id;
            let (Some(cycles), Some(tracked)) = (allocation.get(id), self.tracked.get(id)) else {
                continue;
            };
            match self
                .sink
                .apply(&tracked.descriptor, *cycles, observation.period)
            {
                Ok(crate::cgroup::Enforced::Skipped) => {}
                Ok(_) => enforced += 1,
                Err(e) => tracing::warn!(entity = %id, "failed to apply capping: {e:?}"),
            }
        }
        enforced
    }

    fn publish(
        &self,
        observations: &[Observation],
        allocation: &Allocation,
        bands: &[String],
        balances: &BTreeMap<String, u64>,
        summary: &TickSummary,
        started: Instant,
    ) {
        let timestamp = current_time();
        let host = self.settings.host.as_str();
        let mut status = BTreeMap::new();

        for (observation, band) in observations.iter().zip(bands) {
            let snapshot = &observation.snapshot;
            let vm = self
                .tracked
                .get(&snapshot.id)
                .map(|t| t.descriptor.vm.clone())
                .unwrap_or_default();
            let entry = EntityStatus {
                id: snapshot.id.clone(),
                vm,
                max_capacity: snapshot.max_capacity,
                consumption: snapshot.observed.then_some(snapshot.consumption),
                capping: snapshot.capping.as_raw(),
                period: observation.period,
                slope: snapshot.slope,
                band: band.clone(),
                allocation: allocation.get(&snapshot.id).copied().unwrap_or_default(),
                balance: balances.get(&snapshot.id).copied().unwrap_or_default(),
            };

            let line = self.encoder.encode_entity_metrics(&EntityMetricsParams {
                host,
                entity: &entry.id,
                vm: &entry.vm,
                consumption: snapshot.consumption,
                capping: entry.capping,
                allocation: entry.allocation,
                usage_percentage: usage_percent(snapshot.consumption, snapshot.max_capacity),
                slope: entry.slope,
                balance: entry.balance,
                timestamp,
            });
            tracing::info!(target: "metrics.entity", msg = %line);

            status.insert(entry.id.clone(), entry);
        }

        let capacity = self.market.lock().expect("poisoned").capacity();
        let line = self.encoder.encode_market_metrics(&MarketMetricsParams {
            host,
            capacity,
            sold: summary.sold,
            lost: summary.lost,
            iterations: summary.iterations,
            entities: summary.entities,
            tick_micros: started.elapsed().as_micros() as u64,
            timestamp,
        });
        tracing::info!(target: "metrics.market", msg = %line);

        *self.status.write().expect("poisoned") = status;
    }

    /// Runs frames until `token` is cancelled.
    ///
    /// Each frame runs on the blocking pool, since it walks and writes the
    /// cgroup filesystem. The loop then sleeps until `frame_start + frame`; a
    /// frame that overran is followed immediately by the next one, timed from
    /// its own start.
    pub async fn run(self, token: CancellationToken)
    where
        P: 'static,
        S: 'static,
    {
        let frame = self.settings.frame;
        tracing::info!(frame_ms = frame.as_millis() as u64, "tick scheduler started");

        let mut scheduler = self;
        while !token.is_cancelled() {
            let frame_start = Instant::now();
            let joined = tokio::task::spawn_blocking(move || {
                let summary = scheduler.tick(frame_start);
                (scheduler, summary)
            })
            .await;
            let summary = match joined {
                Ok((returned, summary)) => {
                    scheduler = returned;
                    summary
                }
                Err(e) => {
                    tracing::error!("tick task failed: {e}");
                    return;
                }
            };
            tracing::debug!(
                entities = summary.entities,
                sold = summary.sold,
                lost = summary.lost,
                iterations = summary.iterations,
                enforced = summary.enforced,
                "tick completed"
            );

            let deadline = frame_start + frame;
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    overrun_us = (now - deadline).as_micros() as u64,
                    "tick overran its frame"
                );
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep_until(deadline.into()) => {}
            }
        }

        tracing::info!("tick scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::path::PathBuf;

    use market::Capping;
    use market::MarketConfig;
    use market::NominalPolicy;
    use market::CYCLES_PER_CPU;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::cgroup::testing::write_v2;
    use crate::cgroup::CgroupEnforcer;
    use crate::cgroup::DryRunEnforcer;
    use crate::cgroup::Enforced;
    use crate::metrics::create_encoder;
    use crate::ControllerError;

    /// Provider returning a fixed, editable entity list.
    #[derive(Default)]
    struct StaticProvider {
        entities: RwLock<Vec<EntityDescriptor>>,
    }

    impl EntityProvider for StaticProvider {
        fn entities(&self) -> Vec<EntityDescriptor> {
            self.entities.read().unwrap().clone()
        }
    }

    /// Sink recording every call.
    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<(String, u64, u64)>>,
    }

    impl EnforcementSink for RecordingSink {
        fn apply(
            &self,
            entity: &EntityDescriptor,
            cycles_per_second: u64,
            period: u64,
        ) -> crate::Result<Enforced, ControllerError> {
            self.calls
                .lock()
                .unwrap()
                .push((entity.id.clone(), cycles_per_second, period));
            Ok(Enforced::Quota(0))
        }
    }

    fn descriptor(id: &str, dir: &Path) -> EntityDescriptor {
        EntityDescriptor {
            id: id.to_string(),
            vm: id.to_string(),
            nominal_frequency_mhz: 0,
            max_capacity: CYCLES_PER_CPU,
            control_path: dir.to_path_buf(),
        }
    }

    fn settings(frame: Duration) -> SchedulerSettings {
        SchedulerSettings {
            frame,
            slope_history: 3,
            default_period: 10_000,
            layout: CgroupLayout::V2,
            host: "test".to_string(),
        }
    }

    fn half_market(capacity: u64) -> SharedMarket {
        let cfg = MarketConfig {
            nominal: NominalPolicy::BaseCycle { fraction: 0.5 },
            ..MarketConfig::default()
        };
        Arc::new(Mutex::new(Market::new(cfg, capacity).unwrap()))
    }

    fn scheduler<S: EnforcementSink>(
        entities: Vec<EntityDescriptor>,
        sink: S,
    ) -> (TickScheduler<StaticProvider, S>, Arc<StaticProvider>, SharedStatus) {
        let provider = Arc::new(StaticProvider {
            entities: RwLock::new(entities),
        });
        let status = SharedStatus::default();
        let scheduler = TickScheduler::new(
            provider.clone(),
            half_market(2 * CYCLES_PER_CPU),
            sink,
            settings(Duration::from_millis(10)),
            create_encoder("json"),
            status.clone(),
        );
        (scheduler, provider, status)
    }

    #[test]
    fn missing_files_fall_back_to_nominal() {
        let root = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let (mut scheduler, _, status) =
            scheduler(vec![descriptor("vm-a", &root.path().join("absent"))], sink.clone());

        let summary = scheduler.tick(Instant::now());

        assert_eq!(summary.entities, 1);
        assert_eq!(
            *sink.calls.lock().unwrap(),
            vec![("vm-a".to_string(), 500_000, 10_000)]
        );
        let status = status.read().unwrap();
        assert_eq!(status["vm-a"].consumption, None);
        assert_eq!(status["vm-a"].capping, -1);
        assert_eq!(status["vm-a"].band, "stable");
    }

    #[test]
    fn consumption_feeds_the_market_and_the_cgroup() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("vm-a");
        write_v2(&dir, 0, Some(5_000), 10_000);

        let enforcer = CgroupEnforcer::new(CgroupLayout::V2, 0.85);
        let (mut scheduler, _, status) = scheduler(vec![descriptor("vm-a", &dir)], enforcer);

        let start = Instant::now();
        scheduler.tick(start);

        // 200ms of CPU in one second, flat history after warm-up
        for (i, usage) in [200_000u64, 400_000, 600_000, 800_000].iter().enumerate() {
            write_v2(&dir, *usage, Some(5_000), 10_000);
            scheduler.tick(start + Duration::from_secs(i as u64 + 1));
        }

        let status = status.read().unwrap();
        let entry = &status["vm-a"];
        assert_eq!(entry.consumption, Some(200_000));
        assert_eq!(entry.band, "flat");
        // usage + 1% of max
        assert_eq!(entry.allocation, 210_000);
        // two falling ticks while warming up, then two flat ones
        assert_eq!(entry.balance, 2 * 50_000 + 2 * 290_000);
        assert_eq!(
            fs::read_to_string(dir.join("cpu.max")).unwrap(),
            "2100 10000"
        );
    }

    #[test]
    fn vanished_entities_are_dropped() {
        let root = tempfile::tempdir().unwrap();
        let (mut scheduler, provider, status) = scheduler(
            vec![
                descriptor("vm-a", &root.path().join("a")),
                descriptor("vm-b", &root.path().join("b")),
            ],
            DryRunEnforcer,
        );

        scheduler.tick(Instant::now());
        assert_eq!(status.read().unwrap().len(), 2);

        provider.entities.write().unwrap().truncate(1);
        let summary = scheduler.tick(Instant::now());

        assert_eq!(summary.entities, 1);
        assert_eq!(summary.enforced, 0);
        let ids: Vec<String> = status.read().unwrap().keys().cloned().collect();
        assert_eq!(ids, vec!["vm-a".to_string()]);
    }

    #[test]
    fn uncapped_period_defaults() {
        let root = tempfile::tempdir().unwrap();
        let dir: PathBuf = root.path().join("vm-a");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("cpu.stat"), "usage_usec 0\n").unwrap();

        let sink = Arc::new(RecordingSink::default());
        let (mut scheduler, _, status) = scheduler(vec![descriptor("vm-a", &dir)], sink.clone());
        scheduler.tick(Instant::now());

        assert_eq!(sink.calls.lock().unwrap()[0].2, 10_000);
        assert_eq!(status.read().unwrap()["vm-a"].capping, Capping::Uncapped.as_raw());
    }

    #[test(tokio::test)]
    async fn run_stops_on_cancellation() {
        let root = tempfile::tempdir().unwrap();
        let (scheduler, _, status) =
            scheduler(vec![descriptor("vm-a", &root.path().join("a"))], DryRunEnforcer);
        let token = CancellationToken::new();

        let handle = tokio::spawn(scheduler.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler should stop")
            .unwrap();
        assert!(status.read().unwrap().contains_key("vm-a"));
    }
}
