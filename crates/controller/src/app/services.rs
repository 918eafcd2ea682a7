use std::sync::Arc;

use crate::cgroup::EnforcementSink;
use crate::registry::SharedRegistry;
use crate::scheduler::SchedulerSettings;
use crate::scheduler::SharedMarket;
use crate::scheduler::SharedStatus;

/// Application dependencies - simple struct with Arc-wrapped services
pub struct ApplicationServices {
    pub registry: SharedRegistry,
    pub market: SharedMarket,
    pub status: SharedStatus,
    pub sink: Arc<dyn EnforcementSink>,
    pub scheduler_settings: SchedulerSettings,
}
