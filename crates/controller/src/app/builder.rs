use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use anyhow::Result;
use market::Market;
use market::CYCLES_PER_CPU;

use crate::app::Application;
use crate::app::ApplicationServices;
use crate::cgroup::telemetry::as_cpus;
use crate::cgroup::CgroupEnforcer;
use crate::cgroup::DryRunEnforcer;
use crate::cgroup::EnforcementSink;
use crate::config::ControllerConfig;
use crate::config::DaemonArgs;
use crate::metrics::host_name;
use crate::registry::CgroupRegistry;
use crate::scheduler::SchedulerSettings;

/// Reads the configuration file, or falls back to the defaults without one.
pub fn load_config(path: Option<&Path>) -> Result<ControllerConfig> {
    match path {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading configuration");
            ControllerConfig::load(path)
                .map_err(|e| anyhow::anyhow!("Failed to load configuration: {e:?}"))
        }
        None => {
            tracing::info!("no configuration file given, using defaults");
            Ok(ControllerConfig::default())
        }
    }
}

/// Cycles per second of the whole host: one million per online CPU.
pub fn host_capacity() -> Result<u64> {
    // SAFETY: sysconf only reads a system constant
    let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if online <= 0 {
        anyhow::bail!("cannot determine the number of online CPUs");
    }
    Ok(online as u64 * CYCLES_PER_CPU)
}

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    /// Create new application builder
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    /// Build complete application
    pub fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");

        let config = load_config(self.daemon_args.config.as_deref())?;
        let services = self.create_services(&config)?;

        Ok(Application::new(services, self.daemon_args))
    }

    fn create_services(&self, config: &ControllerConfig) -> Result<ApplicationServices> {
        let args = &self.daemon_args;

        let capacity = match config.monitor.capacity {
            Some(capacity) => capacity,
            None => host_capacity()?,
        };
        let market = Market::new(config.market_config(), capacity)
            .map_err(|e| anyhow::anyhow!("Failed to create market: {e:?}"))?;

        let registry = CgroupRegistry::new(&args.cgroup_root, config.monitor.granularity);
        for vm in &config.vms {
            registry
                .register(vm.clone())
                .map_err(|e| anyhow::anyhow!("Failed to register vm {}: {e:?}", vm.name))?;
        }
        let layout = registry.layout();

        let sink: Arc<dyn EnforcementSink> = if args.enforce {
            Arc::new(CgroupEnforcer::new(layout, config.monitor.unlimit_threshold))
        } else {
            tracing::warn!("enforcement disabled, cappings are computed but not written");
            Arc::new(DryRunEnforcer)
        };

        let frame = args.tick_override().unwrap_or_else(|| config.tick());
        tracing::info!(
            capacity = capacity,
            cpus = as_cpus(capacity),
            vms = config.vms.len(),
            frame_ms = frame.as_millis() as u64,
            granularity = ?config.monitor.granularity,
            "market configured"
        );

        Ok(ApplicationServices {
            registry: Arc::new(registry),
            market: Arc::new(Mutex::new(market)),
            status: Arc::new(RwLock::new(BTreeMap::new())),
            sink,
            scheduler_settings: SchedulerSettings {
                frame,
                slope_history: config.monitor.slope_history,
                default_period: config.monitor.default_period,
                layout,
                host: host_name(),
            },
        })
    }
}
