use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use market::MarketConfig;
use market::NominalPolicy;
use serde::Deserialize;
use serde::Serialize;

use crate::ControllerError;
use crate::Result;

/// Whether the market trades whole VMs or individual vCPUs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[default]
    Vm,
    Vcpu,
}

/// Controller configuration file, loaded once at startup.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ControllerConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub market: MarketSection,
    #[serde(default)]
    pub vms: Vec<VmSpec>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Seconds per frame
    pub tick: f64,
    /// Number of samples in the slope window
    pub slope_history: usize,
    /// Host frequency in MHz
    pub cpu_max_freq: u64,
    pub granularity: Granularity,
    /// Period in µs assumed when a control file reports none
    pub default_period: u64,
    /// Fraction of the maximum above which the capping is removed
    pub unlimit_threshold: f64,
    /// Host cycles per second, detected from the online CPUs when absent
    pub capacity: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick: 1.0,
            slope_history: 5,
            cpu_max_freq: 1000,
            granularity: Granularity::Vm,
            default_period: 10_000,
            unlimit_threshold: 0.85,
            capacity: None,
        }
    }
}

/// Market parameters as written in the file; percentages, not fractions.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct MarketSection {
    pub trigger_increment: f64,
    pub trigger_decrement: f64,
    pub increasing_speed: f64,
    pub decreasing_speed: f64,
    pub window_size: u64,
    /// Guaranteed fraction of the maximum; replaces the frequency ratio when set
    pub base_cycle: Option<f64>,
}

impl Default for MarketSection {
    fn default() -> Self {
        Self {
            trigger_increment: 95.0,
            trigger_decrement: 50.0,
            increasing_speed: 10.0,
            decreasing_speed: 10.0,
            window_size: 10_000,
            base_cycle: None,
        }
    }
}

/// A virtual machine the controller should manage.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct VmSpec {
    pub name: String,
    /// Guaranteed frequency in MHz
    pub frequency: u64,
    /// Counted from the cgroup vcpu directories when absent
    #[serde(default)]
    pub vcpus: Option<u64>,
}

impl VmSpec {
    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.name.trim().is_empty() {
            return Err(invalid("vm name must not be empty"));
        }
        if self.name.contains('/') {
            return Err(invalid(format!("vm name '{}' must not contain '/'", self.name)));
        }
        if self.frequency == 0 {
            return Err(invalid(format!("vm '{}' needs a positive frequency", self.name)));
        }
        if self.vcpus == Some(0) {
            return Err(invalid(format!("vm '{}' needs at least one vcpu", self.name)));
        }
        Ok(())
    }
}

impl ControllerConfig {
    /// Reads, parses and validates a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self, ControllerError> {
        let content = std::fs::read_to_string(path)
            .change_context(ControllerError::io(path))
            .attach_printable("failed to read configuration file")?;
        Self::from_yaml(&content).attach_printable_lazy(|| format!("in {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self, ControllerError> {
        let cfg: Self = serde_yaml::from_str(content)
            .change_context(ControllerError::config("malformed YAML"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ControllerError> {
        let monitor = &self.monitor;
        if !(monitor.tick.is_finite() && monitor.tick > 0.0) {
            return Err(invalid("monitor.tick must be a positive number of seconds"));
        }
        if monitor.slope_history < 2 {
            return Err(invalid("monitor.slope-history needs at least two samples"));
        }
        if monitor.default_period == 0 {
            return Err(invalid("monitor.default-period must be positive"));
        }
        if !(monitor.unlimit_threshold > 0.0 && monitor.unlimit_threshold <= 1.0) {
            return Err(invalid("monitor.unlimit-threshold must be in (0, 1]"));
        }
        if monitor.capacity == Some(0) {
            return Err(invalid("monitor.capacity must be positive"));
        }

        self.market_config()
            .validate()
            .change_context(ControllerError::config("market section rejected"))?;

        let mut names = BTreeSet::new();
        for vm in &self.vms {
            vm.validate()?;
            if !names.insert(vm.name.as_str()) {
                return Err(invalid(format!("vm '{}' is declared twice", vm.name)));
            }
        }

        Ok(())
    }

    /// Market parameters with percentages converted to fractions.
    pub fn market_config(&self) -> MarketConfig {
        let market = &self.market;
        let nominal = match market.base_cycle {
            Some(fraction) => NominalPolicy::BaseCycle { fraction },
            None => NominalPolicy::FrequencyRatio {
                host_frequency_mhz: self.monitor.cpu_max_freq,
            },
        };

        MarketConfig {
            nominal,
            trigger_increment: market.trigger_increment / 100.0,
            trigger_decrement: market.trigger_decrement / 100.0,
            increasing_speed: market.increasing_speed / 100.0,
            decreasing_speed: market.decreasing_speed / 100.0,
            window_size: market.window_size,
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs_f64(self.monitor.tick)
    }
}

fn invalid(reason: impl Into<String>) -> Report<ControllerError> {
    Report::new(ControllerError::config(reason))
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    const FULL: &str = r#"
monitor:
  tick: 0.5
  slope-history: 4
  cpu-max-freq: 3000
  granularity: vcpu
  default-period: 100000
  unlimit-threshold: 0.9
  capacity: 8000000
market:
  trigger-increment: 85.0
  trigger-decrement: 40.0
  increasing-speed: 20.0
  decreasing-speed: 5.0
  window-size: 5000
vms:
  - name: vm-a
    frequency: 1500
    vcpus: 2
  - name: vm-b
    frequency: 3000
"#;

    #[test]
    fn parses_full_file() {
        let cfg = ControllerConfig::from_yaml(FULL).unwrap();

        assert_eq!(cfg.monitor.granularity, Granularity::Vcpu);
        assert_eq!(cfg.monitor.capacity, Some(8_000_000));
        assert_eq!(cfg.tick(), Duration::from_millis(500));
        assert_eq!(
            cfg.vms,
            vec![
                VmSpec {
                    name: "vm-a".to_string(),
                    frequency: 1500,
                    vcpus: Some(2),
                },
                VmSpec {
                    name: "vm-b".to_string(),
                    frequency: 3000,
                    vcpus: None,
                },
            ]
        );
    }

    #[test]
    fn percentages_become_fractions() {
        let cfg = ControllerConfig::from_yaml(FULL).unwrap();
        let market = cfg.market_config();

        assert_eq!(
            market.nominal,
            NominalPolicy::FrequencyRatio {
                host_frequency_mhz: 3000
            }
        );
        assert!((market.trigger_increment - 0.85).abs() < 1e-9);
        assert!((market.trigger_decrement - 0.40).abs() < 1e-9);
        assert!((market.increasing_speed - 0.20).abs() < 1e-9);
        assert!((market.decreasing_speed - 0.05).abs() < 1e-9);
        assert_eq!(market.window_size, 5000);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = ControllerConfig::from_yaml("{}").unwrap();
        assert_eq!(cfg, ControllerConfig::default());

        let market = cfg.market_config();
        assert!((market.trigger_increment - 0.95).abs() < 1e-9);
        assert!((market.trigger_decrement - 0.5).abs() < 1e-9);
        assert_eq!(market.window_size, 10_000);
    }

    #[test]
    fn base_cycle_replaces_frequency_ratio() {
        let cfg = ControllerConfig::from_yaml("market:\n  base-cycle: 0.5\n").unwrap();
        assert_eq!(
            cfg.market_config().nominal,
            NominalPolicy::BaseCycle { fraction: 0.5 }
        );
    }

    #[test]
    fn rejects_invalid_market_section() {
        let err = ControllerConfig::from_yaml(
            "market:\n  trigger-increment: 30.0\n  trigger-decrement: 60.0\n",
        )
        .unwrap_err();
        assert!(matches!(
            err.current_context(),
            ControllerError::Config { .. }
        ));
    }

    #[test]
    fn rejects_duplicate_vms() {
        let yaml = "vms:\n  - name: a\n    frequency: 1000\n  - name: a\n    frequency: 2000\n";
        let err = ControllerConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(ControllerConfig::from_yaml("monitor:\n  tik: 1.0\n").is_err());
    }

    #[test]
    fn rejects_non_positive_tick() {
        assert!(ControllerConfig::from_yaml("monitor:\n  tick: 0\n").is_err());
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, FULL).unwrap();

        let cfg = ControllerConfig::load(&path).unwrap();
        assert_eq!(cfg.vms.len(), 2);

        let missing = ControllerConfig::load(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(
            missing.current_context(),
            ControllerError::Io { .. }
        ));
    }
}
