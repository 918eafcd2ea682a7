use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "CPU_MARKET_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path of the YAML configuration, e.g. /etc/cpu-market/config.yaml"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        env = "CPU_MARKET_CGROUP_ROOT",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/sys/fs/cgroup",
        help = "Mount point of the cgroup hierarchy"
    )]
    pub cgroup_root: PathBuf,

    #[arg(
        long,
        env = "API_LISTEN_ADDR",
        default_value = "0.0.0.0:8080",
        help = "HTTP API server listen address"
    )]
    pub api_listen_addr: String,

    #[arg(
        long,
        env = "CPU_MARKET_METRICS_FILE",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/logs/metrics.log",
        help = "Path for printing market and entity metrics, e.g. /logs/metrics.log"
    )]
    pub metrics_file: Option<PathBuf>,

    #[arg(
        long,
        env = "CPU_MARKET_METRICS_FORMAT",
        default_value = "influx",
        help = "Metrics format, either 'influx' or 'json'"
    )]
    pub metrics_format: String,

    #[arg(
        long,
        help = "Write the computed cappings to the cgroup files; when false the market only reports",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enforce: bool,

    #[arg(
        long,
        env = "CPU_MARKET_TICK_MS",
        help = "Frame duration in milliseconds, overrides the configuration file"
    )]
    pub tick_ms: Option<u64>,
}

impl DaemonArgs {
    /// Frame duration forced on the command line, if any.
    pub fn tick_override(&self) -> Option<Duration> {
        self.tick_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[derive(Parser, Clone, Debug)]
pub struct ShowConfigArgs {
    #[arg(
        long,
        env = "CPU_MARKET_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path of the YAML configuration to check"
    )]
    pub config: Option<PathBuf>,
}
