use clap::{Parser, Subcommand};
use utils::version;

use crate::config::daemon::{DaemonArgs, ShowConfigArgs};

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the CPU market daemon
    Daemon(Box<DaemonArgs>),
    /// Load, validate and print the effective configuration
    #[command(name = "show-config")]
    ShowConfig(ShowConfigArgs),
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn daemon_defaults() {
        let cli = Cli::try_parse_from(["controller", "daemon"]).unwrap();
        let Commands::Daemon(args) = cli.command else {
            panic!("expected daemon subcommand");
        };

        assert_eq!(args.cgroup_root, PathBuf::from("/sys/fs/cgroup"));
        assert_eq!(args.api_listen_addr, "0.0.0.0:8080");
        assert_eq!(args.metrics_format, "influx");
        assert!(args.enforce);
        assert!(args.tick_ms.is_none());
    }

    #[test]
    fn daemon_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "controller",
            "daemon",
            "--config",
            "/etc/controller.yaml",
            "--enforce",
            "false",
            "--tick-ms",
            "250",
            "--metrics-format",
            "json",
        ])
        .unwrap();
        let Commands::Daemon(args) = cli.command else {
            panic!("expected daemon subcommand");
        };

        assert_eq!(args.config, Some(PathBuf::from("/etc/controller.yaml")));
        assert!(!args.enforce);
        assert_eq!(args.tick_ms, Some(250));
        assert_eq!(args.metrics_format, "json");
    }

    #[test]
    fn show_config_takes_a_path() {
        let cli = Cli::try_parse_from(["controller", "show-config", "--config", "vms.yaml"]).unwrap();
        let Commands::ShowConfig(args) = cli.command else {
            panic!("expected show-config subcommand");
        };
        assert_eq!(args.config, Some(PathBuf::from("vms.yaml")));
    }
}
