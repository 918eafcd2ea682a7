use anyhow::Result;
use clap::Parser;
use controller::app::builder::load_config;
use controller::app::ApplicationBuilder;
use controller::config::Cli;
use controller::config::Commands;
use controller::config::DaemonArgs;
use controller::config::ShowConfigArgs;
use controller::logging;
use serde::Serialize;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::ShowConfig(args) => show_config(args),
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(daemon_args.metrics_file.as_ref())?;

    tracing::info!("Starting CPU market controller {}", &**version::VERSION);

    let app = ApplicationBuilder::new(daemon_args).build()?;

    app.run().await?;
    app.shutdown().await?;

    Ok(())
}

#[derive(Serialize)]
struct EffectiveConfig {
    config: controller::config::ControllerConfig,
    market: market::MarketConfig,
}

fn show_config(args: ShowConfigArgs) -> Result<()> {
    utils::logging::init();

    let config = load_config(args.config.as_deref())?;
    let effective = EffectiveConfig {
        market: config.market_config(),
        config,
    };
    println!("{}", serde_json::to_string_pretty(&effective)?);
    Ok(())
}
