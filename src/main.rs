use anyhow::{bail, Context, Result};
use clap::Parser;
use mower_core::config::Config;
use mower_core::runtime::{Runtime, RuntimeOptions};
use mower_core::sim::SimWorld;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "mowerd")]
#[command(about = "Autonomous mower control daemon", long_about = None)]
struct Args {
    /// Base configuration file
    #[arg(long, default_value = "config/robot.yaml")]
    config: PathBuf,

    /// Optional environment override file, merged over the base
    #[arg(long)]
    config_override: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,

    /// Persisted grid / coverage-cursor state file
    #[arg(long)]
    state: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = Config::load(&args.config, args.config_override.as_deref())
        .with_context(|| format!("loading {}", args.config.display()))?;
    log::info!(
        "{} v{} configured",
        config.robot.name,
        config.robot.version
    );

    if args.check_config {
        println!("configuration ok");
        return Ok(());
    }

    let config = Arc::new(config);
    let ports = if config.simulation.enabled {
        log::info!("simulation mode: binding synthetic ports");
        SimWorld::new(&config).ports()
    } else {
        // Hardware drivers live outside this crate and are bound at
        // integration time.
        bail!("no hardware port backend compiled in; set simulation.enabled");
    };

    let runtime = Runtime::spawn(
        config,
        ports,
        RuntimeOptions {
            state_path: args.state,
        },
    )
    .context("spawning control runtime")?;
    let handle = runtime.handle.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupt: halting");
            handle.halt().await;
        }
    });

    runtime.join().await;
    log::info!("clean shutdown");
    Ok(())
}
