use std::fs::File;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use daemonize::Daemonize;
use log::{LevelFilter, error, info};
use syslog::{BasicLogger, Facility, Formatter3164};

use fancontrold::{application::Application, cli::Cli, config::ConfigManager};

fn init_log(level: LevelFilter) -> Result<()> {
    syslog::unix(Formatter3164 {
        facility: Facility::LOG_DAEMON,
        hostname: None,
        process: "fancontrold".into(),
        pid: std::process::id(),
    })
    .map_err(|e| anyhow!("{e}"))
    .and_then(|logger| {
        log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
            .map(|_| log::set_max_level(level))
            .map_err(|e| anyhow!("{e}"))
    })
}

fn into_daemon() -> Result<()> {
    File::create("/var/tmp/fancontrold.log")
        .and_then(|out| Ok((out.try_clone()?, out)))
        .map_err(|e| anyhow!("{e}"))
        .and_then(|(stderr, stdout)| {
            Daemonize::new()
                .stdout(stdout)
                .stderr(stderr)
                .start()
                .map_err(|e| anyhow!("{e}"))
        })
}

async fn check(cli: Cli) -> Result<()> {
    let manager = ConfigManager::load(cli.config).await?;
    println!("{}: OK", manager.path().display());
    print!("{}", manager.config());
    Ok(())
}

async fn serve(cli: Cli) -> Result<()> {
    #[cfg(feature = "tokio-console")]
    console_subscriber::init();

    let config_manager = ConfigManager::load(cli.config).await?;
    let mut app = Application::builder()
        .with_config_manager(config_manager)
        .build()
        .await?;

    info!("fancontrold {} started", env!("CARGO_PKG_VERSION"));
    app.run().await
}

fn main() -> Result<()> {
    if !cfg!(target_os = "linux") {
        bail!("fancontrold drives hwmon sysfs and only runs on Linux");
    }

    let cli = Cli::parse();
    let runtime = || {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("Failed to start the async runtime")
    };

    if cli.check {
        return runtime()?.block_on(check(cli));
    }

    init_log(cli.log_level())?;
    if cli.daemonize {
        into_daemon()?;
    }

    // The runtime is created after forking so its threads live in the daemon.
    let result = runtime()?.block_on(serve(cli));
    if let Err(e) = &result {
        error!("{e:#}");
    }
    result
}
