use anyhow::Context as _;
use clap::Parser;
use std::sync::Arc;
use taskmaster::tm::logger::Logger;
use taskmaster::tm::shell::Shell;
use taskmaster::tm::supervisor::Supervisor;
use taskmaster::tm::{cli, config, web};
use tokio::signal::unix::{signal as unix_signal, SignalKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    // The log sink is the only fatal startup dependency.
    let logger = Arc::new(Logger::new(&args.log_file).with_context(|| {
        format!("failed to initialize logger at {}", args.log_file.display())
    })?);
    logger.info("starting taskmaster");

    let cfg = match config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            logger.error(format!("failed to load config: {e}"));
            return Err(e.into());
        }
    };
    logger.info(format!("configuration loaded from {}", args.config.display()));

    let supervisor = Supervisor::new(cfg, Arc::clone(&logger));

    if args.web_port > 0 {
        let web_supervisor = supervisor.clone();
        let web_logger = Arc::clone(&logger);
        tokio::spawn(async move {
            if let Err(e) = web::serve(args.web_port, web_supervisor, Arc::clone(&web_logger)).await
            {
                web_logger.error(format!("web server failed: {e}"));
            }
        });
    }

    if let Err(e) = supervisor.start_autostart().await {
        logger.error(format!("failed to start some processes: {e}"));
    }

    spawn_signal_listener(supervisor.clone(), Arc::clone(&logger), args.config.clone())?;

    logger.info("starting interactive shell");
    let shell = Shell::new(supervisor.clone(), Arc::clone(&logger), args.config.clone());
    shell.run().await;

    logger.info("taskmaster shutdown complete");
    Ok(())
}

/// SIGHUP reloads the startup configuration; SIGINT/SIGTERM stop every
/// program and exit.
fn spawn_signal_listener(
    supervisor: Supervisor,
    logger: Arc<Logger>,
    config_path: std::path::PathBuf,
) -> anyhow::Result<()> {
    let mut hangup = unix_signal(SignalKind::hangup()).context("install SIGHUP handler")?;
    let mut interrupt = unix_signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut terminate = unix_signal(SignalKind::terminate()).context("install SIGTERM handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    logger.info("received SIGHUP, reloading configuration...");
                    match supervisor.reload_config(&config_path).await {
                        Ok(()) => logger.info("configuration reloaded via SIGHUP"),
                        Err(e) => logger.error(format!("failed to reload config: {e}")),
                    }
                }
                _ = interrupt.recv() => {
                    shutdown(&supervisor, &logger).await;
                }
                _ = terminate.recv() => {
                    shutdown(&supervisor, &logger).await;
                }
            }
        }
    });
    Ok(())
}

async fn shutdown(supervisor: &Supervisor, logger: &Logger) {
    logger.info("received shutdown signal, stopping all processes...");
    supervisor.stop_all().await;
    logger.info("taskmaster shutdown complete");
    std::process::exit(0);
}
