use anyhow::{Context, Result};
use clap::Parser;
use ringtail::settings::Settings;
use ringtail_server::RingtailServer;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ringtail-server", about = "Controller for the ringtail tasking framework")]
struct Args {
    /// Bind address, overriding the config file.
    #[arg(long)]
    host: Option<String>,

    /// Bind port, overriding the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Path to a config file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref()).context("failed to load config")?;
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    settings.validate().context("invalid configuration")?;

    let server = RingtailServer::with_settings(&settings).await?;
    let shutdown = server.shutdown_handle();
    let running = tokio::spawn(async move { server.run().await });

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    info!("shutdown signal received");
    shutdown.cancel();
    running.await??;

    Ok(())
}
