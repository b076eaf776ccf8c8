use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ringtail::{identity, reactor::Reactor, settings::Settings};
use ringtail_cli::{get_shell, ShellState};
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "ringtail-cli", about = "Interactive file reader for the ringtail framework")]
struct Args {
    /// Serving host, overriding the config file.
    #[arg(long)]
    host: Option<String>,

    /// Serving port, overriding the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Path to a config file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref()).context("failed to load config")?;
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    settings.validate().context("invalid configuration")?;

    let requester_id = identity::agent_id().unwrap_or_else(|e| {
        warn!(error = %e, "no machine id, using a fixed requester name");
        "ringtail-cli".into()
    });

    let reactor = Arc::new(Reactor::new(ringtail::reactor::DEFAULT_QUEUE_DEPTH)?);

    println!("ringtail interactive file reader");
    println!(
        "serving host: {}:{}",
        settings.server.host, settings.server.port
    );
    println!("commands: get <path>, help, quit");

    let state = ShellState::new(reactor, settings, requester_id);
    let mut shell = get_shell(state);
    if let Err(e) = shell.run_async().await {
        anyhow::bail!("shell exited with an error: {e}");
    }

    Ok(())
}
