//! Periodic controller polling: fetch commands, report results.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use ringtail::{
    conn::Connection,
    messages::{Command, Request},
    reactor::Reactor,
    settings::Settings,
    wire::Framer,
};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::Executor;

/// Fixed-cadence loop bridging the executor to the remote controller. Each
/// logical request rides its own connection.
pub struct Puller {
    settings: Settings,
    agent_id: String,
    reactor: Arc<Reactor>,
    executor: Arc<Executor>,
    shutdown: CancellationToken,
}

impl Puller {
    pub fn new(
        settings: Settings,
        agent_id: String,
        reactor: Arc<Reactor>,
        executor: Arc<Executor>,
        shutdown: CancellationToken,
    ) -> Self {
        Puller {
            settings,
            agent_id,
            reactor,
            executor,
            shutdown,
        }
    }

    /// Runs until the shutdown token fires. Cycles never overlap: the next
    /// tick is not polled until the current cycle's arm has finished, so a
    /// result can never be reported twice. A failed cycle is logged and the
    /// loop simply waits for the next tick.
    pub async fn run(&self) {
        let period = Duration::from_secs(self.settings.agent.poll_interval_secs.max(1));
        let mut ticks = interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period = ?period, "puller running");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticks.tick() => {
                    if let Err(e) = self.fetch_commands().await {
                        warn!(error = %e, "command fetch cycle failed");
                    }
                    if let Err(e) = self.report_results().await {
                        warn!(error = %e, "result report cycle failed");
                    }
                }
            }
        }
        info!("puller stopped");
    }

    async fn connect(&self) -> ringtail::Result<Framer<Connection>> {
        let conn = Connection::open(
            Arc::clone(&self.reactor),
            &self.settings.server.host,
            self.settings.server.port,
        )
        .await?;
        Ok(Framer::new(conn))
    }

    async fn fetch_commands(&self) -> Result<()> {
        let mut framer = self.connect().await?;
        framer
            .send(&Request::ListCommands {
                agent_id: self.agent_id.clone(),
            })
            .await?;
        let commands: Vec<Command> = framer.receive().await?;
        debug!(count = commands.len(), "command batch received");

        for command in commands {
            self.executor.submit(command).await?;
        }
        framer.into_inner().close().await?;
        Ok(())
    }

    async fn report_results(&self) -> Result<()> {
        let results = self.executor.drain_results();
        if results.is_empty() {
            return Ok(());
        }
        info!(count = results.len(), "reporting results");

        let mut framer = self.connect().await?;
        framer
            .send(&Request::ReportResults {
                agent_id: self.agent_id.clone(),
                results,
            })
            .await?;
        framer.into_inner().close().await?;
        Ok(())
    }
}
