use std::sync::Arc;

use anyhow::Result;
use ringtail::{identity, reactor::Reactor, settings::Settings};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{executor::Executor, puller::Puller};

pub mod commands;
pub mod executor;
pub mod puller;

/// The assembled agent: one reactor, one executor pool, one polling loop.
pub struct RingtailAgent {
    executor: Arc<Executor>,
    puller: Puller,
    shutdown: CancellationToken,
}

impl RingtailAgent {
    pub fn with_settings(settings: Settings) -> Result<Self> {
        let agent_id = match settings.agent.id.clone() {
            Some(id) => id,
            None => identity::agent_id()?,
        };
        let reactor = Arc::new(Reactor::new(ringtail::reactor::DEFAULT_QUEUE_DEPTH)?);
        let shutdown = CancellationToken::new();
        let executor = Arc::new(Executor::new(
            Arc::clone(&reactor),
            settings.agent.workers,
            shutdown.clone(),
        ));
        let puller = Puller::new(
            settings,
            agent_id,
            reactor,
            Arc::clone(&executor),
            shutdown.clone(),
        );

        Ok(RingtailAgent {
            executor,
            puller,
            shutdown,
        })
    }

    /// Cancelling this token stops the polling loop after its in-flight
    /// cycle and shuts the executor down.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs until shutdown. Queued commands finish before this returns;
    /// results they produced with no report cycle left to carry them are
    /// counted and dropped.
    pub async fn run(&self) -> Result<()> {
        info!("ringtail agent running");
        self.puller.run().await;
        self.executor.close().await;

        let unreported = self.executor.drain_results();
        if !unreported.is_empty() {
            warn!(
                count = unreported.len(),
                "discarding unreported results at shutdown"
            );
        }
        Ok(())
    }
}
