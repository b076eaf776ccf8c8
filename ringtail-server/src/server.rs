//! Controller implementation: accept loop, request dispatch, result intake.

use std::{
    collections::HashMap,
    net::SocketAddr,
    os::fd::IntoRawFd,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use ringtail::{
    conn::Connection,
    files,
    messages::{Command, CommandResult, Request},
    reactor::Reactor,
    settings::Settings,
    wire::Framer,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Results delivered by agents, kept in memory keyed by agent id.
#[derive(Clone, Default)]
pub struct ResultStore {
    inner: Arc<Mutex<HashMap<String, Vec<CommandResult>>>>,
}

impl ResultStore {
    pub fn record(&self, agent_id: &str, results: Vec<CommandResult>) {
        let mut inner = self.inner.lock().expect("result store poisoned");
        inner.entry(agent_id.to_string()).or_default().extend(results);
    }

    /// Removes and returns everything recorded for `agent_id`.
    pub fn take(&self, agent_id: &str) -> Vec<CommandResult> {
        let mut inner = self.inner.lock().expect("result store poisoned");
        inner.remove(agent_id).unwrap_or_default()
    }
}

/// The controller: accepts one request per inbound connection and routes it.
pub struct RingtailServer {
    listener: TcpListener,
    reactor: Arc<Reactor>,
    tasking: Arc<Vec<Command>>,
    intake: ResultStore,
    shutdown: CancellationToken,
}

impl RingtailServer {
    pub async fn with_settings(settings: &Settings) -> Result<Self> {
        let listener =
            TcpListener::bind((settings.server.host.as_str(), settings.server.port)).await?;
        let reactor = Arc::new(Reactor::new(ringtail::reactor::DEFAULT_QUEUE_DEPTH)?);
        Ok(RingtailServer {
            listener,
            reactor,
            tasking: Arc::new(default_tasking()),
            intake: ResultStore::default(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Replaces the batch handed to every `ListCommands` request.
    pub fn set_tasking(&mut self, commands: Vec<Command>) {
        self.tasking = Arc::new(commands);
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn intake(&self) -> ResultStore {
        self.intake.clone()
    }

    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accepts until the shutdown token fires, spawning one handler per
    /// connection. A handler failure never touches the accept loop.
    pub async fn run(&self) -> Result<()> {
        info!(addr = %self.local_addr()?, "server listening");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let handler = Handler {
                                reactor: Arc::clone(&self.reactor),
                                tasking: Arc::clone(&self.tasking),
                                intake: self.intake.clone(),
                                cancel: self.shutdown.clone(),
                            };
                            tokio::spawn(async move {
                                if let Err(e) = handler.handle(stream, peer).await {
                                    warn!(%peer, error = %e, "connection handler failed");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "failed to accept connection"),
                    }
                }
            }
        }
        info!("server stopped");
        Ok(())
    }
}

struct Handler {
    reactor: Arc<Reactor>,
    tasking: Arc<Vec<Command>>,
    intake: ResultStore,
    cancel: CancellationToken,
}

impl Handler {
    /// Decodes exactly one request and routes it. An undecodable request,
    /// including an unknown tag, errors out here: logged by the caller,
    /// connection closed, no reply.
    async fn handle(self, stream: TcpStream, peer: SocketAddr) -> ringtail::Result<()> {
        let stream = stream.into_std()?;
        // The ring reports EAGAIN for nonblocking descriptors instead of
        // suspending, so accepted sockets go back to blocking mode.
        stream.set_nonblocking(false)?;
        let conn = Connection::from_raw(Arc::clone(&self.reactor), stream.into_raw_fd());
        let mut framer = Framer::new(conn);

        let request: Request = framer.receive().await?;
        debug!(%peer, agent = request.agent_id(), "request received");

        match request {
            Request::ListCommands { agent_id } => {
                info!(%peer, %agent_id, count = self.tasking.len(), "sending command batch");
                framer.send(self.tasking.as_ref()).await?;
                // Half-close so the peer's read of the batch completes.
                framer.get_mut().shutdown_write().await?;
            }
            Request::ReadFile { agent_id, path } => {
                info!(%peer, %agent_id, %path, "direct file read");
                let command_id = format!("file-read-{path}");
                let result = files::fetch(&self.reactor, &command_id, &path, &self.cancel).await;
                framer.send(&result).await?;
            }
            Request::ReportResults { agent_id, results } => {
                for result in &results {
                    info!(
                        %agent_id,
                        command = %result.command_id,
                        return_code = result.return_code,
                        output = %String::from_utf8_lossy(&result.output),
                        "result received"
                    );
                }
                self.intake.record(&agent_id, results);
            }
        }

        framer.into_inner().close().await
    }
}

/// The batch handed out until an operator replaces it.
fn default_tasking() -> Vec<Command> {
    vec![Command::ReadFile {
        id: "read-os-release".into(),
        path: "/etc/os-release".into(),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_store_takes_exactly_once() {
        let store = ResultStore::default();
        store.record("a", vec![CommandResult::success("c1", vec![])]);
        store.record("a", vec![CommandResult::failure("c2", "boom")]);

        let taken = store.take("a");
        assert_eq!(taken.len(), 2);
        assert!(store.take("a").is_empty());
    }
}
