//! Bounded concurrent command execution.

use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, Result};
use ringtail::{
    messages::{Command, CommandResult},
    reactor::Reactor,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace};
use tokio_util::sync::CancellationToken;

use crate::commands;

/// Commands waiting for a worker slot. When all slots are taken and the
/// queue is full, `submit` awaits instead of rejecting: backpressure on the
/// puller beats silently shedding tasks.
const QUEUE_DEPTH: usize = 64;

/// Worker pool running submitted commands with bounded parallelism and
/// publishing their results for the puller to drain.
pub struct Executor {
    queue: StdMutex<Option<mpsc::Sender<Command>>>,
    results: StdMutex<mpsc::UnboundedReceiver<CommandResult>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    /// Spawns `workers` executing units immediately; there is no separate
    /// start step.
    pub fn new(reactor: Arc<Reactor>, workers: usize, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let rx = Arc::new(Mutex::new(rx));
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        let workers = (0..workers.max(1))
            .map(|slot| {
                let rx = Arc::clone(&rx);
                let results_tx = results_tx.clone();
                let reactor = Arc::clone(&reactor);
                let cancel = cancel.clone();
                tokio::spawn(worker(slot, rx, results_tx, reactor, cancel))
            })
            .collect();

        Executor {
            queue: StdMutex::new(Some(tx)),
            results: StdMutex::new(results_rx),
            workers: Mutex::new(workers),
        }
    }

    /// Enqueues one command. Awaits while the queue is at capacity; fails
    /// only once the executor is closed.
    pub async fn submit(&self, command: Command) -> Result<()> {
        let queue = {
            let guard = self.queue.lock().expect("queue lock poisoned");
            guard.clone()
        };
        let queue = queue.ok_or_else(|| anyhow!("executor is closed"))?;
        queue
            .send(command)
            .await
            .map_err(|_| anyhow!("executor is closed"))
    }

    /// Hands back every result produced since the last drain. Each result is
    /// returned exactly once.
    pub fn drain_results(&self) -> Vec<CommandResult> {
        let mut rx = self.results.lock().expect("results lock poisoned");
        let mut out = Vec::new();
        while let Ok(result) = rx.try_recv() {
            out.push(result);
        }
        out
    }

    /// Stops intake, runs every already-queued command to completion, and
    /// joins the workers. Nothing queued is dropped; anything produced but
    /// not yet drained stays available to `drain_results`.
    pub async fn close(&self) {
        self.queue.lock().expect("queue lock poisoned").take();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            if handle.await.is_err() {
                error!("executor worker panicked");
            }
        }
        info!("executor stopped");
    }
}

async fn worker(
    slot: usize,
    queue: Arc<Mutex<mpsc::Receiver<Command>>>,
    results: mpsc::UnboundedSender<CommandResult>,
    reactor: Arc<Reactor>,
    cancel: CancellationToken,
) {
    loop {
        // Hold the queue lock only for the dequeue, never during execution.
        let command = { queue.lock().await.recv().await };
        let Some(command) = command else { break };

        let id = command.id().to_string();
        debug!(slot, command = %id, "executing");

        // Each command runs in its own task: a panic surfaces as a JoinError
        // here and becomes a failing result instead of killing the worker.
        let result = match tokio::spawn(commands::execute(
            command,
            Arc::clone(&reactor),
            cancel.clone(),
        ))
        .await
        {
            Ok(result) => result,
            Err(e) => CommandResult::failure(&id, format!("command aborted: {e}")),
        };

        if results.send(result).is_err() {
            break;
        }
    }
    trace!(slot, "worker exited");
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, io::Write as _, time::Duration};

    use super::*;

    fn read_command(i: usize, path: &str) -> Command {
        Command::ReadFile {
            id: format!("c{i}"),
            path: path.into(),
        }
    }

    async fn drain_until(executor: &Executor, k: usize) -> Vec<CommandResult> {
        let mut results = Vec::new();
        for _ in 0..200 {
            results.extend(executor.drain_results());
            if results.len() >= k {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        results
    }

    #[tokio::test]
    async fn k_commands_yield_exactly_k_results() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"payload").unwrap();
        let path = tmp.path().to_str().unwrap().to_string();

        let reactor = Arc::new(Reactor::new(8).unwrap());
        let executor = Executor::new(reactor, 4, CancellationToken::new());

        let k = 25;
        for i in 0..k {
            executor.submit(read_command(i, &path)).await.unwrap();
        }

        let results = drain_until(&executor, k).await;
        assert_eq!(results.len(), k);

        let ids: HashSet<_> = results.iter().map(|r| r.command_id.clone()).collect();
        assert_eq!(ids.len(), k);
        assert!(results.iter().all(|r| r.return_code == 0));

        // A second drain must not re-deliver anything.
        assert!(executor.drain_results().is_empty());
        executor.close().await;
    }

    #[tokio::test]
    async fn close_completes_queued_commands() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"x").unwrap();
        let path = tmp.path().to_str().unwrap().to_string();

        let reactor = Arc::new(Reactor::new(8).unwrap());
        let executor = Executor::new(reactor, 2, CancellationToken::new());

        for i in 0..10 {
            executor.submit(read_command(i, &path)).await.unwrap();
        }
        executor.close().await;

        // Everything queued before close still produced a result.
        assert_eq!(executor.drain_results().len(), 10);
        assert!(executor.submit(read_command(99, &path)).await.is_err());
    }

    #[tokio::test]
    async fn failures_are_results_not_losses() {
        let reactor = Arc::new(Reactor::new(8).unwrap());
        let executor = Executor::new(reactor, 2, CancellationToken::new());

        executor
            .submit(read_command(0, "/no/such/file"))
            .await
            .unwrap();

        let results = drain_until(&executor, 1).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].return_code, 1);
        executor.close().await;
    }
}
