//! Execution of tasked commands on the local host.

use std::sync::Arc;

use ringtail::{
    files,
    messages::{Command, CommandResult},
    reactor::Reactor,
};
use tokio_util::sync::CancellationToken;

/// Runs one command to completion, dispatching on the variant tag. Every
/// outcome, including failure, is a result; callers never see an `Err`.
pub async fn execute(
    command: Command,
    reactor: Arc<Reactor>,
    cancel: CancellationToken,
) -> CommandResult {
    match command {
        // Tasked reads use the id the controller assigned.
        Command::ReadFile { id, path } => files::fetch(&reactor, &id, &path, &cancel).await,
    }
}
