//! Chunked whole-file reads over the reactor.
//!
//! Shared by the server's direct file-read handler and the agent's tasked
//! `ReadFile` command, so both sides stream files with the same policy.

use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{messages::CommandResult, reactor::Reactor};

/// Fixed read granularity.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Reads the whole of `path` and packages the outcome as a result carrying
/// `command_id`. Never fails outright: every error becomes a
/// `return_code: 1` result whose output names what went wrong.
pub async fn fetch(
    reactor: &Reactor,
    command_id: &str,
    path: &str,
    cancel: &CancellationToken,
) -> CommandResult {
    let fd = match reactor.open(Path::new(path)).await {
        Ok(fd) => fd,
        Err(e) => return CommandResult::failure(command_id, format!("Failed to open file: {e}")),
    };

    let outcome = read_all(reactor, fd, cancel).await;

    // The descriptor is closed on every path before the result goes out.
    if let Err(e) = reactor.close(fd).await {
        warn!(path, error = %e, "failed to close file");
    }

    match outcome {
        Ok(bytes) => {
            debug!(path, size = bytes.len(), "file read complete");
            CommandResult::success(command_id, bytes)
        }
        Err(message) => CommandResult::failure(command_id, message),
    }
}

async fn read_all(
    reactor: &Reactor,
    fd: std::os::fd::RawFd,
    cancel: &CancellationToken,
) -> std::result::Result<Vec<u8>, String> {
    let size = reactor
        .stat_size(fd)
        .await
        .map_err(|e| format!("Failed to get file size: {e}"))?;

    let mut output = Vec::with_capacity(size as usize);
    let mut offset = 0u64;

    while offset < size {
        if cancel.is_cancelled() {
            return Err("Operation cancelled".into());
        }

        let want = CHUNK_SIZE.min((size - offset) as usize);
        let (n, chunk) = reactor
            .pread(fd, vec![0u8; want], offset)
            .await
            .map_err(|e| format!("Failed to read file: {e}"))?;
        // A zero read short of the statted size means the file shrank under
        // us; return what we have rather than erroring.
        if n == 0 {
            break;
        }

        output.extend_from_slice(&chunk[..n]);
        offset += n as u64;
    }

    Ok(output)
}
