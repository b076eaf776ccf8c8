//! Stable host identity attached to every outgoing request.

use std::{fs, io};

use crate::Result;

const MACHINE_ID: &str = "/etc/machine-id";

/// Reads the machine id and trims it. The controller never validates the
/// value; it only has to be stable for this host.
pub fn agent_id() -> Result<String> {
    let raw = fs::read_to_string(MACHINE_ID)?;
    let id = raw.trim();
    if id.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, format!("{MACHINE_ID} is empty")).into());
    }
    Ok(id.to_string())
}
