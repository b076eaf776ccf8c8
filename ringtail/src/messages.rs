//! Protocol values exchanged between agent, controller, and direct clients.

use serde::{Deserialize, Serialize};

/// One request per connection, sent by the party that dialed. The variant
/// tag travels on the wire, so each request carries exactly the payload its
/// kind needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Ask the controller for the current command batch.
    ListCommands { agent_id: String },
    /// Deliver every result produced since the last report.
    ReportResults {
        agent_id: String,
        results: Vec<CommandResult>,
    },
    /// Stream one file from the serving host back to the requester.
    ReadFile { agent_id: String, path: String },
}

impl Request {
    pub fn agent_id(&self) -> &str {
        match self {
            Request::ListCommands { agent_id }
            | Request::ReportResults { agent_id, .. }
            | Request::ReadFile { agent_id, .. } => agent_id,
        }
    }
}

/// Outcome of one command execution. `output` holds produced content on
/// success and human-readable error text on failure; only `return_code`
/// distinguishes the two.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub return_code: i32,
    pub output: Vec<u8>,
}

impl CommandResult {
    pub fn success(command_id: impl Into<String>, output: Vec<u8>) -> Self {
        CommandResult {
            command_id: command_id.into(),
            return_code: 0,
            output,
        }
    }

    pub fn failure(command_id: impl Into<String>, message: impl Into<String>) -> Self {
        CommandResult {
            command_id: command_id.into(),
            return_code: 1,
            output: message.into().into_bytes(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.return_code == 0
    }
}

/// Tasks the controller can hand to an agent. The set is closed: encoder and
/// decoder both compile in every variant, and the wire tag only selects
/// among them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Read `path` on the agent's host and return its bytes.
    ReadFile { id: String, path: String },
}

impl Command {
    pub fn id(&self) -> &str {
        match self {
            Command::ReadFile { id, .. } => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_constructors_set_codes() {
        let ok = CommandResult::success("c1", b"data".to_vec());
        assert!(ok.is_success());
        assert_eq!(ok.output, b"data");

        let failed = CommandResult::failure("c2", "Failed to open file: ENOENT");
        assert!(!failed.is_success());
        assert_eq!(failed.return_code, 1);
        assert!(String::from_utf8_lossy(&failed.output).contains("Failed to open file"));
    }

    #[test]
    fn request_exposes_agent_id_uniformly() {
        let requests = [
            Request::ListCommands {
                agent_id: "m".into(),
            },
            Request::ReportResults {
                agent_id: "m".into(),
                results: vec![],
            },
            Request::ReadFile {
                agent_id: "m".into(),
                path: "/p".into(),
            },
        ];
        for request in &requests {
            assert_eq!(request.agent_id(), "m");
        }
    }
}
