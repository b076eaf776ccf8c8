//! Pieces shared by the ringtail agent, controller, and direct clients.

use crate::{reactor::ReactorError, wire::WireError};

pub mod conn;
pub mod files;
pub mod identity;
pub mod messages;
pub mod reactor;
pub mod settings;
pub mod wire;

pub type Result<T> = std::result::Result<T, RingtailError>;

#[derive(thiserror::Error, Debug)]
pub enum RingtailError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Reactor(#[from] ReactorError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Conversion(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}
