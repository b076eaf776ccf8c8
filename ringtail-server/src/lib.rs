pub mod server;

pub use crate::server::{ResultStore, RingtailServer};
