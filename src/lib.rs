pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod logging;

pub use config::{ServerConfig, TransferConfig};
pub use connection::{create_connection, FileEntry, ServerConnection};
pub use core::{RunStatus, TransferOrchestrator, TransferReport};
pub use error::{Result, TransferError};
