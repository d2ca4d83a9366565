//! Core building blocks shared by keywarden binaries.
//!
//! The key database, configuration model, and crypto primitives live here so
//! the server, client, and CLI crates can focus on their operator surfaces.

pub mod config;
pub mod error;
pub mod host;
pub mod keydb;
pub mod logging;
pub mod record;
pub mod secret;
pub mod sysconfig;

pub use config::{ClientConfig, ServerConfig};
pub use error::{KeywardenError, KeywardenResult};
pub use keydb::{DirStore, RecordStore};
pub use record::{AliveMessage, CommandContent, LastRetrieval, PendingCommand, Record};
pub use sysconfig::Sysconfig;
