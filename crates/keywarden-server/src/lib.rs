//! The keywarden key service: request handling, admission control, pending
//! commands, notifications, and the two listener loops (TLS TCP for clients,
//! unix socket for privileged operators).

pub mod listener;
pub mod mail;
pub mod service;
pub mod tls;

pub use listener::{serve_tcp, serve_unix, bind_operator_socket};
pub use mail::Mailer;
pub use service::{KeyService, Peer};
