//! # Burrow SFTP
//!
//! A read-only SFTP responder that confines every session to one root
//! directory.
//!
//! The SSH transport comes from `russh`; this crate implements the SFTP v3
//! subsystem on top of it as defined in:
//! - RFC 4254: SSH Connection Protocol (subsystem channels)
//! - draft-ietf-secsh-filexfer-02: SSH File Transfer Protocol
//!
//! ## Features
//!
//! - Password authentication against a single configured login
//! - Path jail with lexical and canonical (symlink-resolving) checks
//! - Per-session handle table with an explicit state machine
//! - `ls -l` style long names in directory listings
//! - open, read, opendir, readdir, stat, lstat, realpath and close; every
//!   other request is answered with `OP_UNSUPPORTED`

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod files;
pub mod format;
pub mod handle;
pub mod jail;
pub mod protocol;
pub mod server;
pub mod session;

pub use auth::Credentials;
pub use config::{Config, LogFormat, LoggingConfig, Secret};
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use handle::HandleTable;
pub use jail::Jail;
pub use server::Server;
