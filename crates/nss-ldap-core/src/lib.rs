//! # nss-ldap-core
//!
//! Core types for the nss-ldap directory engine.
//!
//! This crate provides the error and status taxonomy, configuration, reconnect policy and the
//! buffer arena that results are marshaled into.
//!
//! ## Modules
//!
//! - [`error`] - Error types and their name-service status
//! - [`status`] - Status codes and directory result code mapping
//! - [`types`] - Map selectors, scopes and transport modes
//! - [`credentials`] - Bind identities with secret passwords
//! - [`retry`] - Reconnect policy and backoff schedule
//! - [`config`] - Engine configuration and configuration sources
//! - [`arena`] - Fixed-capacity result buffer allocator

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod arena;
pub mod config;
pub mod credentials;
pub mod error;
pub mod retry;
pub mod status;
pub mod types;

// Re-export commonly used types
pub use arena::{ArenaStr, ArenaVec, BufferArena};
pub use config::{ConfigSource, DirectoryConfig};
pub use error::{Error, Result};
pub use status::Status;
pub use types::MapSelector;
