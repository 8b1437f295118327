//! LDAP directory engine for name-service lookups.
//!
//! This crate holds the session with a directory server, recovers from lost connections,
//! runs lookups and resumable enumerations, and marshals results into caller-owned buffers.
//! Group, initgroups and netgroup membership is expanded with cycle and depth protection.
//!
//! Hosts use the blocking [`Directory`] handle; the async modules underneath can be driven
//! directly with a custom [`backend::DirectoryConnector`].

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod directory;
pub mod dn;
pub mod entry;
pub mod enumeration;
pub mod environment;
pub mod expansion;
pub mod filter;
pub mod ldap;
pub mod marshal;
pub mod netgroup;
pub mod query;
pub mod reconnect;
pub mod schema;
pub mod session;

pub use directory::{Directory, Transaction};
pub use dn::{DistinguishedName, DistinguishedNameError};
pub use entry::LdapEntry;
pub use enumeration::{EnumerationContext, ParseOutcome, RecordParser, SubEntryState};
pub use expansion::{Direction, Expansion, ExpansionPolicy, ExpansionSeed, Member};
pub use filter::QueryArgs;
pub use netgroup::{NetgroupCursor, NetgroupMember, NetgroupTriple};
pub use query::LookupRequest;
pub use session::Session;

/// Convenient result alias that reuses the core error type.
pub type Result<T> = nss_ldap_core::Result<T>;
