//! Directory backend seam.
//!
//! The session manager talks to servers only through [`DirectoryConnector`] and
//! [`DirectoryConnection`]. The default implementation lives in [`crate::ldap`]; tests plug
//! in mocks or in-memory fakes.

use crate::entry::LdapEntry;
use crate::Result;
use async_trait::async_trait;
use nss_ldap_core::config::TlsConfig;
use nss_ldap_core::types::{DerefPolicy, SearchScope};
use std::net::SocketAddr;
use std::time::Duration;

/// Identifier of an outstanding asynchronous search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

/// Parameters for opening a transport to one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Server URI
    pub uri: String,
    /// Transport security
    pub tls: TlsConfig,
    /// Protocol version to negotiate
    pub protocol_version: u8,
    /// Deadline for establishing the transport and binding
    pub connect_timeout: Option<Duration>,
    /// Deadline applied to each later protocol wait
    pub operation_timeout: Option<Duration>,
}

/// Local and peer addresses of an established transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketIdentity {
    /// Local socket address
    pub local: SocketAddr,
    /// Peer socket address
    pub peer: SocketAddr,
}

/// Paged results control attached to a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Entries per page
    pub size: u32,
    /// Cookie returned with the previous page, empty for the first page
    pub cookie: Vec<u8>,
}

/// A single search operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Search base
    pub base: String,
    /// Search scope
    pub scope: SearchScope,
    /// Rendered filter
    pub filter: String,
    /// Attributes to return; empty requests all user attributes
    pub attributes: Vec<String>,
    /// Alias dereferencing
    pub deref: DerefPolicy,
    /// Maximum number of entries (server enforced)
    pub size_limit: Option<u32>,
    /// Time limit for the search
    pub time_limit: Option<Duration>,
    /// Paged results control
    pub page: Option<PageRequest>,
}

impl SearchRequest {
    /// Base-scope read of a single entry.
    #[must_use]
    pub fn read(dn: impl Into<String>, attributes: &[&str]) -> Self {
        Self {
            base: dn.into(),
            scope: SearchScope::Base,
            filter: "(objectClass=*)".to_string(),
            attributes: attributes.iter().map(|attr| (*attr).to_string()).collect(),
            deref: DerefPolicy::Never,
            size_limit: None,
            time_limit: None,
            page: None,
        }
    }
}

/// Final status of an asynchronous search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchDone {
    /// Protocol result code
    pub result_code: u32,
    /// Diagnostic text
    pub message: String,
    /// Paged results cookie; `Some` and non-empty when another page exists
    pub page_cookie: Option<Vec<u8>>,
}

impl SearchDone {
    /// Returns the cookie for the next page, if the server indicated one.
    #[must_use]
    pub fn next_page_cookie(&self) -> Option<&[u8]> {
        self.page_cookie
            .as_deref()
            .filter(|cookie| !cookie.is_empty())
    }
}

/// One message of an asynchronous search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchMessage {
    /// A matching entry
    Entry(LdapEntry),
    /// A continuation reference or intermediate response
    Reference,
    /// The search finished
    Done(SearchDone),
}

/// Opens transports to directory endpoints.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    /// Establishes a transport to `options.uri`.
    ///
    /// # Errors
    ///
    /// Returns an unavailable-class error when the endpoint cannot be reached.
    async fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn DirectoryConnection>>;
}

/// An established transport to one directory server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectoryConnection: Send {
    /// Performs a simple bind; an empty DN binds anonymously.
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<()>;

    /// Runs a search to completion and returns its entries.
    ///
    /// Size and time limit results are treated as success with partial entries.
    async fn search(&mut self, request: &SearchRequest) -> Result<Vec<LdapEntry>>;

    /// Starts an asynchronous search.
    async fn start_search(&mut self, request: &SearchRequest) -> Result<MessageId>;

    /// Reads the next message of an asynchronous search.
    async fn next_message(&mut self, id: MessageId) -> Result<SearchMessage>;

    /// Abandons an outstanding asynchronous search.
    async fn abandon(&mut self, id: MessageId) -> Result<()>;

    /// Sends an unbind request.
    async fn unbind(&mut self) -> Result<()>;

    /// Releases the transport without sending anything on it.
    fn disconnect(&mut self);

    /// Abandons the transport without sending on or closing the underlying descriptor,
    /// which now belongs to someone else.
    fn forget(&mut self);

    /// Current local and peer addresses, if the transport exposes them.
    fn socket_identity(&self) -> Option<SocketIdentity>;

    /// Returns true once the transport went away underneath the connection, for example
    /// because the host application closed the descriptor.
    fn is_closed(&mut self) -> bool;
}
