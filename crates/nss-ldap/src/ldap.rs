//! Directory backend implemented on `ldap3`.

use crate::backend::{
    ConnectOptions, DirectoryConnection, DirectoryConnector, MessageId, SearchDone,
    SearchMessage, SearchRequest, SocketIdentity,
};
use crate::entry::LdapEntry;
use crate::Result;
use async_trait::async_trait;
use ldap3::controls::{ControlType, PagedResults};
use ldap3::{
    DerefAliases, Ldap, LdapConnAsync, LdapConnSettings, Scope, SearchEntry, SearchOptions,
    SearchResult, SearchStream,
};
use native_tls::{Certificate, TlsConnector};
use nss_ldap_core::error::Error;
use nss_ldap_core::status::{status_for_result_code, Status};
use nss_ldap_core::types::{DerefPolicy, SearchScope, TlsMode};
use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

type Stream = SearchStream<'static, String, Vec<String>>;

/// Connector that opens `ldap3` connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ldap3Connector;

impl Ldap3Connector {
    /// Creates a new connector instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DirectoryConnector for Ldap3Connector {
    async fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn DirectoryConnection>> {
        if options.protocol_version != 3 {
            debug!(
                uri = %options.uri,
                "protocol version {} requested, connecting with version 3",
                options.protocol_version
            );
        }

        let settings = build_ldap_settings(options)?;
        let (conn, ldap) = with_deadline(
            options.connect_timeout,
            "connect",
            LdapConnAsync::with_settings(settings, &options.uri),
        )
        .await?;
        ldap3::drive!(conn);

        Ok(Box::new(Ldap3Connection {
            ldap,
            streams: HashMap::new(),
            connect_timeout: options.connect_timeout,
            operation_timeout: options.operation_timeout,
        }))
    }
}

struct Ldap3Connection {
    ldap: Ldap,
    streams: HashMap<i32, Stream>,
    connect_timeout: Option<Duration>,
    operation_timeout: Option<Duration>,
}

impl Ldap3Connection {
    fn search_options(request: &SearchRequest) -> SearchOptions {
        let mut options = SearchOptions::new().deref(deref_aliases(request.deref));
        if let Some(limit) = request.size_limit {
            options = options.sizelimit(i32::try_from(limit).unwrap_or(i32::MAX));
        }
        if let Some(limit) = request.time_limit {
            options = options.timelimit(i32::try_from(limit.as_secs()).unwrap_or(i32::MAX));
        }
        options
    }

    fn deadline(&self, request: &SearchRequest) -> Option<Duration> {
        request.time_limit.or(self.operation_timeout)
    }
}

#[async_trait]
impl DirectoryConnection for Ldap3Connection {
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<()> {
        let result = with_deadline(
            self.connect_timeout,
            "bind",
            self.ldap.simple_bind(dn, password),
        )
        .await?;
        check_result(result)
    }

    async fn search(&mut self, request: &SearchRequest) -> Result<Vec<LdapEntry>> {
        let deadline = self.deadline(request);
        let SearchResult(entries, result) = with_deadline(
            deadline,
            "search",
            self.ldap
                .with_search_options(Self::search_options(request))
                .search(
                    &request.base,
                    scope(request.scope),
                    &request.filter,
                    request.attributes.clone(),
                ),
        )
        .await?;

        if status_for_result_code(result.rc) != Status::Success {
            return Err(directory_error(result));
        }

        Ok(entries
            .into_iter()
            .filter(|entry| !entry.is_ref() && !entry.is_intermediate())
            .map(|entry| to_entry(SearchEntry::construct(entry)))
            .collect())
    }

    async fn start_search(&mut self, request: &SearchRequest) -> Result<MessageId> {
        let deadline = self.deadline(request);
        self.ldap
            .with_search_options(Self::search_options(request));
        if let Some(page) = &request.page {
            self.ldap.with_controls(PagedResults {
                size: i32::try_from(page.size).unwrap_or(i32::MAX),
                cookie: page.cookie.clone(),
            });
        }

        let mut stream: Stream = with_deadline(
            deadline,
            "search",
            self.ldap.streaming_search(
                &request.base,
                scope(request.scope),
                &request.filter,
                request.attributes.clone(),
            ),
        )
        .await?;

        let id = stream.ldap_handle().last_id();
        self.streams.insert(id, stream);
        Ok(MessageId(id))
    }

    async fn next_message(&mut self, id: MessageId) -> Result<SearchMessage> {
        let deadline = self.operation_timeout;
        let stream = self
            .streams
            .get_mut(&id.0)
            .ok_or_else(|| Error::InvalidRequest(format!("no outstanding search {}", id.0)))?;

        match with_deadline(deadline, "search result", stream.next()).await? {
            Some(entry) if entry.is_ref() || entry.is_intermediate() => Ok(SearchMessage::Reference),
            Some(entry) => Ok(SearchMessage::Entry(to_entry(SearchEntry::construct(entry)))),
            None => {
                let mut stream = self.streams.remove(&id.0).ok_or_else(|| {
                    Error::InternalError(format!("search {} vanished", id.0))
                })?;
                Ok(SearchMessage::Done(search_done(stream.finish().await)))
            }
        }
    }

    async fn abandon(&mut self, id: MessageId) -> Result<()> {
        if self.streams.remove(&id.0).is_none() {
            return Ok(());
        }
        with_deadline(self.operation_timeout, "abandon", self.ldap.abandon(id.0)).await
    }

    async fn unbind(&mut self) -> Result<()> {
        self.streams.clear();
        with_deadline(self.operation_timeout, "unbind", self.ldap.unbind()).await
    }

    fn disconnect(&mut self) {
        // Dropping the last handle stops the driver task, which closes the socket.
        self.streams.clear();
    }

    fn forget(&mut self) {
        // The socket is owned by the driver task and never shared, so forgetting it is the
        // same as disconnecting.
        self.streams.clear();
    }

    // ldap3 keeps the socket inside its driver task, so the addresses are out of reach.
    // A descriptor closed by the host application ends the driver, which `is_closed`
    // reports instead.
    fn socket_identity(&self) -> Option<SocketIdentity> {
        None
    }

    fn is_closed(&mut self) -> bool {
        self.ldap.is_closed()
    }
}

async fn with_deadline<F, T>(limit: Option<Duration>, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = ldap3::result::Result<T>>,
{
    let result = match limit {
        Some(limit) => timeout(limit, fut)
            .await
            .map_err(|_| Error::Timeout(format!("directory {operation} timed out")))?,
        None => fut.await,
    };
    result.map_err(map_ldap_error)
}

fn build_ldap_settings(options: &ConnectOptions) -> Result<LdapConnSettings> {
    let mut settings = LdapConnSettings::new();
    if let Some(limit) = options.connect_timeout {
        settings = settings.set_conn_timeout(limit);
    }
    if options.tls.mode == TlsMode::StartTls {
        settings = settings.set_starttls(true);
    }

    if !options.tls.verify_peer {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|err| {
                Error::ConfigError(format!("failed to construct TLS connector: {err}"))
            })?;
        settings = settings.set_connector(connector).set_no_tls_verify(true);
    } else if let Some(cert_path) = &options.tls.ca_cert_file {
        let pem = fs::read(cert_path).map_err(|err| {
            Error::ConfigError(format!(
                "failed to read CA certificate {}: {err}",
                cert_path.display()
            ))
        })?;
        let certificate = Certificate::from_pem(&pem)
            .map_err(|err| Error::ConfigError(format!("invalid CA certificate: {err}")))?;
        let connector = TlsConnector::builder()
            .add_root_certificate(certificate)
            .build()
            .map_err(|err| Error::ConfigError(format!("failed to load CA certificate: {err}")))?;
        settings = settings.set_connector(connector);
    }

    Ok(settings)
}

/// Converts an `ldap3` failure into the engine error taxonomy.
pub(crate) fn map_ldap_error(err: ldap3::LdapError) -> Error {
    match err {
        ldap3::LdapError::LdapResult { result } => directory_error(result),
        other => Error::ExternalServiceError {
            service: "ldap".to_string(),
            message: other.to_string(),
        },
    }
}

fn search_done(result: ldap3::LdapResult) -> SearchDone {
    let page_cookie = result.ctrls.iter().find_map(|control| {
        (matches!(control.0, Some(ControlType::PagedResults)) && control.1.val.is_some())
            .then(|| control.1.parse::<PagedResults>().cookie)
    });
    SearchDone {
        result_code: result.rc,
        message: result.text,
        page_cookie,
    }
}

fn directory_error(result: ldap3::LdapResult) -> Error {
    Error::Directory {
        code: result.rc,
        message: result.text,
    }
}

fn check_result(result: ldap3::LdapResult) -> Result<()> {
    if result.rc == 0 {
        Ok(())
    } else {
        Err(directory_error(result))
    }
}

fn to_entry(entry: SearchEntry) -> LdapEntry {
    LdapEntry {
        dn: entry.dn,
        attributes: entry.attrs,
    }
}

const fn scope(scope: SearchScope) -> Scope {
    match scope {
        SearchScope::Base => Scope::Base,
        SearchScope::OneLevel => Scope::OneLevel,
        SearchScope::Subtree => Scope::Subtree,
    }
}

const fn deref_aliases(policy: DerefPolicy) -> DerefAliases {
    match policy {
        DerefPolicy::Never => DerefAliases::Never,
        DerefPolicy::Searching => DerefAliases::Searching,
        DerefPolicy::Finding => DerefAliases::Finding,
        DerefPolicy::Always => DerefAliases::Always,
    }
}
