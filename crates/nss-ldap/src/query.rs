//! Query executor.
//!
//! A [`LookupRequest`] names the record type, the filter template and its arguments. The
//! executor turns it into one [`SearchRequest`] per search descriptor configured for the
//! record type and runs them in chain order until one produces entries.

use crate::backend::{MessageId, PageRequest, SearchRequest};
use crate::enumeration::{ParseOutcome, RecordParser, SubEntryState};
use crate::entry::LdapEntry;
use crate::filter::{build_filter, QueryArgs};
use crate::reconnect::{with_reconnect, SessionOperation};
use crate::session::Session;
use crate::Result;
use async_trait::async_trait;
use nss_ldap_core::arena::BufferArena;
use nss_ldap_core::config::DirectoryConfig;
use nss_ldap_core::types::MapSelector;
use nss_ldap_core::{Error, Status};
use tracing::debug;

/// A directory query for one record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRequest {
    selector: MapSelector,
    args: QueryArgs,
    filter_template: String,
    attributes: Vec<String>,
    base_override: Option<String>,
    size_limit: Option<u32>,
}

impl LookupRequest {
    /// Query for `selector` records matching `filter_template`.
    #[must_use]
    pub fn new(selector: MapSelector, filter_template: impl Into<String>) -> Self {
        Self {
            selector,
            args: QueryArgs::None,
            filter_template: filter_template.into(),
            attributes: Vec::new(),
            base_override: None,
            size_limit: None,
        }
    }

    /// Set the template arguments.
    #[must_use]
    pub fn with_args(mut self, args: QueryArgs) -> Self {
        self.args = args;
        self
    }

    /// Set the attributes to return.
    #[must_use]
    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Search below `base` instead of the configured bases.
    ///
    /// Search descriptors no longer apply, so the selector becomes [`MapSelector::None`].
    #[must_use]
    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base_override = Some(base.into());
        self.selector = MapSelector::None;
        self
    }

    /// Set the maximum number of entries the server should return.
    #[must_use]
    pub const fn with_size_limit(mut self, limit: u32) -> Self {
        self.size_limit = Some(limit);
        self
    }

    /// Record type of the query.
    #[must_use]
    pub const fn selector(&self) -> MapSelector {
        self.selector
    }

    /// Template arguments.
    #[must_use]
    pub const fn args(&self) -> &QueryArgs {
        &self.args
    }

    /// Filter template.
    #[must_use]
    pub fn filter_template(&self) -> &str {
        &self.filter_template
    }

    /// Requested attributes.
    #[must_use]
    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    /// Explicit search base, if any.
    #[must_use]
    pub fn base_override(&self) -> Option<&str> {
        self.base_override.as_deref()
    }

    /// Builds the search for the descriptor at `index` of the selector's chain.
    ///
    /// Without descriptors only index 0 exists and uses the default (or overridden) base.
    /// Returns `None` past the end of the chain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the filter template cannot be rendered.
    pub fn search_request(
        &self,
        config: &DirectoryConfig,
        index: usize,
    ) -> Result<Option<SearchRequest>> {
        let descriptors = config.descriptors(self.selector);
        let (base, scope, descriptor_filter) = if descriptors.is_empty() {
            if index > 0 {
                return Ok(None);
            }
            let base = self
                .base_override
                .clone()
                .unwrap_or_else(|| config.base.clone());
            (base, config.scope, None)
        } else {
            let Some(descriptor) = descriptors.get(index) else {
                return Ok(None);
            };
            (
                config.resolve_base(&descriptor.base),
                descriptor.scope.unwrap_or(config.scope),
                descriptor.filter.as_deref(),
            )
        };

        Ok(Some(SearchRequest {
            base,
            scope,
            filter: build_filter(&self.filter_template, &self.args, descriptor_filter)?,
            attributes: self.attributes.clone(),
            deref: config.deref,
            size_limit: self.size_limit,
            time_limit: config.time_limit(),
            page: None,
        }))
    }
}

struct SyncSearch<'a> {
    request: &'a LookupRequest,
}

#[async_trait]
impl SessionOperation for SyncSearch<'_> {
    type Output = Vec<LdapEntry>;

    async fn execute(&mut self, session: &mut Session) -> Result<Self::Output> {
        let config = session.config()?;
        let mut index = 0;

        while let Some(search) = self.request.search_request(&config, index)? {
            debug!(base = %search.base, filter = %search.filter, "searching directory");
            match session.connection()?.search(&search).await {
                Ok(entries) if !entries.is_empty() => return Ok(entries),
                Ok(_) => {}
                Err(err) if err.status() == Status::NotFound => {
                    debug!(base = %search.base, "search found nothing: {err}");
                }
                Err(err) => return Err(err),
            }
            index += 1;
        }

        Ok(Vec::new())
    }
}

/// Runs `request` to completion, trying each search descriptor until one matches.
///
/// An empty result is not an error.
///
/// # Errors
///
/// Returns [`Error::Unavailable`] when no server could answer, or the first error that is
/// not a "nothing found" outcome.
pub async fn search_sync(session: &mut Session, request: &LookupRequest) -> Result<Vec<LdapEntry>> {
    with_reconnect(session, &mut SyncSearch { request }).await
}

struct ReadEntry<'a> {
    dn: &'a str,
    attributes: &'a [&'a str],
}

#[async_trait]
impl SessionOperation for ReadEntry<'_> {
    type Output = Option<LdapEntry>;

    async fn execute(&mut self, session: &mut Session) -> Result<Self::Output> {
        let config = session.config()?;
        let mut search = SearchRequest::read(self.dn, self.attributes);
        search.time_limit = config.time_limit();

        match session.connection()?.search(&search).await {
            Ok(entries) => Ok(entries.into_iter().next()),
            Err(err) if err.status() == Status::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Reads the entry named `dn` with a base-scoped search.
///
/// Returns `None` when the entry does not exist.
///
/// # Errors
///
/// Returns [`Error::Unavailable`] when no server could answer.
pub async fn read_entry(
    session: &mut Session,
    dn: &str,
    attributes: &[&str],
) -> Result<Option<LdapEntry>> {
    with_reconnect(session, &mut ReadEntry { dn, attributes }).await
}

struct AsyncSearch<'a> {
    request: &'a LookupRequest,
    descriptor_index: usize,
}

#[async_trait]
impl SessionOperation for AsyncSearch<'_> {
    type Output = Option<MessageId>;

    async fn execute(&mut self, session: &mut Session) -> Result<Self::Output> {
        start_page(session, self.request, self.descriptor_index, Vec::new()).await
    }
}

/// Starts a streaming search against the descriptor at `descriptor_index`.
///
/// Returns `None` when the selector's descriptor chain has no such entry.
///
/// # Errors
///
/// Returns [`Error::Unavailable`] when no server could accept the search.
pub async fn search_async(
    session: &mut Session,
    request: &LookupRequest,
    descriptor_index: usize,
) -> Result<Option<MessageId>> {
    with_reconnect(
        session,
        &mut AsyncSearch {
            request,
            descriptor_index,
        },
    )
    .await
}

/// Starts one page of a streaming search on the current connection.
///
/// Paging is requested only when enabled in the configuration; `cookie` is empty for the
/// first page.
pub(crate) async fn start_page(
    session: &mut Session,
    request: &LookupRequest,
    descriptor_index: usize,
    cookie: Vec<u8>,
) -> Result<Option<MessageId>> {
    let config = session.config()?;
    let Some(mut search) = request.search_request(&config, descriptor_index)? else {
        return Ok(None);
    };
    if config.flags.paged_results && config.page_size > 0 {
        search.page = Some(PageRequest {
            size: config.page_size,
            cookie,
        });
    }

    debug!(
        base = %search.base,
        filter = %search.filter,
        descriptor = descriptor_index,
        "starting directory search"
    );
    let id = session.connection()?.start_search(&search).await?;
    Ok(Some(id))
}

/// Runs `request` and parses the first entry `parser` accepts.
///
/// The cursor handed to the parser is keyed by the request's first string argument.
/// Returns the number of arena bytes the record uses.
///
/// # Errors
///
/// Returns [`Error::NotFound`] when no entry yields a record, [`Error::BufferTooSmall`]
/// when the record does not fit, or the search error.
pub async fn lookup_one(
    session: &mut Session,
    request: &LookupRequest,
    parser: &mut dyn RecordParser,
    arena: &mut BufferArena<'_>,
) -> Result<usize> {
    let entries = search_sync(session, request).await?;
    let key = request.args().first_string().unwrap_or_default().to_string();

    for entry in &entries {
        let start = arena.checkpoint();
        let before = arena.used();
        let mut state = SubEntryState::ByKey(key.clone());

        match parser.parse(entry, &mut state, arena) {
            Ok(ParseOutcome::Record) => return Ok(arena.used() - before),
            Ok(ParseOutcome::Skip) => arena.rollback(start),
            Err(err @ Error::BufferTooSmall { .. }) => {
                arena.rollback(start);
                return Err(err);
            }
            Err(err) => {
                arena.rollback(start);
                debug!(dn = %entry.dn, "entry could not be parsed: {err}");
            }
        }
    }

    Err(Error::NotFound(format!(
        "no {} entry matched",
        request.selector().name()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockDirectoryConnection, MockDirectoryConnector, SocketIdentity};
    use crate::environment::MockHostEnvironment;
    use nss_ldap_core::config::{ConfigFlags, SearchDescriptor, StaticConfig};
    use nss_ldap_core::status::result_code;
    use nss_ldap_core::types::SearchScope;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    fn config() -> DirectoryConfig {
        DirectoryConfig::new(["ldap://ldap1"], "dc=example")
            .unwrap()
            .with_time_limit_secs(10)
    }

    fn session_with(config: DirectoryConfig, connection: MockDirectoryConnection) -> Session {
        let mut connector = MockDirectoryConnector::new();
        connector
            .expect_connect()
            .return_once(move |_| Ok(Box::new(connection)));

        let mut env = MockHostEnvironment::new();
        env.expect_process_id().return_const(1u32);
        env.expect_effective_uid().return_const(1000u32);
        env.expect_now().returning(Instant::now);
        env.expect_soft_policy_forced().return_const(false);
        env.expect_sleep().returning(|_| ());

        Session::new(
            Arc::new(connector),
            Arc::new(StaticConfig::new(config)),
            Arc::new(env),
        )
    }

    fn connection() -> MockDirectoryConnection {
        let mut connection = MockDirectoryConnection::new();
        connection.expect_simple_bind().returning(|_, _| Ok(()));
        connection
            .expect_socket_identity()
            .return_const(None::<SocketIdentity>);
        connection.expect_is_closed().return_const(false);
        connection
    }

    fn passwd_request(login: &str) -> LookupRequest {
        LookupRequest::new(MapSelector::Passwd, "(&(objectClass=posixAccount)(uid=%s))")
            .with_args(QueryArgs::string(login))
            .with_attributes(["uid", "uidNumber"])
    }

    #[test]
    fn default_base_without_descriptors() {
        let search = passwd_request("jdoe")
            .search_request(&config(), 0)
            .unwrap()
            .unwrap();
        assert_eq!(search.base, "dc=example");
        assert_eq!(search.scope, SearchScope::Subtree);
        assert_eq!(search.filter, "(&(objectClass=posixAccount)(uid=jdoe))");
        assert_eq!(search.time_limit, Some(std::time::Duration::from_secs(10)));
        assert!(passwd_request("jdoe")
            .search_request(&config(), 1)
            .unwrap()
            .is_none());
    }

    #[test]
    fn descriptors_replace_base_scope_and_filter() {
        let config = config()
            .with_search_descriptor(
                MapSelector::Passwd,
                SearchDescriptor::new("ou=people,")
                    .with_scope(SearchScope::OneLevel)
                    .with_filter("(host=web)"),
            )
            .with_search_descriptor(MapSelector::Passwd, SearchDescriptor::new("ou=staff,o=corp"));

        let first = passwd_request("jdoe").search_request(&config, 0).unwrap().unwrap();
        assert_eq!(first.base, "ou=people,dc=example");
        assert_eq!(first.scope, SearchScope::OneLevel);
        assert_eq!(first.filter, "(&(objectClass=posixAccount)(uid=jdoe)(host=web))");

        let second = passwd_request("jdoe").search_request(&config, 1).unwrap().unwrap();
        assert_eq!(second.base, "ou=staff,o=corp");
        assert_eq!(second.scope, SearchScope::Subtree);

        assert!(passwd_request("jdoe").search_request(&config, 2).unwrap().is_none());
    }

    #[test]
    fn base_override_ignores_descriptors() {
        let config = config().with_search_descriptor(
            MapSelector::Passwd,
            SearchDescriptor::new("ou=people,"),
        );
        let request = passwd_request("jdoe").with_base("ou=special,dc=example");
        assert_eq!(request.selector(), MapSelector::None);

        let search = request.search_request(&config, 0).unwrap().unwrap();
        assert_eq!(search.base, "ou=special,dc=example");
    }

    #[tokio::test]
    async fn search_sync_chains_descriptors() {
        let bases = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&bases);
        let mut connection = connection();
        connection.expect_search().returning(move |search| {
            seen.lock().unwrap().push(search.base.clone());
            match search.base.as_str() {
                "ou=a,dc=example" => Err(Error::Directory {
                    code: result_code::NO_SUCH_OBJECT,
                    message: "no such object".to_string(),
                }),
                "ou=b,dc=example" => Ok(Vec::new()),
                _ => Ok(vec![LdapEntry::new("uid=jdoe,ou=c,dc=example")]),
            }
        });

        let config = config()
            .with_search_descriptor(MapSelector::Passwd, SearchDescriptor::new("ou=a,"))
            .with_search_descriptor(MapSelector::Passwd, SearchDescriptor::new("ou=b,"))
            .with_search_descriptor(MapSelector::Passwd, SearchDescriptor::new("ou=c,"));
        let mut session = session_with(config, connection);

        let entries = search_sync(&mut session, &passwd_request("jdoe")).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            *bases.lock().unwrap(),
            vec!["ou=a,dc=example", "ou=b,dc=example", "ou=c,dc=example"]
        );
    }

    #[tokio::test]
    async fn read_entry_is_base_scoped() {
        let mut connection = connection();
        connection
            .expect_search()
            .withf(|search| search.scope == SearchScope::Base && search.base == "cn=admins,dc=example")
            .returning(|_| Ok(vec![LdapEntry::new("cn=admins,dc=example")]));
        connection
            .expect_search()
            .returning(|_| {
                Err(Error::Directory {
                    code: result_code::NO_SUCH_OBJECT,
                    message: String::new(),
                })
            });
        let mut session = session_with(config(), connection);

        let entry = read_entry(&mut session, "cn=admins,dc=example", &["memberUid"])
            .await
            .unwrap();
        assert_eq!(entry.unwrap().dn, "cn=admins,dc=example");
        assert!(read_entry(&mut session, "cn=gone,dc=example", &["memberUid"])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn search_async_requests_pages_when_enabled() {
        let mut connection = connection();
        connection
            .expect_start_search()
            .withf(|search| {
                search.page
                    == Some(PageRequest {
                        size: 2,
                        cookie: Vec::new(),
                    })
            })
            .returning(|_| Ok(MessageId(7)));

        let config = config()
            .with_page_size(2)
            .with_flags(ConfigFlags {
                paged_results: true,
                ..ConfigFlags::default()
            });
        let mut session = session_with(config, connection);
        let request = LookupRequest::new(MapSelector::Services, "(objectClass=ipService)");

        assert_eq!(
            search_async(&mut session, &request, 0).await.unwrap(),
            Some(MessageId(7))
        );
        assert_eq!(search_async(&mut session, &request, 1).await.unwrap(), None);
    }

    struct UidParser;

    impl RecordParser for UidParser {
        fn parse(
            &mut self,
            entry: &LdapEntry,
            state: &mut SubEntryState,
            arena: &mut BufferArena<'_>,
        ) -> Result<ParseOutcome> {
            let SubEntryState::ByKey(key) = state else {
                return Ok(ParseOutcome::Skip);
            };
            match entry.first("uid") {
                Some(uid) if uid == key => {
                    arena.push_str(uid)?;
                    Ok(ParseOutcome::Record)
                }
                _ => Ok(ParseOutcome::Skip),
            }
        }
    }

    #[tokio::test]
    async fn lookup_one_returns_first_record() {
        let mut connection = connection();
        connection.expect_search().returning(|_| {
            Ok(vec![
                LdapEntry::new("uid=other,dc=example").with_attribute("uid", ["other"]),
                LdapEntry::new("uid=jdoe,dc=example").with_attribute("uid", ["jdoe"]),
            ])
        });
        let mut session = session_with(config(), connection);

        let mut storage = [0u8; 64];
        let mut arena = BufferArena::new(&mut storage);
        let used = lookup_one(&mut session, &passwd_request("jdoe"), &mut UidParser, &mut arena)
            .await
            .unwrap();
        assert_eq!(used, 5);
        assert_eq!(arena.used(), 5);
    }

    #[tokio::test]
    async fn lookup_one_reports_small_buffer() {
        let mut connection = connection();
        connection.expect_search().returning(|_| {
            Ok(vec![
                LdapEntry::new("uid=jdoe,dc=example").with_attribute("uid", ["jdoe"]),
            ])
        });
        let mut session = session_with(config(), connection);

        let mut storage = [0u8; 3];
        let mut arena = BufferArena::new(&mut storage);
        let err = lookup_one(&mut session, &passwd_request("jdoe"), &mut UidParser, &mut arena)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::TryAgain);
        assert_eq!(arena.used(), 0);
    }

    #[tokio::test]
    async fn lookup_one_without_match_is_not_found() {
        let mut connection = connection();
        connection.expect_search().returning(|_| Ok(Vec::new()));
        let mut session = session_with(config(), connection);

        let mut storage = [0u8; 16];
        let mut arena = BufferArena::new(&mut storage);
        let err = lookup_one(&mut session, &passwd_request("jdoe"), &mut UidParser, &mut arena)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::NotFound);
    }
}
