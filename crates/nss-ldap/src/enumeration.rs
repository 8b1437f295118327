//! Resumable enumeration.
//!
//! An [`EnumerationContext`] walks the results of a streaming search one record at a time.
//! Each call of [`enumerate_next`] runs a small state machine:
//!
//! - **Fetch** reads one message for the outstanding search. Continuation references are
//!   skipped. When a page ends with a cookie the next page is requested; when the search
//!   ends the next search descriptor is started. When none remain the enumeration is over.
//! - **Parse** hands the current entry to a [`RecordParser`]. A parser may produce several
//!   records from one entry by leaving a sub-entry index in the cursor.
//!
//! A parser that runs out of buffer space leaves the context exactly as it was, so the
//! same record is produced again once the caller retries with a larger buffer.

use crate::backend::{MessageId, SearchMessage};
use crate::entry::LdapEntry;
use crate::query::{search_async, start_page, LookupRequest};
use crate::session::Session;
use crate::Result;
use nss_ldap_core::arena::BufferArena;
use nss_ldap_core::status::status_for_result_code;
use nss_ldap_core::{Error, Status};
use tracing::debug;

/// Position inside the current directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubEntryState {
    /// Single-record lookup; the parser selects the sub-record matching the key.
    ByKey(String),
    /// Enumeration; `None` means the next call needs a new entry, `Some(i)` re-parses the
    /// same entry at sub-position `i`.
    ByIndex(Option<usize>),
}

impl Default for SubEntryState {
    fn default() -> Self {
        Self::ByIndex(None)
    }
}

impl SubEntryState {
    /// Returns true when the current entry has no further sub-records.
    #[must_use]
    pub const fn needs_new_entry(&self) -> bool {
        !matches!(self, Self::ByIndex(Some(_)))
    }
}

/// What a parser made of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A record was written into the arena.
    Record,
    /// The entry holds no (further) record; move on.
    Skip,
}

/// Turns directory entries into host records.
pub trait RecordParser {
    /// Parses `entry` at the position given by `state` into `arena`.
    ///
    /// A parser with more sub-records to produce from the same entry sets
    /// `SubEntryState::ByIndex(Some(next))` before returning [`ParseOutcome::Record`].
    ///
    /// # Errors
    ///
    /// [`Error::BufferTooSmall`] asks the caller for a larger buffer. Other errors skip
    /// the entry.
    fn parse(
        &mut self,
        entry: &LdapEntry,
        state: &mut SubEntryState,
        arena: &mut BufferArena<'_>,
    ) -> Result<ParseOutcome>;
}

/// State of one enumeration.
#[derive(Debug, Default)]
pub struct EnumerationContext {
    request: Option<LookupRequest>,
    message_id: Option<MessageId>,
    entry: Option<LdapEntry>,
    cookie: Vec<u8>,
    descriptor_index: usize,
    state: SubEntryState,
    retry: bool,
    generation: u64,
}

impl EnumerationContext {
    /// Creates an idle context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while a search is outstanding or an entry is held.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.message_id.is_some() || self.entry.is_some()
    }

    /// Returns true when the last call stopped for lack of buffer space.
    #[must_use]
    pub const fn is_retrying(&self) -> bool {
        self.retry
    }

    /// Sub-entry cursor.
    #[must_use]
    pub const fn state(&self) -> &SubEntryState {
        &self.state
    }

    /// Index of the search descriptor being enumerated.
    #[must_use]
    pub const fn descriptor_index(&self) -> usize {
        self.descriptor_index
    }

    fn reset(&mut self) {
        self.message_id = None;
        self.entry = None;
        self.cookie.clear();
        self.descriptor_index = 0;
        self.state = SubEntryState::default();
        self.retry = false;
    }
}

/// Starts enumerating `request`, discarding whatever `ctx` was doing.
///
/// # Errors
///
/// Returns [`Error::Unavailable`] when no server accepts the search, or
/// [`Error::NotFound`] when the request has nothing to search.
pub async fn enumerate_start(
    session: &mut Session,
    ctx: &mut EnumerationContext,
    request: LookupRequest,
) -> Result<()> {
    abandon_pending(session, ctx).await;
    ctx.reset();

    let id = search_async(session, &request, 0).await?;
    ctx.generation = session.generation();
    ctx.request = Some(request);
    ctx.message_id = id;
    if id.is_none() {
        return Err(Error::NotFound("nothing to enumerate".to_string()));
    }
    Ok(())
}

/// Produces the next record into `arena`.
///
/// # Errors
///
/// Returns [`Error::NotFound`] once every entry was produced, [`Error::BufferTooSmall`]
/// when the record does not fit (the same record is produced by the next call), or
/// [`Error::Unavailable`] when the connection was lost or replaced.
pub async fn enumerate_next(
    session: &mut Session,
    ctx: &mut EnumerationContext,
    parser: &mut dyn RecordParser,
    arena: &mut BufferArena<'_>,
) -> Result<()> {
    loop {
        if ctx.entry.is_none() {
            fetch(session, ctx).await?;
            continue;
        }
        if parse(ctx, parser, arena)? {
            session.touch();
            return Ok(());
        }
    }
}

async fn fetch(session: &mut Session, ctx: &mut EnumerationContext) -> Result<()> {
    let Some(id) = ctx.message_id else {
        return Err(Error::NotFound("enumeration exhausted".to_string()));
    };
    session.ensure_initialized().await?;
    if ctx.generation != session.generation() || !session.is_connected() {
        ctx.reset();
        return Err(Error::Unavailable(
            "directory connection was reset during enumeration".to_string(),
        ));
    }

    let message = match session.connection()?.next_message(id).await {
        Ok(message) => message,
        Err(err) => {
            ctx.reset();
            if err.is_unavailable() {
                session.close().await;
            }
            return Err(err);
        }
    };

    match message {
        SearchMessage::Entry(entry) => {
            ctx.entry = Some(entry);
            ctx.state = SubEntryState::default();
        }
        SearchMessage::Reference => {}
        SearchMessage::Done(done) => {
            ctx.message_id = None;
            match status_for_result_code(done.result_code) {
                Status::Success => {}
                Status::NotFound => {
                    debug!(code = done.result_code, "search ended: {}", done.message);
                }
                _ => {
                    ctx.reset();
                    return Err(Error::Directory {
                        code: done.result_code,
                        message: done.message,
                    });
                }
            }

            if let Some(cookie) = done.next_page_cookie() {
                ctx.cookie = cookie.to_vec();
                ctx.message_id = next_search(session, ctx).await?;
                return Ok(());
            }

            ctx.cookie.clear();
            ctx.descriptor_index += 1;
            ctx.message_id = next_search(session, ctx).await?;
            if ctx.message_id.is_none() {
                return Err(Error::NotFound("enumeration exhausted".to_string()));
            }
        }
    }
    Ok(())
}

async fn next_search(
    session: &mut Session,
    ctx: &mut EnumerationContext,
) -> Result<Option<MessageId>> {
    let Some(request) = ctx.request.as_ref() else {
        return Ok(None);
    };
    match start_page(session, request, ctx.descriptor_index, ctx.cookie.clone()).await {
        Ok(id) => Ok(id),
        Err(err) => {
            ctx.reset();
            Err(err)
        }
    }
}

/// Parses the held entry. Returns true when a record was produced.
fn parse(
    ctx: &mut EnumerationContext,
    parser: &mut dyn RecordParser,
    arena: &mut BufferArena<'_>,
) -> Result<bool> {
    let Some(entry) = ctx.entry.as_ref() else {
        return Ok(false);
    };

    let start = arena.checkpoint();
    let mut cursor = ctx.state.clone();
    match parser.parse(entry, &mut cursor, arena) {
        Ok(ParseOutcome::Record) => {
            ctx.retry = false;
            if cursor.needs_new_entry() {
                ctx.entry = None;
                ctx.state = SubEntryState::default();
            } else {
                ctx.state = cursor;
            }
            Ok(true)
        }
        Ok(ParseOutcome::Skip) => {
            arena.rollback(start);
            ctx.entry = None;
            ctx.state = SubEntryState::default();
            Ok(false)
        }
        Err(err @ Error::BufferTooSmall { .. }) => {
            arena.rollback(start);
            ctx.retry = true;
            Err(err)
        }
        Err(err) => {
            arena.rollback(start);
            debug!(dn = %entry.dn, "skipping entry that could not be parsed: {err}");
            ctx.entry = None;
            ctx.state = SubEntryState::default();
            Ok(false)
        }
    }
}

async fn abandon_pending(session: &mut Session, ctx: &mut EnumerationContext) {
    let pending = ctx.message_id.take();
    // An inherited search belongs to the parent; nothing may be sent for it.
    if session.release_if_inherited() {
        return;
    }
    let Some(id) = pending else {
        return;
    };
    if ctx.generation != session.generation() {
        return;
    }
    if let Ok(connection) = session.connection() {
        if let Err(err) = connection.abandon(id).await {
            debug!(id = id.0, "failed to abandon search: {err}");
        }
    }
}

/// Ends the enumeration, abandoning any outstanding search.
///
/// With the one-shot connection policy the session is closed as well.
pub async fn enumerate_end(session: &mut Session, ctx: &mut EnumerationContext) {
    abandon_pending(session, ctx).await;
    ctx.reset();
    ctx.request = None;

    let oneshot = session
        .config()
        .is_ok_and(|config| config.flags.connect_policy_oneshot);
    if oneshot {
        session.close().await;
    }
}

/// Pulls the next raw entry of the enumeration without parsing it.
///
/// Returns `None` once the enumeration is exhausted.
pub(crate) async fn next_entry(
    session: &mut Session,
    ctx: &mut EnumerationContext,
) -> Result<Option<LdapEntry>> {
    loop {
        if let Some(entry) = ctx.entry.take() {
            ctx.state = SubEntryState::default();
            return Ok(Some(entry));
        }
        match fetch(session, ctx).await {
            Ok(()) => {}
            Err(Error::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        MockDirectoryConnection, MockDirectoryConnector, SearchDone, SocketIdentity,
    };
    use crate::environment::MockHostEnvironment;
    use mockall::Sequence;
    use nss_ldap_core::config::{ConfigFlags, DirectoryConfig, StaticConfig};
    use nss_ldap_core::types::MapSelector;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn done(cookie: Option<Vec<u8>>) -> SearchMessage {
        SearchMessage::Done(SearchDone {
            result_code: 0,
            message: String::new(),
            page_cookie: cookie,
        })
    }

    fn session_with(config: DirectoryConfig, connection: MockDirectoryConnection) -> Session {
        session_in(config, connection, Arc::new(AtomicU32::new(1)))
    }

    fn session_in(
        config: DirectoryConfig,
        connection: MockDirectoryConnection,
        pid: Arc<AtomicU32>,
    ) -> Session {
        let mut connector = MockDirectoryConnector::new();
        connector
            .expect_connect()
            .return_once(move |_| Ok(Box::new(connection)));

        let mut env = MockHostEnvironment::new();
        env.expect_process_id()
            .returning(move || pid.load(Ordering::SeqCst));
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

    fn bound() -> MockDirectoryConnection {
        let mut connection = MockDirectoryConnection::new();
        connection.expect_simple_bind().returning(|_, _| Ok(()));
        connection
            .expect_socket_identity()
            .return_const(None::<SocketIdentity>);
        connection.expect_is_closed().return_const(false);
        connection
    }

    struct CnParser;

    impl RecordParser for CnParser {
        fn parse(
            &mut self,
            entry: &LdapEntry,
            _state: &mut SubEntryState,
            arena: &mut BufferArena<'_>,
        ) -> Result<ParseOutcome> {
            match entry.first("cn") {
                Some(cn) => {
                    arena.push_str(cn)?;
                    Ok(ParseOutcome::Record)
                }
                None => Ok(ParseOutcome::Skip),
            }
        }
    }

    fn request() -> LookupRequest {
        LookupRequest::new(MapSelector::Group, "(&(objectClass=posixGroup))")
    }

    #[tokio::test]
    async fn walks_pages_and_skips_references() {
        let mut seq = Sequence::new();
        let mut connection = bound();
        connection
            .expect_start_search()
            .withf(|search| search.page.as_ref().is_some_and(|page| page.cookie.is_empty()))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(MessageId(1)));
        connection
            .expect_next_message()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(SearchMessage::Entry(LdapEntry::new("cn=a").with_attribute("cn", ["a"]))));
        connection
            .expect_next_message()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(SearchMessage::Reference));
        connection
            .expect_next_message()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(done(Some(vec![9]))));
        connection
            .expect_start_search()
            .withf(|search| search.page.as_ref().is_some_and(|page| page.cookie == [9]))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(MessageId(2)));
        connection
            .expect_next_message()
            .withf(|id| *id == MessageId(2))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(SearchMessage::Entry(LdapEntry::new("cn=b").with_attribute("cn", ["b"]))));
        connection
            .expect_next_message()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(done(Some(Vec::new()))));

        let config = DirectoryConfig::new(["ldap://ldap1"], "dc=example")
            .unwrap()
            .with_page_size(1)
            .with_flags(ConfigFlags {
                paged_results: true,
                ..ConfigFlags::default()
            });
        let mut session = session_with(config, connection);
        let mut ctx = EnumerationContext::new();
        enumerate_start(&mut session, &mut ctx, request()).await.unwrap();

        let mut names = Vec::new();
        loop {
            let mut storage = [0u8; 16];
            let mut arena = BufferArena::new(&mut storage);
            match enumerate_next(&mut session, &mut ctx, &mut CnParser, &mut arena).await {
                Ok(()) => names.push(arena.as_bytes()[..1].to_vec()),
                Err(err) => {
                    assert_eq!(err.status(), Status::NotFound);
                    break;
                }
            }
        }
        assert_eq!(names, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn small_buffer_retries_same_entry() {
        let mut connection = bound();
        connection
            .expect_start_search()
            .returning(|_| Ok(MessageId(1)));
        connection
            .expect_next_message()
            .times(1)
            .returning(|_| Ok(SearchMessage::Entry(LdapEntry::new("cn=admins").with_attribute("cn", ["admins"]))));

        let config = DirectoryConfig::new(["ldap://ldap1"], "dc=example").unwrap();
        let mut session = session_with(config, connection);
        let mut ctx = EnumerationContext::new();
        enumerate_start(&mut session, &mut ctx, request()).await.unwrap();

        let mut small = [0u8; 4];
        let mut arena = BufferArena::new(&mut small);
        let err = enumerate_next(&mut session, &mut ctx, &mut CnParser, &mut arena)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::TryAgain);
        assert!(ctx.is_retrying());
        assert_eq!(arena.used(), 0);

        let mut large = [0u8; 16];
        let mut arena = BufferArena::new(&mut large);
        enumerate_next(&mut session, &mut ctx, &mut CnParser, &mut arena)
            .await
            .unwrap();
        assert_eq!(&arena.as_bytes()[..7], b"admins\0");
        assert!(!ctx.is_retrying());
    }

    #[tokio::test]
    async fn reset_connection_is_unavailable() {
        let mut connection = bound();
        connection
            .expect_start_search()
            .returning(|_| Ok(MessageId(1)));
        connection.expect_disconnect().return_const(());

        let config = DirectoryConfig::new(["ldap://ldap1"], "dc=example").unwrap();
        let mut session = session_with(config, connection);
        let mut ctx = EnumerationContext::new();
        enumerate_start(&mut session, &mut ctx, request()).await.unwrap();

        session.close_no_unbind();
        let mut storage = [0u8; 16];
        let mut arena = BufferArena::new(&mut storage);
        let err = enumerate_next(&mut session, &mut ctx, &mut CnParser, &mut arena)
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert!(!ctx.is_active());
    }

    #[tokio::test]
    async fn end_abandons_and_closes_oneshot_session() {
        let mut connection = bound();
        connection
            .expect_start_search()
            .returning(|_| Ok(MessageId(4)));
        connection
            .expect_abandon()
            .withf(|id| *id == MessageId(4))
            .times(1)
            .returning(|_| Ok(()));
        connection.expect_unbind().times(1).returning(|| Ok(()));

        let config = DirectoryConfig::new(["ldap://ldap1"], "dc=example")
            .unwrap()
            .with_flags(ConfigFlags {
                connect_policy_oneshot: true,
                ..ConfigFlags::default()
            });
        let mut session = session_with(config, connection);
        let mut ctx = EnumerationContext::new();
        enumerate_start(&mut session, &mut ctx, request()).await.unwrap();
        assert!(ctx.is_active());

        enumerate_end(&mut session, &mut ctx).await;
        assert!(!ctx.is_active());
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn forked_child_does_not_read_the_parent_search() {
        let mut connection = bound();
        connection
            .expect_start_search()
            .times(1)
            .returning(|_| Ok(MessageId(1)));
        connection.expect_next_message().never();
        connection.expect_unbind().never();
        connection.expect_disconnect().times(1).return_const(());

        let pid = Arc::new(AtomicU32::new(1));
        let config = DirectoryConfig::new(["ldap://ldap1"], "dc=example").unwrap();
        let mut session = session_in(config, connection, Arc::clone(&pid));
        let mut ctx = EnumerationContext::new();
        enumerate_start(&mut session, &mut ctx, request()).await.unwrap();

        pid.store(2, Ordering::SeqCst);
        let mut storage = [0u8; 16];
        let mut arena = BufferArena::new(&mut storage);
        let err = enumerate_next(&mut session, &mut ctx, &mut CnParser, &mut arena)
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert!(!ctx.is_active());
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn forked_child_ends_without_abandon_or_unbind() {
        let mut connection = bound();
        connection
            .expect_start_search()
            .returning(|_| Ok(MessageId(3)));
        connection.expect_abandon().never();
        connection.expect_unbind().never();
        connection.expect_disconnect().times(1).return_const(());

        let config = DirectoryConfig::new(["ldap://ldap1"], "dc=example")
            .unwrap()
            .with_flags(ConfigFlags {
                connect_policy_oneshot: true,
                ..ConfigFlags::default()
            });
        let mut session = session_with(config, connection);
        let mut ctx = EnumerationContext::new();
        enumerate_start(&mut session, &mut ctx, request()).await.unwrap();

        session.mark_forked();
        enumerate_end(&mut session, &mut ctx).await;
        assert!(!ctx.is_active());
        assert!(!session.is_connected());
    }

    #[test]
    fn cursor_defaults_to_new_entry() {
        assert!(SubEntryState::default().needs_new_entry());
        assert!(SubEntryState::ByKey("ssh".to_string()).needs_new_entry());
        assert!(!SubEntryState::ByIndex(Some(1)).needs_new_entry());
    }
}
