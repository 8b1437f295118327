//! In-memory directory used by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use nss_ldap::backend::{
    ConnectOptions, DirectoryConnection, DirectoryConnector, MessageId, SearchDone,
    SearchMessage, SearchRequest, SocketIdentity,
};
use nss_ldap::environment::HostEnvironment;
use nss_ldap::{Directory, LdapEntry, Result};
use nss_ldap_core::config::{DirectoryConfig, StaticConfig};
use nss_ldap_core::types::SearchScope;
use nss_ldap_core::Error;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct State {
    entries: Vec<LdapEntry>,
    down: HashSet<String>,
    connects: Vec<String>,
    unbinds: usize,
    searches: Vec<SearchRequest>,
}

/// A directory server farm holding one shared set of entries.
#[derive(Clone, Default)]
pub struct FakeDirectory {
    state: Arc<Mutex<State>>,
}

impl FakeDirectory {
    pub fn new(entries: Vec<LdapEntry>) -> Self {
        let directory = Self::default();
        directory.state.lock().unwrap().entries = entries;
        directory
    }

    /// Refuses connections to `uri` until [`FakeDirectory::restore`].
    pub fn take_down(&self, uri: &str) {
        self.state.lock().unwrap().down.insert(uri.to_string());
    }

    pub fn restore(&self, uri: &str) {
        self.state.lock().unwrap().down.remove(uri);
    }

    /// URIs connected to, in order, including refused attempts.
    pub fn connects(&self) -> Vec<String> {
        self.state.lock().unwrap().connects.clone()
    }

    pub fn unbinds(&self) -> usize {
        self.state.lock().unwrap().unbinds
    }

    pub fn searches(&self) -> Vec<SearchRequest> {
        self.state.lock().unwrap().searches.clone()
    }

    /// Blocking handle over this directory.
    pub fn handle(&self, config: DirectoryConfig) -> Directory {
        Directory::with_backend(
            Arc::new(self.clone()),
            Arc::new(StaticConfig::new(config)),
            Arc::new(FixedHost::default()),
        )
        .unwrap()
    }

    fn run(&self, request: &SearchRequest) -> Vec<LdapEntry> {
        let mut state = self.state.lock().unwrap();
        state.searches.push(request.clone());
        let filter = Filter::parse(&request.filter);
        let mut found: Vec<LdapEntry> = state
            .entries
            .iter()
            .filter(|entry| in_scope(&entry.dn, &request.base, request.scope))
            .filter(|entry| filter.as_ref().is_some_and(|filter| filter.matches(entry)))
            .cloned()
            .collect();
        if let Some(limit) = request.size_limit.filter(|limit| *limit > 0) {
            found.truncate(limit as usize);
        }
        found
    }
}

#[async_trait]
impl DirectoryConnector for FakeDirectory {
    async fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn DirectoryConnection>> {
        let mut state = self.state.lock().unwrap();
        state.connects.push(options.uri.clone());
        if state.down.contains(&options.uri) {
            return Err(Error::Unavailable(format!("{} refused the connection", options.uri)));
        }
        Ok(Box::new(FakeConnection {
            directory: self.clone(),
            uri: options.uri.clone(),
            streams: HashMap::new(),
            next_id: 1,
        }))
    }
}

struct FakeConnection {
    directory: FakeDirectory,
    uri: String,
    streams: HashMap<i32, VecDeque<SearchMessage>>,
    next_id: i32,
}

impl FakeConnection {
    fn check_up(&self) -> Result<()> {
        if self.directory.state.lock().unwrap().down.contains(&self.uri) {
            return Err(Error::Unavailable(format!("{} went away", self.uri)));
        }
        Ok(())
    }
}

#[async_trait]
impl DirectoryConnection for FakeConnection {
    async fn simple_bind(&mut self, _dn: &str, _password: &str) -> Result<()> {
        self.check_up()
    }

    async fn search(&mut self, request: &SearchRequest) -> Result<Vec<LdapEntry>> {
        self.check_up()?;
        Ok(self.directory.run(request))
    }

    async fn start_search(&mut self, request: &SearchRequest) -> Result<MessageId> {
        self.check_up()?;
        let found = self.directory.run(request);

        let (page, cookie) = match &request.page {
            Some(page) => {
                let offset: usize = std::str::from_utf8(&page.cookie)
                    .ok()
                    .and_then(|cookie| cookie.parse().ok())
                    .unwrap_or(0);
                let end = (offset + page.size as usize).min(found.len());
                let cookie = if end < found.len() {
                    end.to_string().into_bytes()
                } else {
                    Vec::new()
                };
                (found[offset.min(end)..end].to_vec(), Some(cookie))
            }
            None => (found, None),
        };

        let mut messages: VecDeque<SearchMessage> =
            page.into_iter().map(SearchMessage::Entry).collect();
        messages.push_back(SearchMessage::Reference);
        messages.push_back(SearchMessage::Done(SearchDone {
            result_code: 0,
            message: String::new(),
            page_cookie: cookie,
        }));

        let id = self.next_id;
        self.next_id += 1;
        self.streams.insert(id, messages);
        Ok(MessageId(id))
    }

    async fn next_message(&mut self, id: MessageId) -> Result<SearchMessage> {
        self.check_up()?;
        self.streams
            .get_mut(&id.0)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| Error::Directory {
                code: 80,
                message: format!("no outstanding search {}", id.0),
            })
    }

    async fn abandon(&mut self, id: MessageId) -> Result<()> {
        self.streams.remove(&id.0);
        Ok(())
    }

    async fn unbind(&mut self) -> Result<()> {
        self.directory.state.lock().unwrap().unbinds += 1;
        Ok(())
    }

    fn disconnect(&mut self) {}

    fn forget(&mut self) {}

    fn socket_identity(&self) -> Option<SocketIdentity> {
        None
    }

    fn is_closed(&mut self) -> bool {
        false
    }
}

/// A host that never forks; backoff sleeps are recorded instead of slept.
#[derive(Default)]
pub struct FixedHost {
    sleeps: Mutex<Vec<Duration>>,
}

#[async_trait]
impl HostEnvironment for FixedHost {
    fn process_id(&self) -> u32 {
        4242
    }

    fn effective_uid(&self) -> u32 {
        1000
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn soft_policy_forced(&self) -> bool {
        false
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

fn in_scope(dn: &str, base: &str, scope: SearchScope) -> bool {
    let dn = dn.to_ascii_lowercase();
    let base = base.to_ascii_lowercase();
    if dn == base {
        return scope != SearchScope::OneLevel;
    }
    let Some(rdn) = dn.strip_suffix(&base).and_then(|rest| rest.strip_suffix(',')) else {
        return false;
    };
    match scope {
        SearchScope::Base => false,
        SearchScope::OneLevel => !rdn.contains(','),
        SearchScope::Subtree => true,
    }
}

/// The subset of RFC 4515 filters the engine renders.
enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Present(String),
    Equal(String, String),
}

impl Filter {
    fn parse(text: &str) -> Option<Self> {
        let (filter, rest) = Self::parse_one(text.trim())?;
        rest.is_empty().then_some(filter)
    }

    fn parse_one(text: &str) -> Option<(Self, &str)> {
        let body = text.strip_prefix('(')?;
        match body.chars().next()? {
            '&' | '|' => {
                let mut rest = &body[1..];
                let mut children = Vec::new();
                while !rest.starts_with(')') {
                    let (child, after) = Self::parse_one(rest)?;
                    children.push(child);
                    rest = after;
                }
                let filter = if body.starts_with('&') {
                    Self::And(children)
                } else {
                    Self::Or(children)
                };
                Some((filter, &rest[1..]))
            }
            '!' => {
                let (child, rest) = Self::parse_one(&body[1..])?;
                Some((Self::Not(Box::new(child)), rest.strip_prefix(')')?))
            }
            _ => {
                let close = body.find(')')?;
                let (attribute, value) = body[..close].split_once('=')?;
                let filter = if value == "*" {
                    Self::Present(attribute.to_string())
                } else {
                    Self::Equal(attribute.to_string(), unescape(value))
                };
                Some((filter, &body[close + 1..]))
            }
        }
    }

    fn matches(&self, entry: &LdapEntry) -> bool {
        match self {
            Self::And(children) => children.iter().all(|child| child.matches(entry)),
            Self::Or(children) => children.iter().any(|child| child.matches(entry)),
            Self::Not(child) => !child.matches(entry),
            Self::Present(attribute) => {
                attribute.eq_ignore_ascii_case("objectClass") || entry.first(attribute).is_some()
            }
            Self::Equal(attribute, value) => {
                if attribute.eq_ignore_ascii_case("distinguishedName") {
                    return entry.dn.eq_ignore_ascii_case(value);
                }
                entry
                    .values(attribute)
                    .unwrap_or_default()
                    .iter()
                    .any(|candidate| candidate.eq_ignore_ascii_case(value))
            }
        }
    }
}

fn unescape(value: &str) -> String {
    let mut bytes = Vec::with_capacity(value.len());
    let raw = value.as_bytes();
    let mut index = 0;
    while index < raw.len() {
        if raw[index] == b'\\' && index + 2 < raw.len() {
            if let Ok(byte) = u8::from_str_radix(&value[index + 1..index + 3], 16) {
                bytes.push(byte);
                index += 3;
                continue;
            }
        }
        bytes.push(raw[index]);
        index += 1;
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Configuration for endpoints `uris` under `dc=example`.
pub fn config(uris: &[&str]) -> DirectoryConfig {
    DirectoryConfig::new(uris.iter().copied(), "dc=example").unwrap()
}
