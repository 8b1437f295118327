//! Membership expansion.
//!
//! Flattens nested groups into their members, collects the groups a user belongs to
//! (initgroups) and resolves netgroups into triples. Directory graphs may contain cycles, so
//! every traversal keeps a [`SeenSet`] and stops at a fixed depth. A branch that fails is
//! dropped without failing the whole expansion.

use crate::dn::strip_optional_uid;
use crate::entry::LdapEntry;
use crate::enumeration::{enumerate_end, enumerate_start, next_entry, EnumerationContext};
use crate::filter::QueryArgs;
use crate::netgroup::{NetgroupCursor, NetgroupMember, NetgroupTriple};
use crate::query::{read_entry, search_sync, LookupRequest};
use crate::schema::{FilterSet, SchemaNames};
use crate::session::Session;
use crate::Result;
use nss_ldap_core::config::DirectoryConfig;
use nss_ldap_core::types::MapSelector;
use nss_ldap_core::Error;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

/// Deepest nesting level that is still expanded.
pub const MAX_DEPTH: usize = 16;

/// Member lists start with room for this many entries and double whenever they fill up.
pub const MEMBER_CHUNK: usize = 64;

/// Where to start an expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpansionSeed {
    /// All users of a group, following nested groups.
    GroupMembers {
        /// DN of the group
        group_dn: String,
    },
    /// All groups a user belongs to.
    UserGroups {
        /// Login name
        user: String,
        /// Primary group, left out of the result
        primary_gid: Option<u32>,
    },
    /// All triples of a netgroup, following nested netgroups.
    Netgroup {
        /// Netgroup name
        name: String,
    },
}

/// Direction in which group membership is chased.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    /// Search for groups that list the member.
    #[default]
    Forward,
    /// Follow the member's `memberOf` backlinks.
    Backlink,
}

/// Limits of an expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpansionPolicy {
    /// Membership direction for user groups
    pub direction: Direction,
    /// Deepest nesting level expanded
    pub max_depth: usize,
    /// Follow nested groups and netgroups
    pub nested: bool,
    /// Most group ids collected for a user, `None` for no limit
    pub limit: Option<usize>,
}

impl Default for ExpansionPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpansionPolicy {
    /// Forward direction, [`MAX_DEPTH`], nesting followed.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            direction: Direction::Forward,
            max_depth: MAX_DEPTH,
            nested: true,
            limit: None,
        }
    }

    /// Policy selected by the configuration flags.
    #[must_use]
    pub const fn from_config(config: &DirectoryConfig) -> Self {
        let direction = if config.flags.initgroups_backlink {
            Direction::Backlink
        } else {
            Direction::Forward
        };
        Self::new().with_direction(direction)
    }

    /// Set the membership direction.
    #[must_use]
    pub const fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Set the deepest nesting level expanded.
    #[must_use]
    pub const fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Set whether nesting is followed.
    #[must_use]
    pub const fn with_nested(mut self, nested: bool) -> Self {
        self.nested = nested;
        self
    }

    /// Cap the number of group ids collected for a user. Zero removes the cap.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = if limit == 0 { None } else { Some(limit) };
        self
    }
}

/// One result of an expansion.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Member {
    /// A user login
    User(String),
    /// A numeric group id
    GroupId(u32),
    /// A netgroup triple
    Triple(NetgroupTriple),
}

/// Insertion-ordered set of names compared ignoring ASCII case.
#[derive(Debug, Clone, Default)]
pub struct SeenSet {
    names: Vec<String>,
    folded: HashSet<String>,
}

impl SeenSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `name`; returns false if it was already present.
    pub fn insert(&mut self, name: &str) -> bool {
        if !self.folded.insert(name.to_ascii_lowercase()) {
            return false;
        }
        self.names.push(name.to_string());
        true
    }

    /// Returns true if `name` was added before.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.folded.contains(&name.to_ascii_lowercase())
    }

    /// Number of names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns true if nothing was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Names in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

#[derive(Debug, Default)]
struct MemberList {
    members: Vec<Member>,
    index: HashSet<Member>,
}

impl MemberList {
    fn push(&mut self, member: Member) {
        if self.index.contains(&member) {
            return;
        }
        if self.members.len() == self.members.capacity() {
            self.members.reserve(self.members.len().max(MEMBER_CHUNK));
        }
        self.index.insert(member.clone());
        self.members.push(member);
    }

    fn contains(&self, member: &Member) -> bool {
        self.index.contains(member)
    }

    fn len(&self) -> usize {
        self.members.len()
    }
}

/// Members found by [`expand`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expansion {
    /// Members in the order they were found
    pub members: Vec<Member>,
    /// The policy's group limit stopped the expansion early
    pub limit_reached: bool,
}

enum Resolved {
    User(String),
    Group(LdapEntry),
    Unknown,
}

type Branch<'a> = Pin<Box<dyn Future<Output = Result<()>> + 'a>>;

struct Expander<'s> {
    session: &'s mut Session,
    config: Arc<DirectoryConfig>,
    names: SchemaNames,
    filters: FilterSet,
    policy: ExpansionPolicy,
    seen: SeenSet,
    members: MemberList,
    limit_reached: bool,
}

/// Expands `seed` into its members.
///
/// # Errors
///
/// Returns [`Error::NotFound`] when the seed itself does not exist (or the user is excluded
/// from group expansion) and [`Error::Unavailable`] when no server could answer the first
/// query. Failures below the seed only drop the affected branch.
pub async fn expand(
    session: &mut Session,
    seed: &ExpansionSeed,
    policy: &ExpansionPolicy,
) -> Result<Expansion> {
    session.ensure_initialized().await?;
    let config = session.config()?;
    let mut expander = Expander {
        names: SchemaNames::new(&config.attribute_map),
        filters: FilterSet::new(&config.attribute_map),
        config,
        session,
        policy: *policy,
        seen: SeenSet::new(),
        members: MemberList::default(),
        limit_reached: false,
    };

    match seed {
        ExpansionSeed::GroupMembers { group_dn } => expander.group_members(group_dn).await?,
        ExpansionSeed::UserGroups { user, primary_gid } => {
            expander.user_groups(user, *primary_gid).await?;
        }
        ExpansionSeed::Netgroup { name } => expander.netgroup(name).await?,
    }

    debug!(
        seen = expander.seen.len(),
        members = expander.members.len(),
        limit_reached = expander.limit_reached,
        "expansion finished"
    );
    Ok(Expansion {
        members: expander.members.members,
        limit_reached: expander.limit_reached,
    })
}

impl Expander<'_> {
    fn member_attributes(&self) -> [String; 4] {
        [
            self.names.uid.clone(),
            self.names.unique_member.clone(),
            self.names.member_uid.clone(),
            "objectClass".to_string(),
        ]
    }

    async fn read(&mut self, dn: &str, attributes: &[String]) -> Result<Option<LdapEntry>> {
        let attributes: Vec<&str> = attributes.iter().map(String::as_str).collect();
        read_entry(self.session, dn, &attributes).await
    }

    async fn group_members(&mut self, group_dn: &str) -> Result<()> {
        let attributes = self.member_attributes();
        let Some(entry) = self.read(group_dn, &attributes).await? else {
            return Err(Error::NotFound(format!("group {group_dn} does not exist")));
        };
        self.expand_group(entry, 0).await
    }

    fn expand_group(&mut self, entry: LdapEntry, depth: usize) -> Branch<'_> {
        Box::pin(async move {
            if depth > self.policy.max_depth {
                debug!(dn = %entry.dn, depth, "group nesting too deep, not expanding");
                return Ok(());
            }
            if !self.seen.insert(&entry.dn) {
                debug!(dn = %entry.dn, "group already expanded");
                return Ok(());
            }

            let member_dns = self.member_dns(&entry).await;
            for value in &member_dns {
                let member_dn = strip_optional_uid(value);
                match self.dn2uid(member_dn).await {
                    Ok(Resolved::User(uid)) => {
                        self.members.push(Member::User(uid));
                    }
                    Ok(Resolved::Group(group)) if self.policy.nested => {
                        if let Err(err) = self.expand_group(group, depth + 1).await {
                            debug!(dn = member_dn, "dropping nested group: {err}");
                        }
                    }
                    Ok(Resolved::Group(_)) => {
                        debug!(dn = member_dn, "nested groups not followed");
                    }
                    Ok(Resolved::Unknown) => {
                        debug!(dn = member_dn, "member has no uid");
                    }
                    Err(err) => debug!(dn = member_dn, "could not resolve member: {err}"),
                }
            }

            if let Some(uids) = entry.values(&self.names.member_uid) {
                for uid in uids {
                    self.members.push(Member::User(uid.clone()));
                }
            }
            Ok(())
        })
    }

    /// Collects member DNs, following range retrieval until the last slice.
    ///
    /// Every slice must end past the previous one; a server that does not advance ends
    /// the retrieval.
    async fn member_dns(&mut self, entry: &LdapEntry) -> Vec<String> {
        let attribute = self.names.unique_member.clone();
        let mut values: Vec<String> = entry
            .values(&attribute)
            .map(<[String]>::to_vec)
            .unwrap_or_default();

        let mut slice = owned_range(entry, &attribute);
        let mut last: Option<usize> = None;
        while let Some((high, members)) = slice.take() {
            let end = high.parse::<usize>().ok();
            if let (Some(end), Some(previous)) = (end, last) {
                if end <= previous {
                    debug!(dn = %entry.dn, end, previous, "range retrieval made no progress");
                    break;
                }
            }
            values.extend(members);

            let Some(end) = end else {
                break;
            };
            last = Some(end);
            let next = [format!("{attribute};range={}-*", end + 1)];
            match self.read(&entry.dn, &next).await {
                Ok(Some(found)) => slice = owned_range(&found, &attribute),
                Ok(None) => {}
                Err(err) => debug!(dn = %entry.dn, "range retrieval stopped: {err}"),
            }
        }

        values
    }

    async fn dn2uid(&mut self, dn: &str) -> Result<Resolved> {
        if let Some(uid) = self.session.cached_uid(dn) {
            return Ok(Resolved::User(uid.to_string()));
        }

        let attributes = self.member_attributes();
        let Some(entry) = self.read(dn, &attributes).await? else {
            return Ok(Resolved::Unknown);
        };
        if entry.has_object_class(&self.names.posix_group) {
            return Ok(Resolved::Group(entry));
        }

        match entry.first(&self.names.uid) {
            Some(uid) => {
                self.session.cache_uid(dn, uid);
                Ok(Resolved::User(uid.to_string()))
            }
            None => Ok(Resolved::Unknown),
        }
    }

    async fn user_groups(&mut self, user: &str, primary_gid: Option<u32>) -> Result<()> {
        if self.config.ignores_initgroups_user(user) {
            return Err(Error::NotFound(format!(
                "group membership of {user} is not expanded"
            )));
        }

        let request = match self.policy.direction {
            Direction::Backlink => LookupRequest::new(
                MapSelector::Passwd,
                self.filters.groups_by_member_or_user.as_str(),
            )
            .with_args(QueryArgs::StringAndString(user.to_string(), user.to_string()))
            .with_attributes([
                self.names.gid_number.as_str(),
                self.names.member_of.as_str(),
            ]),
            Direction::Forward => {
                let user_dn = if self.config.flags.rfc2307bis {
                    self.user_dn(user).await?
                } else {
                    None
                };
                let request = match user_dn {
                    Some(dn) => LookupRequest::new(
                        MapSelector::Group,
                        self.filters.groups_by_member_and_dn.as_str(),
                    )
                    .with_args(QueryArgs::StringAndString(user.to_string(), dn)),
                    None => LookupRequest::new(
                        MapSelector::Group,
                        self.filters.groups_by_member.as_str(),
                    )
                    .with_args(QueryArgs::string(user)),
                };
                request.with_attributes([self.names.gid_number.as_str()])
            }
        };

        let mut ctx = EnumerationContext::new();
        let outcome = self.collect_stream(&mut ctx, request, primary_gid).await;
        enumerate_end(self.session, &mut ctx).await;
        outcome
    }

    async fn collect_stream(
        &mut self,
        ctx: &mut EnumerationContext,
        request: LookupRequest,
        primary_gid: Option<u32>,
    ) -> Result<()> {
        match enumerate_start(self.session, ctx, request).await {
            Ok(()) => {}
            Err(Error::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        }
        while let Some(entry) = next_entry(self.session, ctx).await? {
            if let Err(err) = self.collect_group(entry, primary_gid, 0).await {
                debug!("dropping group branch: {err}");
            }
            if self.limit_reached {
                debug!(limit = ?self.policy.limit, "group limit reached");
                break;
            }
        }
        Ok(())
    }

    fn add_group(&mut self, gid: u32) {
        let member = Member::GroupId(gid);
        if self.members.contains(&member) {
            return;
        }
        if self.policy.limit.is_some_and(|limit| self.members.len() >= limit) {
            self.limit_reached = true;
            return;
        }
        self.members.push(member);
    }

    async fn user_dn(&mut self, user: &str) -> Result<Option<String>> {
        let request = LookupRequest::new(MapSelector::Passwd, self.filters.user_by_name.as_str())
            .with_args(QueryArgs::string(user))
            .with_attributes([self.names.uid.as_str()])
            .with_size_limit(1);
        let entries = search_sync(self.session, &request).await?;
        Ok(entries.into_iter().next().map(|entry| entry.dn))
    }

    /// Adds the gid of a group and chases the groups it belongs to.
    fn collect_group(
        &mut self,
        entry: LdapEntry,
        primary_gid: Option<u32>,
        depth: usize,
    ) -> Branch<'_> {
        Box::pin(async move {
            if self.limit_reached {
                return Ok(());
            }
            match entry
                .first(&self.names.gid_number)
                .and_then(|gid| gid.trim().parse::<u32>().ok())
            {
                Some(gid) if Some(gid) == primary_gid => {}
                Some(gid) => self.add_group(gid),
                None => debug!(dn = %entry.dn, "group has no usable gid"),
            }

            if !(self.policy.nested && self.config.flags.rfc2307bis) {
                return Ok(());
            }
            match self.policy.direction {
                Direction::Backlink => {
                    let parents = entry
                        .values(&self.names.member_of)
                        .map(<[String]>::to_vec)
                        .unwrap_or_default();
                    self.chase_backlinks(parents, primary_gid, depth + 1).await
                }
                Direction::Forward => self.chase_forward(entry.dn, primary_gid, depth + 1).await,
            }
        })
    }

    async fn chase_forward(
        &mut self,
        group_dn: String,
        primary_gid: Option<u32>,
        depth: usize,
    ) -> Result<()> {
        if depth > self.policy.max_depth || !self.seen.insert(&group_dn) {
            return Ok(());
        }

        let request = LookupRequest::new(MapSelector::Group, self.filters.groups_by_dn.as_str())
            .with_args(QueryArgs::String(group_dn))
            .with_attributes([self.names.gid_number.as_str()]);
        for entry in search_sync(self.session, &request).await? {
            if let Err(err) = self.collect_group(entry, primary_gid, depth).await {
                debug!("dropping nested group branch: {err}");
            }
        }
        Ok(())
    }

    async fn chase_backlinks(
        &mut self,
        parents: Vec<String>,
        primary_gid: Option<u32>,
        depth: usize,
    ) -> Result<()> {
        if depth > self.policy.max_depth {
            return Ok(());
        }
        let fresh: Vec<String> = parents
            .into_iter()
            .filter(|dn| self.seen.insert(dn))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        let request = LookupRequest::new(MapSelector::Group, self.filters.backlink.as_str())
            .with_args(QueryArgs::StringListOr(fresh))
            .with_attributes([
                self.names.gid_number.as_str(),
                self.names.member_of.as_str(),
            ]);
        for entry in search_sync(self.session, &request).await? {
            if let Err(err) = self.collect_group(entry, primary_gid, depth).await {
                debug!("dropping backlinked group branch: {err}");
            }
        }
        Ok(())
    }

    async fn netgroup(&mut self, name: &str) -> Result<()> {
        let Some(entry) = self.find_netgroup(name).await? else {
            return Err(Error::NotFound(format!("netgroup {name} does not exist")));
        };
        self.expand_netgroup(name.to_string(), Some(entry), 0).await
    }

    async fn find_netgroup(&mut self, name: &str) -> Result<Option<LdapEntry>> {
        let request =
            LookupRequest::new(MapSelector::Netgroup, self.filters.netgroup_by_name.as_str())
                .with_args(QueryArgs::string(name))
                .with_attributes([
                    self.names.member_nis_netgroup.as_str(),
                    self.names.nis_netgroup_triple.as_str(),
                ]);
        Ok(search_sync(self.session, &request).await?.into_iter().next())
    }

    fn expand_netgroup(
        &mut self,
        name: String,
        entry: Option<LdapEntry>,
        depth: usize,
    ) -> Branch<'_> {
        Box::pin(async move {
            if depth > self.policy.max_depth {
                debug!(netgroup = %name, depth, "netgroup nesting too deep, not expanding");
                return Ok(());
            }
            if !self.seen.insert(&name) {
                return Ok(());
            }

            let entry = match entry {
                Some(entry) => entry,
                None => match self.find_netgroup(&name).await? {
                    Some(entry) => entry,
                    None => {
                        debug!(netgroup = %name, "nested netgroup does not exist");
                        return Ok(());
                    }
                },
            };

            let nested = entry.values(&self.names.member_nis_netgroup).unwrap_or_default();
            let triples = entry.values(&self.names.nis_netgroup_triple).unwrap_or_default();
            let cursor = NetgroupCursor::new(nested.iter().chain(triples).map(String::as_str));

            for member in cursor {
                match member {
                    NetgroupMember::Triple(triple) => {
                        self.members.push(Member::Triple(triple));
                    }
                    NetgroupMember::Group(child) if self.policy.nested => {
                        if let Err(err) = self.expand_netgroup(child.clone(), None, depth + 1).await
                        {
                            debug!(netgroup = %child, "dropping nested netgroup: {err}");
                        }
                    }
                    NetgroupMember::Group(child) => {
                        debug!(netgroup = %child, "nested netgroups not followed");
                    }
                }
            }
            Ok(())
        })
    }
}

fn owned_range(entry: &LdapEntry, attribute: &str) -> Option<(String, Vec<String>)> {
    entry
        .ranged_values(attribute)
        .map(|(high, values)| (high.to_string(), values.to_vec()))
}
