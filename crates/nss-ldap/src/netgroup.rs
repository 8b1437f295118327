//! Netgroup member tokens.
//!
//! A netgroup entry lists nested netgroup names and `(host,user,domain)` triples. The values
//! of both attributes are joined with spaces and read back one token at a time.

use crate::Result;
use nss_ldap_core::Error;

/// One `(host,user,domain)` triple. An empty field matches anything.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetgroupTriple {
    /// Host field
    pub host: Option<String>,
    /// User field
    pub user: Option<String>,
    /// Domain field
    pub domain: Option<String>,
}

impl NetgroupTriple {
    /// Builds a triple; empty or whitespace-only fields become wildcards.
    #[must_use]
    pub fn new(host: &str, user: &str, domain: &str) -> Self {
        Self {
            host: field(host),
            user: field(user),
            domain: field(domain),
        }
    }
}

fn field(raw: &str) -> Option<String> {
    raw.split_whitespace().next().map(str::to_string)
}

/// A token of a netgroup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetgroupMember {
    /// Name of a nested netgroup
    Group(String),
    /// A member triple
    Triple(NetgroupTriple),
}

/// Reads the tokens of one netgroup entry.
#[derive(Debug, Clone)]
pub struct NetgroupCursor {
    data: Option<String>,
    position: usize,
    first: bool,
}

impl NetgroupCursor {
    /// Cursor over the values of a netgroup entry, nested names first.
    #[must_use]
    pub fn new<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let joined = values
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            data: (!joined.is_empty()).then_some(joined),
            position: 0,
            first: true,
        }
    }

    /// Cursor for a netgroup that does not exist.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            data: None,
            position: 0,
            first: true,
        }
    }

    /// Reads the next token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndOfEnumeration`] when the netgroup is empty or exhausted, or when a
    /// malformed triple follows a valid token. A malformed first token is
    /// [`Error::NotFound`].
    pub fn next_member(&mut self) -> Result<NetgroupMember> {
        let Some(data) = self.data.as_deref() else {
            return Err(Error::EndOfEnumeration);
        };
        let rest = &data[self.position..];
        let skipped = rest.len() - rest.trim_start().len();
        let rest = &rest[skipped..];
        let start = self.position + skipped;

        if !rest.starts_with('(') {
            let len = rest.find(char::is_whitespace).unwrap_or(rest.len());
            if len == 0 {
                return Err(self.malformed());
            }
            self.position = start + len;
            self.first = false;
            return Ok(NetgroupMember::Group(rest[..len].to_string()));
        }

        let Some(close) = rest.find(')') else {
            return Err(self.malformed());
        };
        let mut fields = rest[1..close].splitn(3, ',');
        let (Some(host), Some(user), Some(domain)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(self.malformed());
        };

        let triple = NetgroupTriple::new(host, user, domain);
        self.position = start + close + 1;
        self.first = false;
        Ok(NetgroupMember::Triple(triple))
    }

    fn malformed(&mut self) -> Error {
        let first = self.first;
        self.data = None;
        if first {
            Error::NotFound("malformed netgroup".to_string())
        } else {
            Error::EndOfEnumeration
        }
    }
}

impl Iterator for NetgroupCursor {
    type Item = NetgroupMember;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_member().ok()
    }
}
