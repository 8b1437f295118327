//! Result marshaling primitives.
//!
//! Record parsers build host records out of these. Every primitive writes only into the
//! arena and either succeeds or leaves the arena's used counter where it was.

use crate::dn::DistinguishedName;
use crate::entry::LdapEntry;
use crate::Result;
use nss_ldap_core::arena::{ArenaStr, ArenaVec, BufferArena};
use nss_ldap_core::Error;

/// Copies a literal value.
///
/// # Errors
///
/// Returns [`Error::BufferTooSmall`] when the value does not fit.
pub fn assign_value(arena: &mut BufferArena<'_>, value: &str) -> Result<ArenaStr> {
    arena.push_str(value)
}

/// Copies the first value of `attribute`.
///
/// # Errors
///
/// Returns [`Error::NotFound`] when the entry lacks the attribute, or
/// [`Error::BufferTooSmall`] when the value does not fit.
pub fn assign_attr_value(
    arena: &mut BufferArena<'_>,
    entry: &LdapEntry,
    attribute: &str,
) -> Result<ArenaStr> {
    let value = entry.first(attribute).ok_or_else(|| missing(entry, attribute))?;
    arena.push_str(value)
}

/// Copies every value of `attribute` into a NULL-terminated pointer vector.
///
/// Values equal to `omit` are left out; the vector length is the number stored. An absent
/// attribute yields an empty vector.
///
/// # Errors
///
/// Returns [`Error::BufferTooSmall`] when the vector does not fit.
pub fn assign_attr_values(
    arena: &mut BufferArena<'_>,
    entry: &LdapEntry,
    attribute: &str,
    omit: Option<&str>,
) -> Result<ArenaVec> {
    let values = entry.values(attribute).unwrap_or_default();
    arena.push_str_vec(values, omit)
}

/// Copies `attribute`, honouring an administrator override and default.
///
/// The override is used whatever the entry holds; the default only when the attribute is
/// absent.
///
/// # Errors
///
/// Returns [`Error::NotFound`] when neither the entry nor a default supplies a value, or
/// [`Error::BufferTooSmall`] when the value does not fit.
pub fn assign_attr_value_with_fallback(
    arena: &mut BufferArena<'_>,
    entry: &LdapEntry,
    attribute: &str,
    override_value: Option<&str>,
    default_value: Option<&str>,
) -> Result<ArenaStr> {
    let value = override_value
        .or_else(|| entry.first(attribute))
        .or(default_value)
        .ok_or_else(|| missing(entry, attribute))?;
    arena.push_str(value)
}

/// Copies the canonical name of an entry.
///
/// The value of `rdn_type` in the entry's leading RDN wins; multi-valued RDNs are searched
/// for it. Otherwise the first value of `rdn_type` is used.
///
/// # Errors
///
/// Returns [`Error::NotFound`] when neither source has a value, or
/// [`Error::BufferTooSmall`] when the value does not fit.
pub fn assign_rdn_value(
    arena: &mut BufferArena<'_>,
    entry: &LdapEntry,
    rdn_type: &str,
) -> Result<ArenaStr> {
    let parsed = DistinguishedName::parse(&entry.dn).ok();
    let from_rdn = parsed
        .as_ref()
        .and_then(|dn| dn.leading_value(rdn_type));

    match from_rdn {
        Some(value) => arena.push_str(value),
        None => assign_attr_value(arena, entry, rdn_type),
    }
}

fn missing(entry: &LdapEntry, attribute: &str) -> Error {
    Error::NotFound(format!("{} has no {attribute}", entry.dn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nss_ldap_core::Status;
    use std::mem::align_of;

    fn aligned(storage: &mut [u8], len: usize) -> &mut [u8] {
        let skip = storage.as_ptr().align_offset(align_of::<usize>());
        &mut storage[skip..skip + len]
    }

    fn service() -> LdapEntry {
        LdapEntry::new("cn=ssh+ipServiceProtocol=tcp,ou=services,dc=example")
            .with_attribute("cn", ["secure-shell", "ssh"])
            .with_attribute("ipServicePort", ["22"])
    }

    #[test]
    fn assigns_first_value() {
        let mut storage = [0u8; 64];
        let mut arena = BufferArena::new(&mut storage);
        let port = assign_attr_value(&mut arena, &service(), "ipServicePort").unwrap();
        assert_eq!(arena.str_at(port), Some("22"));

        let err = assign_attr_value(&mut arena, &service(), "description").unwrap_err();
        assert_eq!(err.status(), Status::NotFound);
        assert_eq!(arena.used(), 3);
    }

    #[test]
    fn assigns_values_with_omission() {
        let mut storage = [0u8; 128];
        let buf = aligned(&mut storage, 96);
        let mut arena = BufferArena::new(buf);

        let aliases = assign_attr_values(&mut arena, &service(), "cn", Some("ssh")).unwrap();
        assert_eq!(aliases.len(), 1);
        assert_eq!(arena.strings(aliases).unwrap(), vec!["secure-shell"]);

        let none = assign_attr_values(&mut arena, &service(), "description", None).unwrap();
        assert!(none.is_empty());
        assert_eq!(arena.read_slot(none.offset()), Some(0));
    }

    #[test]
    fn vector_overflow_leaves_arena_unchanged() {
        let mut storage = [0u8; 64];
        let buf = aligned(&mut storage, 20);
        let mut arena = BufferArena::new(buf);
        assign_value(&mut arena, "x").unwrap();
        let before = arena.used();

        let err = assign_attr_values(&mut arena, &service(), "cn", None).unwrap_err();
        assert_eq!(err.status(), Status::TryAgain);
        assert_eq!(arena.used(), before);
    }

    #[test]
    fn override_beats_value_beats_default() {
        let mut storage = [0u8; 64];
        let mut arena = BufferArena::new(&mut storage);
        let entry = LdapEntry::new("uid=jdoe,dc=example").with_attribute("loginShell", ["/bin/zsh"]);

        let forced = assign_attr_value_with_fallback(
            &mut arena,
            &entry,
            "loginShell",
            Some("/bin/false"),
            Some("/bin/sh"),
        )
        .unwrap();
        assert_eq!(arena.str_at(forced), Some("/bin/false"));

        let stored =
            assign_attr_value_with_fallback(&mut arena, &entry, "loginShell", None, Some("/bin/sh"))
                .unwrap();
        assert_eq!(arena.str_at(stored), Some("/bin/zsh"));

        let defaulted =
            assign_attr_value_with_fallback(&mut arena, &entry, "gecos", None, Some("nobody"))
                .unwrap();
        assert_eq!(arena.str_at(defaulted), Some("nobody"));

        assert!(assign_attr_value_with_fallback(&mut arena, &entry, "gecos", None, None).is_err());
    }

    #[test]
    fn rdn_value_comes_from_leading_rdn() {
        let mut storage = [0u8; 64];
        let mut arena = BufferArena::new(&mut storage);

        let name = assign_rdn_value(&mut arena, &service(), "cn").unwrap();
        assert_eq!(arena.str_at(name), Some("ssh"));

        let entry = LdapEntry::new("ipHostNumber=10.0.0.1,ou=hosts,dc=example")
            .with_attribute("cn", ["web1"]);
        let fallback = assign_rdn_value(&mut arena, &entry, "cn").unwrap();
        assert_eq!(arena.str_at(fallback), Some("web1"));
    }
}
