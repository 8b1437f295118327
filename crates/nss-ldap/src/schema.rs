//! Engine-internal filters and attribute names.
//!
//! Group and netgroup expansion issue their own searches. The names they use go through the
//! configured attribute map so that directories with a different schema work unchanged.

use nss_ldap_core::config::AttributeMap;
use nss_ldap_core::types::MapSelector;

/// Attribute and object class names used by expansion, after mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaNames {
    /// User login attribute
    pub uid: String,
    /// Group member DN attribute
    pub unique_member: String,
    /// Group member login attribute
    pub member_uid: String,
    /// Numeric group id attribute
    pub gid_number: String,
    /// Backlink from a member to its groups
    pub member_of: String,
    /// Nested netgroup attribute
    pub member_nis_netgroup: String,
    /// Netgroup triple attribute
    pub nis_netgroup_triple: String,
    /// Common name attribute
    pub cn: String,
    /// Object class of groups
    pub posix_group: String,
}

impl SchemaNames {
    /// Resolves every name through `map`.
    #[must_use]
    pub fn new(map: &AttributeMap) -> Self {
        Self {
            uid: map.map(MapSelector::Passwd, "uid").to_string(),
            unique_member: map.map(MapSelector::Group, "uniqueMember").to_string(),
            member_uid: map.map(MapSelector::Group, "memberUid").to_string(),
            gid_number: map.map(MapSelector::Group, "gidNumber").to_string(),
            member_of: map.map(MapSelector::Passwd, "memberOf").to_string(),
            member_nis_netgroup: map.map(MapSelector::Netgroup, "memberNisNetgroup").to_string(),
            nis_netgroup_triple: map.map(MapSelector::Netgroup, "nisNetgroupTriple").to_string(),
            cn: map.map(MapSelector::Netgroup, "cn").to_string(),
            posix_group: map.map(MapSelector::Group, "posixGroup").to_string(),
        }
    }
}

/// Filter templates used by expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSet {
    /// User by login (`%s` = login)
    pub user_by_name: String,
    /// Groups listing a login (`%s` = login)
    pub groups_by_member: String,
    /// Groups listing a login or a DN (`%s` = login, `%s` = DN)
    pub groups_by_member_and_dn: String,
    /// Groups listing a DN (`%s` = DN)
    pub groups_by_dn: String,
    /// Groups listing a login, or the user entry itself (`%s` = login twice)
    pub groups_by_member_or_user: String,
    /// Entry by DN, used with an OR list of DNs
    pub backlink: String,
    /// Netgroup by name (`%s` = name)
    pub netgroup_by_name: String,
}

impl FilterSet {
    /// Renders the templates with names resolved through `map`.
    #[must_use]
    pub fn new(map: &AttributeMap) -> Self {
        let passwd = |name| map.map(MapSelector::Passwd, name);
        let group = |name| map.map(MapSelector::Group, name);
        let netgroup = |name| map.map(MapSelector::Netgroup, name);

        let (object_class, posix_account, uid) = (
            passwd("objectClass"),
            passwd("posixAccount"),
            passwd("uid"),
        );
        let (posix_group, member_uid, unique_member) = (
            group("posixGroup"),
            group("memberUid"),
            group("uniqueMember"),
        );

        Self {
            user_by_name: format!("(&({object_class}={posix_account})({uid}=%s))"),
            groups_by_member: format!("(&({object_class}={posix_group})({member_uid}=%s))"),
            groups_by_member_and_dn: format!(
                "(&({object_class}={posix_group})(|({member_uid}=%s)({unique_member}=%s)))"
            ),
            groups_by_dn: format!("(&({object_class}={posix_group})({unique_member}=%s))"),
            groups_by_member_or_user: format!(
                "(|(&({object_class}={posix_group})({member_uid}=%s))\
                 (&({object_class}={posix_account})({uid}=%s)))"
            ),
            backlink: format!("({}=%s)", passwd("distinguishedName")),
            netgroup_by_name: format!(
                "(&({object_class}={})({}=%s))",
                netgroup("nisNetgroup"),
                netgroup("cn")
            ),
        }
    }
}
