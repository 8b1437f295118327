//! Core name-service domain types.
//!
//! This module provides the map selectors that name each record type together with the
//! search scope, alias dereferencing and transport security enumerations used by the
//! configuration.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Default port for plain and StartTLS connections
pub const DEFAULT_LDAP_PORT: u16 = 389;
/// Default port for LDAPS
pub const DEFAULT_LDAPS_PORT: u16 = 636;

/// Logical record type being queried.
///
/// The selector picks attribute-name mappings and per-type search descriptors. `None` means
/// no per-type override applies, which is also what an explicit base override selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapSelector {
    /// User accounts
    Passwd,
    /// Shadow password data
    Shadow,
    /// Groups
    Group,
    /// IP hosts
    Hosts,
    /// IP services
    Services,
    /// IP networks
    Networks,
    /// IP protocols
    Protocols,
    /// ONC RPC programs
    Rpc,
    /// Ethernet addresses
    Ethers,
    /// Network masks
    Netmasks,
    /// Boot parameters
    Bootparams,
    /// Mail aliases
    Aliases,
    /// Netgroups
    Netgroup,
    /// Automount maps
    Automount,
    /// No per-type mapping
    None,
}

impl MapSelector {
    /// Returns the selector name as used in configuration.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Passwd => "passwd",
            Self::Shadow => "shadow",
            Self::Group => "group",
            Self::Hosts => "hosts",
            Self::Services => "services",
            Self::Networks => "networks",
            Self::Protocols => "protocols",
            Self::Rpc => "rpc",
            Self::Ethers => "ethers",
            Self::Netmasks => "netmasks",
            Self::Bootparams => "bootparams",
            Self::Aliases => "aliases",
            Self::Netgroup => "netgroup",
            Self::Automount => "automount",
            Self::None => "none",
        }
    }

    /// Returns every selector that can carry search descriptors.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Passwd,
            Self::Shadow,
            Self::Group,
            Self::Hosts,
            Self::Services,
            Self::Networks,
            Self::Protocols,
            Self::Rpc,
            Self::Ethers,
            Self::Netmasks,
            Self::Bootparams,
            Self::Aliases,
            Self::Netgroup,
            Self::Automount,
        ]
    }
}

impl FromStr for MapSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "passwd" => Ok(Self::Passwd),
            "shadow" => Ok(Self::Shadow),
            "group" => Ok(Self::Group),
            "hosts" => Ok(Self::Hosts),
            "services" => Ok(Self::Services),
            "networks" => Ok(Self::Networks),
            "protocols" => Ok(Self::Protocols),
            "rpc" => Ok(Self::Rpc),
            "ethers" => Ok(Self::Ethers),
            "netmasks" => Ok(Self::Netmasks),
            "bootparams" => Ok(Self::Bootparams),
            "aliases" => Ok(Self::Aliases),
            "netgroup" => Ok(Self::Netgroup),
            "automount" => Ok(Self::Automount),
            "none" => Ok(Self::None),
            _ => Err(Error::InvalidRequest(format!("Unknown map selector: {s}"))),
        }
    }
}

impl std::fmt::Display for MapSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Search scope for directory queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchScope {
    /// Base object only.
    Base,
    /// One level below the base.
    #[serde(alias = "one")]
    OneLevel,
    /// Entire subtree.
    #[default]
    #[serde(alias = "sub")]
    Subtree,
}

/// Alias dereferencing policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DerefPolicy {
    /// Never dereference aliases.
    #[default]
    Never,
    /// Dereference while searching below the base.
    Searching,
    /// Dereference when locating the base.
    Finding,
    /// Always dereference.
    Always,
}

/// Transport security mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// Plain connection.
    #[default]
    Off,
    /// TLS from the first byte (`ldaps://`).
    Ldaps,
    /// Upgrade a plain connection with the StartTLS extended operation.
    StartTls,
}
