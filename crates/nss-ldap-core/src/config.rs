//! Directory engine configuration.
//!
//! This module provides the immutable-after-load configuration value consumed by the session
//! manager, along with the [`ConfigSource`] seam used to load it and revalidate it by
//! modification time.

use crate::credentials::BindCredentials;
use crate::retry::ReconnectPolicy;
use crate::types::{DerefPolicy, MapSelector, SearchScope, TlsMode};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;
use url::Url;
use validator::{Validate, ValidationError};

/// Maximum number of server URIs.
pub const MAX_URIS: usize = 31;

/// Default page size for paged result enumeration.
pub const DEFAULT_PAGE_SIZE: u32 = 1000;

/// Default bind time limit in seconds.
pub const DEFAULT_BIND_TIME_LIMIT_SECS: u64 = 30;

/// Configuration for the directory engine.
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct DirectoryConfig {
    /// Server URIs tried in order (`ldap://`, `ldaps://` or `ldapi://`)
    #[validate(length(min = 1, max = 31), custom(function = "validate_uris"))]
    pub uris: Vec<String>,

    /// Default search base
    #[validate(length(min = 1))]
    pub base: String,

    /// Default search scope
    #[serde(default)]
    pub scope: SearchScope,

    /// Alias dereferencing policy
    #[serde(default)]
    pub deref: DerefPolicy,

    /// Credentials for unprivileged callers
    #[serde(default)]
    pub credentials: BindCredentials,

    /// Credentials used when the caller runs with effective uid 0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_credentials: Option<BindCredentials>,

    /// Protocol version
    #[validate(range(min = 2, max = 3))]
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u8,

    /// Search time limit in seconds (0 = no limit)
    #[serde(default)]
    pub time_limit_secs: u64,

    /// Connect and bind time limit in seconds (0 = no limit)
    #[serde(default = "default_bind_time_limit_secs")]
    pub bind_time_limit_secs: u64,

    /// Idle time after which a connection is closed (0 = never)
    #[serde(default)]
    pub idle_time_limit_secs: u64,

    /// Transport security settings
    #[serde(default)]
    pub tls: TlsConfig,

    /// Reconnect policy
    #[validate(nested)]
    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    /// Page size for paged result enumeration
    #[validate(range(min = 1, max = 100_000))]
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Behaviour flags
    #[serde(default)]
    pub flags: ConfigFlags,

    /// Per-selector chains of search base overrides
    #[serde(default)]
    pub search_descriptors: HashMap<MapSelector, Vec<SearchDescriptor>>,

    /// Logical to directory attribute name mapping
    #[serde(default)]
    pub attribute_map: AttributeMap,

    /// Administrator literals that replace directory values
    #[serde(default)]
    pub attribute_overrides: AttributeValues,

    /// Administrator literals used when the directory has no value
    #[serde(default)]
    pub attribute_defaults: AttributeValues,

    /// Users for whom group membership is never expanded
    #[serde(default)]
    pub initgroups_ignore_users: Vec<String>,
}

const fn default_protocol_version() -> u8 {
    3
}

const fn default_bind_time_limit_secs() -> u64 {
    DEFAULT_BIND_TIME_LIMIT_SECS
}

const fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn validate_uris(uris: &Vec<String>) -> std::result::Result<(), ValidationError> {
    for uri in uris {
        let scheme_ok = Url::parse(uri)
            .map(|url| matches!(url.scheme(), "ldap" | "ldaps" | "ldapi"))
            .unwrap_or(false);
        if !scheme_ok {
            let mut error = ValidationError::new("uri");
            error.message = Some(format!("unsupported directory URI `{uri}`").into());
            return Err(error);
        }
    }
    Ok(())
}

impl DirectoryConfig {
    /// Create a configuration with required parameters.
    ///
    /// # Arguments
    ///
    /// * `uris` - Server URIs, tried in order
    /// * `base` - Default search base
    ///
    /// # Errors
    ///
    /// Returns an error if the URIs or base fail validation.
    pub fn new<I, S>(uris: I, base: impl Into<String>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let config = Self {
            uris: uris.into_iter().map(Into::into).collect(),
            base: base.into(),
            scope: SearchScope::default(),
            deref: DerefPolicy::default(),
            credentials: BindCredentials::anonymous(),
            root_credentials: None,
            protocol_version: default_protocol_version(),
            time_limit_secs: 0,
            bind_time_limit_secs: default_bind_time_limit_secs(),
            idle_time_limit_secs: 0,
            tls: TlsConfig::default(),
            reconnect: ReconnectPolicy::default(),
            page_size: default_page_size(),
            flags: ConfigFlags::default(),
            search_descriptors: HashMap::new(),
            attribute_map: AttributeMap::default(),
            attribute_overrides: AttributeValues::default(),
            attribute_defaults: AttributeValues::default(),
            initgroups_ignore_users: Vec::new(),
        };

        config.validated()
    }

    /// Parse and validate a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails validation.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validated()
    }

    /// Run validation, consuming and returning the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] describing the first failing field.
    pub fn validated(self) -> Result<Self> {
        self.validate()
            .map_err(|e| Error::ConfigError(format!("Invalid configuration: {e}")))?;
        Ok(self)
    }

    /// Set the unprivileged bind identity.
    #[must_use]
    pub fn with_credentials(mut self, credentials: BindCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the identity used for root callers.
    #[must_use]
    pub fn with_root_credentials(mut self, credentials: BindCredentials) -> Self {
        self.root_credentials = Some(credentials);
        self
    }

    /// Set the reconnect policy.
    #[must_use]
    pub const fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set transport security.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Set behaviour flags.
    #[must_use]
    pub const fn with_flags(mut self, flags: ConfigFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the idle time limit in seconds.
    #[must_use]
    pub const fn with_idle_time_limit_secs(mut self, seconds: u64) -> Self {
        self.idle_time_limit_secs = seconds;
        self
    }

    /// Set the search time limit in seconds.
    #[must_use]
    pub const fn with_time_limit_secs(mut self, seconds: u64) -> Self {
        self.time_limit_secs = seconds;
        self
    }

    /// Set the page size.
    #[must_use]
    pub const fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = size;
        self
    }

    /// Set the protocol version.
    #[must_use]
    pub const fn with_protocol_version(mut self, version: u8) -> Self {
        self.protocol_version = version;
        self
    }

    /// Append a search descriptor to the selector's chain.
    #[must_use]
    pub fn with_search_descriptor(
        mut self,
        selector: MapSelector,
        descriptor: SearchDescriptor,
    ) -> Self {
        self.search_descriptors
            .entry(selector)
            .or_default()
            .push(descriptor);
        self
    }

    /// Set the attribute name mapping.
    #[must_use]
    pub fn with_attribute_map(mut self, map: AttributeMap) -> Self {
        self.attribute_map = map;
        self
    }

    /// Add a user excluded from group membership expansion.
    #[must_use]
    pub fn with_initgroups_ignore_user(mut self, user: impl Into<String>) -> Self {
        self.initgroups_ignore_users.push(user.into());
        self
    }

    /// Search time limit, if any.
    #[must_use]
    pub const fn time_limit(&self) -> Option<Duration> {
        non_zero_secs(self.time_limit_secs)
    }

    /// Connect and bind time limit, if any.
    #[must_use]
    pub const fn bind_time_limit(&self) -> Option<Duration> {
        non_zero_secs(self.bind_time_limit_secs)
    }

    /// Idle time limit, if any.
    #[must_use]
    pub const fn idle_time_limit(&self) -> Option<Duration> {
        non_zero_secs(self.idle_time_limit_secs)
    }

    /// Search descriptors configured for the selector, in chain order.
    #[must_use]
    pub fn descriptors(&self, selector: MapSelector) -> &[SearchDescriptor] {
        if selector == MapSelector::None {
            return &[];
        }
        self.search_descriptors
            .get(&selector)
            .map_or(&[], Vec::as_slice)
    }

    /// Resolves a descriptor base; a trailing `,` makes it relative to the default base.
    #[must_use]
    pub fn resolve_base(&self, descriptor_base: &str) -> String {
        if descriptor_base.ends_with(',') {
            format!("{descriptor_base}{}", self.base)
        } else {
            descriptor_base.to_string()
        }
    }

    /// Picks the bind identity for the caller's effective uid.
    #[must_use]
    pub fn credentials_for(&self, effective_uid: u32) -> &BindCredentials {
        match (&self.root_credentials, effective_uid) {
            (Some(root), 0) => root,
            _ => &self.credentials,
        }
    }

    /// Returns true when the user's group memberships must not be expanded.
    #[must_use]
    pub fn ignores_initgroups_user(&self, user: &str) -> bool {
        self.initgroups_ignore_users.iter().any(|name| name == user)
    }
}

const fn non_zero_secs(seconds: u64) -> Option<Duration> {
    if seconds == 0 {
        None
    } else {
        Some(Duration::from_secs(seconds))
    }
}

/// Transport security settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// How TLS is established
    #[serde(default)]
    pub mode: TlsMode,

    /// Whether to verify the server certificate
    #[serde(default = "default_verify_peer")]
    pub verify_peer: bool,

    /// Optional path to a PEM CA certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_file: Option<PathBuf>,
}

const fn default_verify_peer() -> bool {
    true
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            mode: TlsMode::default(),
            verify_peer: default_verify_peer(),
            ca_cert_file: None,
        }
    }
}

impl TlsConfig {
    /// TLS settings for the given mode with peer verification on.
    #[must_use]
    pub fn new(mode: TlsMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Enable or disable certificate verification.
    #[must_use]
    pub const fn with_verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    /// Set the CA certificate path.
    #[must_use]
    pub fn with_ca_cert_file(mut self, path: PathBuf) -> Self {
        self.ca_cert_file = Some(path);
        self
    }
}

/// Behaviour flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFlags {
    /// Request results in pages during enumeration
    #[serde(default)]
    pub paged_results: bool,

    /// Directory uses RFC 2307bis nested groups
    #[serde(default)]
    pub rfc2307bis: bool,

    /// Resolve group membership through the member's `memberOf` backlinks
    #[serde(default)]
    pub initgroups_backlink: bool,

    /// Close the connection when each enumeration ends
    #[serde(default)]
    pub connect_policy_oneshot: bool,
}

/// Per-selector override of search base, scope and filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchDescriptor {
    /// Search base; a trailing `,` appends the default base
    pub base: String,

    /// Scope override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<SearchScope>,

    /// Filter intersected with the query filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl SearchDescriptor {
    /// Descriptor that only overrides the base.
    #[must_use]
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            scope: None,
            filter: None,
        }
    }

    /// Set the scope override.
    #[must_use]
    pub const fn with_scope(mut self, scope: SearchScope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Set the filter intersected with every query.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// Mapping from logical attribute names to directory attribute names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeMap {
    entries: HashMap<MapSelector, HashMap<String, String>>,
}

impl AttributeMap {
    /// Adds a mapping for one selector.
    #[must_use]
    pub fn with_mapping(
        mut self,
        selector: MapSelector,
        logical: impl Into<String>,
        directory: impl Into<String>,
    ) -> Self {
        self.entries
            .entry(selector)
            .or_default()
            .insert(logical.into(), directory.into());
        self
    }

    /// Returns the directory attribute name for a logical name.
    ///
    /// Selector-specific mappings win over mappings registered for [`MapSelector::None`];
    /// unmapped names pass through unchanged.
    #[must_use]
    pub fn map<'a>(&'a self, selector: MapSelector, logical: &'a str) -> &'a str {
        self.lookup(selector, logical)
            .or_else(|| self.lookup(MapSelector::None, logical))
            .unwrap_or(logical)
    }

    fn lookup(&self, selector: MapSelector, logical: &str) -> Option<&str> {
        self.entries
            .get(&selector)
            .and_then(|names| names.get(logical))
            .map(String::as_str)
    }
}

/// Administrator-supplied literal values keyed by selector and attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeValues {
    entries: HashMap<MapSelector, HashMap<String, String>>,
}

impl AttributeValues {
    /// Adds a literal for one attribute.
    #[must_use]
    pub fn with_value(
        mut self,
        selector: MapSelector,
        attribute: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.entries
            .entry(selector)
            .or_default()
            .insert(attribute.into(), value.into());
        self
    }

    /// Returns the literal for an attribute, if configured.
    #[must_use]
    pub fn get(&self, selector: MapSelector, attribute: &str) -> Option<&str> {
        self.entries
            .get(&selector)
            .and_then(|values| values.get(attribute))
            .map(String::as_str)
    }
}

/// Source of the engine configuration.
///
/// The session manager calls [`ConfigSource::modified`] on every acquisition and reloads
/// when the value changes.
#[cfg_attr(test, mockall::automock)]
pub trait ConfigSource: Send + Sync {
    /// Loads and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be read or is invalid.
    fn load(&self) -> Result<Arc<DirectoryConfig>>;

    /// Last modification time, or `None` when the source never changes.
    fn modified(&self) -> Option<SystemTime>;
}

/// Configuration read from a JSON file.
#[derive(Debug, Clone)]
pub struct JsonConfigFile {
    path: PathBuf,
}

impl JsonConfigFile {
    /// Creates a source for the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the configuration file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for JsonConfigFile {
    fn load(&self) -> Result<Arc<DirectoryConfig>> {
        let contents = std::fs::read_to_string(&self.path).map_err(|err| {
            Error::ConfigError(format!(
                "failed to read configuration {}: {err}",
                self.path.display()
            ))
        })?;
        let config = DirectoryConfig::from_json_str(&contents)?;

        if let Some(modified) = self.modified() {
            let stamp: DateTime<Utc> = modified.into();
            debug!(
                path = %self.path.display(),
                modified = %stamp.to_rfc3339(),
                "loaded directory configuration"
            );
        }

        Ok(Arc::new(config))
    }

    fn modified(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path)
            .and_then(|metadata| metadata.modified())
            .ok()
    }
}

/// Configuration supplied directly by the embedding program.
#[derive(Debug, Clone)]
pub struct StaticConfig {
    config: Arc<DirectoryConfig>,
}

impl StaticConfig {
    /// Wraps an already validated configuration.
    #[must_use]
    pub fn new(config: DirectoryConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl ConfigSource for StaticConfig {
    fn load(&self) -> Result<Arc<DirectoryConfig>> {
        Ok(Arc::clone(&self.config))
    }

    fn modified(&self) -> Option<SystemTime> {
        None
    }
}
