//! Bind credentials.
//!
//! Passwords are held as [`SecretString`] so they never appear in `Debug` output or in
//! serialized configuration.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};

/// Identity used to bind to the directory.
///
/// Both fields are optional; with no DN the session binds anonymously.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BindCredentials {
    /// Bind distinguished name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_dn: Option<String>,

    /// Bind password
    #[serde(default, skip_serializing, deserialize_with = "deserialize_secret")]
    pub bind_password: Option<SecretString>,
}

impl BindCredentials {
    /// Create credentials for a simple bind.
    ///
    /// # Arguments
    ///
    /// * `bind_dn` - The DN to bind as
    /// * `bind_password` - The password for that DN
    #[must_use]
    pub fn new(bind_dn: impl Into<String>, bind_password: impl Into<String>) -> Self {
        Self {
            bind_dn: Some(bind_dn.into()),
            bind_password: Some(SecretString::from(bind_password.into())),
        }
    }

    /// Credentials for an anonymous bind.
    #[must_use]
    pub const fn anonymous() -> Self {
        Self {
            bind_dn: None,
            bind_password: None,
        }
    }

    /// Get the bind DN, empty for anonymous binds.
    #[must_use]
    pub fn bind_dn(&self) -> &str {
        self.bind_dn.as_deref().unwrap_or("")
    }

    /// Get the bind password, empty when none is configured.
    #[must_use]
    pub fn bind_password(&self) -> &str {
        self.bind_password
            .as_ref()
            .map_or("", |secret| secret.expose_secret())
    }

    /// Returns true when no bind DN is configured.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.bind_dn.as_deref().map_or(true, str::is_empty)
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}
