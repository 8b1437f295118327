//! Session manager.
//!
//! A [`Session`] owns at most one connection to a directory server. Before every use it
//! detects hazards that make the connection unusable (a fork, an effective uid change across
//! root, a socket stolen by the host application, idle expiry, a changed configuration) and
//! tears the connection down accordingly. Hazard teardown never writes to the wire.

use crate::backend::{ConnectOptions, DirectoryConnection, DirectoryConnector, SocketIdentity};
use crate::environment::HostEnvironment;
use crate::Result;
use nss_ldap_core::config::{ConfigSource, DirectoryConfig};
use nss_ldap_core::types::TlsMode;
use nss_ldap_core::Error;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{debug, info, warn};

/// Member DNs remembered before the uid cache starts over.
pub const UID_CACHE_LIMIT: usize = 4096;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No configuration loaded yet.
    Uninitialized,
    /// Configuration loaded, no connection.
    Initialized,
    /// Connected and bound.
    Connected,
}

/// Per-process directory session.
pub struct Session {
    connector: Arc<dyn DirectoryConnector>,
    config_source: Arc<dyn ConfigSource>,
    environment: Arc<dyn HostEnvironment>,
    config: Option<Arc<DirectoryConfig>>,
    config_modified: Option<SystemTime>,
    connection: Option<Box<dyn DirectoryConnection>>,
    state: SessionState,
    endpoint_index: usize,
    last_activity: Option<Instant>,
    owner_pid: Option<u32>,
    bound_euid: Option<u32>,
    socket: Option<SocketIdentity>,
    generation: u64,
    fork_pending: bool,
    uid_cache: HashMap<String, String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("endpoint_index", &self.endpoint_index)
            .field("generation", &self.generation)
            .field("owner_pid", &self.owner_pid)
            .field("bound_euid", &self.bound_euid)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates an uninitialized session.
    #[must_use]
    pub fn new(
        connector: Arc<dyn DirectoryConnector>,
        config_source: Arc<dyn ConfigSource>,
        environment: Arc<dyn HostEnvironment>,
    ) -> Self {
        Self {
            connector,
            config_source,
            environment,
            config: None,
            config_modified: None,
            connection: None,
            state: SessionState::Uninitialized,
            endpoint_index: 0,
            last_activity: None,
            owner_pid: None,
            bound_euid: None,
            socket: None,
            generation: 0,
            fork_pending: false,
            uid_cache: HashMap::new(),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Index of the endpoint the next open will use.
    #[must_use]
    pub const fn endpoint_index(&self) -> usize {
        self.endpoint_index
    }

    /// Number of successful opens so far.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns true while a bound connection is held.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected && self.connection.is_some()
    }

    /// Host environment used by this session.
    #[must_use]
    pub fn environment(&self) -> &dyn HostEnvironment {
        self.environment.as_ref()
    }

    /// Loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] before the first [`Session::ensure_initialized`].
    pub fn config(&self) -> Result<Arc<DirectoryConfig>> {
        self.config
            .clone()
            .ok_or_else(|| Error::ConfigError("directory session not initialized".to_string()))
    }

    /// Borrows the bound connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] when no connection is open.
    pub fn connection(&mut self) -> Result<&mut dyn DirectoryConnection> {
        match self.connection.as_deref_mut() {
            Some(connection) if self.state == SessionState::Connected => Ok(connection),
            _ => Err(Error::Unavailable("no directory connection".to_string())),
        }
    }

    /// Loads configuration and recovers from connection hazards.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration cannot be loaded.
    pub async fn ensure_initialized(&mut self) -> Result<()> {
        if self.config.is_none() {
            self.load_config()?;
        }

        if self.connection.is_some() {
            let pid = self.environment.process_id();
            let euid = self.environment.effective_uid();

            if self.socket_stolen() {
                warn!("directory socket was reused by the application, dropping connection");
                self.forget_connection();
            } else if self.transport_closed() {
                warn!("directory transport closed underneath the session, dropping connection");
                self.forget_connection();
            } else if self.inherited(pid) {
                debug!(pid, owner = ?self.owner_pid, "process forked, dropping inherited connection");
                self.close_no_unbind();
            } else if self
                .bound_euid
                .is_some_and(|bound| bound != euid && (bound == 0 || euid == 0))
            {
                debug!(euid, bound = ?self.bound_euid, "effective uid changed, rebinding");
                self.close_no_unbind();
            }
        }
        self.fork_pending = false;

        if self.is_connected() && self.idle_expired()? {
            debug!("directory connection idle, closing");
            self.close().await;
        }

        let modified = self.config_source.modified();
        if modified != self.config_modified {
            info!("directory configuration changed, reloading");
            self.close().await;
            self.load_config()?;
        }

        Ok(())
    }

    fn load_config(&mut self) -> Result<()> {
        let modified = self.config_source.modified();
        let config = self.config_source.load()?;
        if config.uris.is_empty() {
            return Err(Error::ConfigError("no directory URIs configured".to_string()));
        }

        self.config = Some(config);
        self.config_modified = modified;
        self.endpoint_index = 0;
        self.uid_cache.clear();
        if self.state == SessionState::Uninitialized {
            self.state = SessionState::Initialized;
        }
        Ok(())
    }

    fn inherited(&self, pid: u32) -> bool {
        self.fork_pending || self.owner_pid != Some(pid)
    }

    /// Drops a connection inherited from a parent process without writing to it.
    ///
    /// Returns true when a connection was dropped.
    pub fn release_if_inherited(&mut self) -> bool {
        if self.connection.is_none() {
            return false;
        }
        let pid = self.environment.process_id();
        if !self.inherited(pid) {
            return false;
        }
        debug!(pid, owner = ?self.owner_pid, "process forked, dropping inherited connection");
        self.close_no_unbind();
        self.fork_pending = false;
        true
    }

    fn transport_closed(&mut self) -> bool {
        self.connection
            .as_deref_mut()
            .is_some_and(|connection| connection.is_closed())
    }

    fn socket_stolen(&self) -> bool {
        match (&self.socket, &self.connection) {
            (Some(saved), Some(connection)) => connection.socket_identity() != Some(*saved),
            _ => false,
        }
    }

    fn idle_expired(&self) -> Result<bool> {
        let config = self.config()?;
        Ok(match (config.idle_time_limit(), self.last_activity) {
            (Some(limit), Some(last)) => self.environment.now().duration_since(last) > limit,
            _ => false,
        })
    }

    /// Connects and binds to the current endpoint unless already connected.
    ///
    /// # Errors
    ///
    /// Returns the connect or bind error; the session is left without a connection.
    pub async fn open(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let config = self.config()?;
        let uri = config
            .uris
            .get(self.endpoint_index)
            .cloned()
            .ok_or_else(|| Error::ConfigError(format!("no endpoint {}", self.endpoint_index)))?;

        let mut protocol_version = config.protocol_version;
        if config.tls.mode == TlsMode::StartTls && protocol_version < 3 {
            warn!(
                uri = %uri,
                "StartTLS requires protocol version 3, ignoring configured version {protocol_version}"
            );
            protocol_version = 3;
        }

        let options = ConnectOptions {
            uri: uri.clone(),
            tls: config.tls.clone(),
            protocol_version,
            connect_timeout: config.bind_time_limit(),
            operation_timeout: config.time_limit(),
        };

        debug!(uri = %uri, "connecting to directory server");
        let mut connection = self.connector.connect(&options).await?;

        let euid = self.environment.effective_uid();
        let credentials = config.credentials_for(euid);
        if let Err(err) = connection
            .simple_bind(credentials.bind_dn(), credentials.bind_password())
            .await
        {
            warn!(
                uri = %uri,
                bind_dn = credentials.bind_dn(),
                "failed to bind to directory server: {err}"
            );
            if let Err(unbind_err) = connection.unbind().await {
                debug!("unbind after failed bind: {unbind_err}");
            }
            return Err(err);
        }

        self.socket = connection.socket_identity();
        self.owner_pid = Some(self.environment.process_id());
        self.bound_euid = Some(euid);
        self.last_activity = Some(self.environment.now());
        self.generation += 1;
        self.connection = Some(connection);
        self.state = SessionState::Connected;
        Ok(())
    }

    /// Unbinds and releases the connection. Unbind failures are logged and ignored.
    pub async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(err) = connection.unbind().await {
                debug!("unbind failed while closing session: {err}");
            }
        }
        self.reset_connection_state();
    }

    /// Releases the connection without sending an unbind.
    pub fn close_no_unbind(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.disconnect();
        }
        self.reset_connection_state();
    }

    fn forget_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.forget();
        }
        self.reset_connection_state();
    }

    fn reset_connection_state(&mut self) {
        self.uid_cache.clear();
        self.socket = None;
        self.last_activity = None;
        self.bound_euid = None;
        if self.state == SessionState::Connected {
            self.state = SessionState::Initialized;
        }
    }

    /// Records activity for the idle timeout.
    pub fn touch(&mut self) {
        self.last_activity = Some(self.environment.now());
    }

    /// Moves to the next endpoint, wrapping around, and returns the new index.
    pub fn advance_endpoint(&mut self) -> usize {
        let count = self.config.as_ref().map_or(1, |config| config.uris.len().max(1));
        self.endpoint_index = (self.endpoint_index + 1) % count;
        self.endpoint_index
    }

    /// Marks the connection as inherited across a fork.
    pub fn mark_forked(&mut self) {
        self.fork_pending = true;
    }

    /// Cached uid for a member DN.
    #[must_use]
    pub fn cached_uid(&self, dn: &str) -> Option<&str> {
        self.uid_cache
            .get(&dn.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Remembers the uid a member DN resolved to.
    ///
    /// The cache is emptied whenever the connection is released or it reaches
    /// [`UID_CACHE_LIMIT`] entries.
    pub fn cache_uid(&mut self, dn: &str, uid: impl Into<String>) {
        if self.uid_cache.len() >= UID_CACHE_LIMIT {
            self.uid_cache.clear();
        }
        self.uid_cache.insert(dn.to_ascii_lowercase(), uid.into());
    }
}
