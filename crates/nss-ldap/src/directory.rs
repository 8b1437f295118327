//! Blocking entry points for name-service hosts.
//!
//! A [`Directory`] owns the process-wide [`Session`] behind a mutex together with a
//! single-threaded runtime that drives it. Every call runs as a [`Transaction`]: the session
//! lock is held and SIGPIPE is ignored until the call returns. Results are reported as a
//! [`Status`]; records land in the caller's [`BufferArena`].

use crate::backend::DirectoryConnector;
use crate::enumeration::{self, EnumerationContext, RecordParser};
use crate::environment::{HostEnvironment, SigpipeGuard, SystemEnvironment};
use crate::expansion::{self, Expansion, ExpansionPolicy, ExpansionSeed, Member};
use crate::ldap::Ldap3Connector;
use crate::query::{self, LookupRequest};
use crate::session::Session;
use crate::Result;
use nss_ldap_core::arena::BufferArena;
use nss_ldap_core::config::{ConfigSource, DirectoryConfig};
use nss_ldap_core::{Error, Status};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

/// Process-wide directory handle.
pub struct Directory {
    runtime: Runtime,
    session: Mutex<Session>,
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory").finish_non_exhaustive()
    }
}

impl Directory {
    /// Directory backed by real LDAP connections.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InternalError`] when the runtime cannot be started.
    pub fn new(config_source: Arc<dyn ConfigSource>) -> Result<Self> {
        Self::with_backend(
            Arc::new(Ldap3Connector::new()),
            config_source,
            Arc::new(SystemEnvironment),
        )
    }

    /// Directory with an explicit connector and host environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InternalError`] when the runtime cannot be started.
    pub fn with_backend(
        connector: Arc<dyn DirectoryConnector>,
        config_source: Arc<dyn ConfigSource>,
        environment: Arc<dyn HostEnvironment>,
    ) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| Error::InternalError(format!("failed to start runtime: {err}")))?;
        Ok(Self {
            runtime,
            session: Mutex::new(Session::new(connector, config_source, environment)),
        })
    }

    /// Locks the session for a sequence of operations.
    ///
    /// Must not be called from inside an async runtime.
    pub fn transaction(&self) -> Transaction<'_> {
        let session = match self.session.lock() {
            Ok(session) => session,
            Err(poisoned) => {
                warn!("directory session lock was poisoned, continuing with its state");
                poisoned.into_inner()
            }
        };
        Transaction {
            _sigpipe: SigpipeGuard::install(),
            session,
            runtime: &self.runtime,
        }
    }

    /// Looks up one record; returns the status and the arena bytes used.
    pub fn lookup_one(
        &self,
        request: &LookupRequest,
        parser: &mut dyn RecordParser,
        arena: &mut BufferArena<'_>,
    ) -> (Status, usize) {
        let result = self.transaction().lookup_one(request, parser, arena);
        let status = report("lookup", &result);
        (status, result.unwrap_or(0))
    }

    /// Starts an enumeration.
    pub fn enumerate_start(&self, ctx: &mut EnumerationContext, request: LookupRequest) -> Status {
        report(
            "enumerate start",
            &self.transaction().enumerate_start(ctx, request),
        )
    }

    /// Produces the next record of an enumeration.
    ///
    /// [`Status::TryAgain`] means the record did not fit; the same record is produced again
    /// by the next call.
    pub fn enumerate_next(
        &self,
        ctx: &mut EnumerationContext,
        parser: &mut dyn RecordParser,
        arena: &mut BufferArena<'_>,
    ) -> Status {
        report(
            "enumerate next",
            &self.transaction().enumerate_next(ctx, parser, arena),
        )
    }

    /// Ends an enumeration.
    pub fn enumerate_end(&self, ctx: &mut EnumerationContext) {
        self.transaction().enumerate_end(ctx);
    }

    /// Expands a group, a user's groups or a netgroup.
    ///
    /// [`ExpansionPolicy::from_config`] gives the policy the configuration selects. When the
    /// policy's group limit cuts the list short the status is [`Status::TryAgain`] and the
    /// groups collected so far are returned.
    pub fn expand_membership(
        &self,
        seed: &ExpansionSeed,
        policy: &ExpansionPolicy,
    ) -> (Status, Vec<Member>) {
        let result = self.transaction().expand_membership(seed, policy);
        let status = report("expand membership", &result);
        match result {
            Ok(expansion) if expansion.limit_reached => (Status::TryAgain, expansion.members),
            Ok(expansion) => (status, expansion.members),
            Err(_) => (status, Vec::new()),
        }
    }

    /// Closes the connection, unbinding if it is healthy.
    pub fn close(&self) {
        self.transaction().close();
    }

    /// Marks the session as inherited by a forked child.
    ///
    /// The child must not talk on the parent's socket; the next call reconnects without
    /// unbinding. Never blocks: a lock held at fork time is left alone.
    pub fn reset_after_fork(&self) {
        match self.session.try_lock() {
            Ok(mut session) => session.mark_forked(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().mark_forked(),
            Err(TryLockError::WouldBlock) => {
                debug!("session busy at fork, the next call detects the new process");
            }
        }
    }
}

/// Exclusive use of the session for the duration of a call.
///
/// Fields drop in declaration order, so SIGPIPE handling is restored before the lock is
/// released.
pub struct Transaction<'d> {
    _sigpipe: SigpipeGuard,
    session: MutexGuard<'d, Session>,
    runtime: &'d Runtime,
}

impl Transaction<'_> {
    /// Looks up one record into `arena`.
    ///
    /// # Errors
    ///
    /// See [`query::lookup_one`].
    pub fn lookup_one(
        &mut self,
        request: &LookupRequest,
        parser: &mut dyn RecordParser,
        arena: &mut BufferArena<'_>,
    ) -> Result<usize> {
        self.runtime
            .block_on(query::lookup_one(&mut self.session, request, parser, arena))
    }

    /// Starts an enumeration.
    ///
    /// # Errors
    ///
    /// See [`enumeration::enumerate_start`].
    pub fn enumerate_start(
        &mut self,
        ctx: &mut EnumerationContext,
        request: LookupRequest,
    ) -> Result<()> {
        self.runtime
            .block_on(enumeration::enumerate_start(&mut self.session, ctx, request))
    }

    /// Produces the next record of an enumeration.
    ///
    /// # Errors
    ///
    /// See [`enumeration::enumerate_next`].
    pub fn enumerate_next(
        &mut self,
        ctx: &mut EnumerationContext,
        parser: &mut dyn RecordParser,
        arena: &mut BufferArena<'_>,
    ) -> Result<()> {
        self.runtime.block_on(enumeration::enumerate_next(
            &mut self.session,
            ctx,
            parser,
            arena,
        ))
    }

    /// Ends an enumeration.
    pub fn enumerate_end(&mut self, ctx: &mut EnumerationContext) {
        self.runtime
            .block_on(enumeration::enumerate_end(&mut self.session, ctx));
    }

    /// Expands `seed` under `policy`.
    ///
    /// # Errors
    ///
    /// See [`expansion::expand`].
    pub fn expand_membership(
        &mut self,
        seed: &ExpansionSeed,
        policy: &ExpansionPolicy,
    ) -> Result<Expansion> {
        self.runtime
            .block_on(expansion::expand(&mut self.session, seed, policy))
    }

    /// Current configuration, loading it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] when the configuration cannot be loaded.
    pub fn config(&mut self) -> Result<Arc<DirectoryConfig>> {
        self.runtime.block_on(self.session.ensure_initialized())?;
        self.session.config()
    }

    /// Closes the connection.
    pub fn close(&mut self) {
        self.runtime.block_on(self.session.close());
    }

    /// The locked session.
    pub fn session(&mut self) -> &mut Session {
        &mut self.session
    }
}

fn report<T>(operation: &'static str, result: &Result<T>) -> Status {
    if let Err(err) = result {
        if err.should_log() {
            warn!(operation, code = err.error_code(), "directory call failed: {err}");
        } else {
            debug!(operation, code = err.error_code(), "{err}");
        }
    }
    Status::of(result)
}
