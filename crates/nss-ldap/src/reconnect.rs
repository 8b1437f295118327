//! Reconnect controller.
//!
//! [`with_reconnect`] runs an operation against the session's connection, walking every
//! configured endpoint within one attempt and backing off between attempts.

use crate::session::Session;
use crate::Result;
use async_trait::async_trait;
use nss_ldap_core::Error;
use tracing::{error, info, warn};

/// An operation that needs a bound connection.
#[async_trait]
pub trait SessionOperation: Send {
    /// Value produced on success.
    type Output: Send;

    /// Runs the operation; the session is connected when this is called.
    async fn execute(&mut self, session: &mut Session) -> Result<Self::Output>;
}

/// Runs `operation`, reconnecting and failing over as the reconnect policy allows.
///
/// Unavailable-class failures close the connection and move to the next endpoint; any other
/// outcome is returned at once.
///
/// # Errors
///
/// Returns the operation's own error, or [`Error::Unavailable`] once every attempt failed.
pub async fn with_reconnect<O>(session: &mut Session, operation: &mut O) -> Result<O::Output>
where
    O: SessionOperation + ?Sized,
{
    session.ensure_initialized().await?;
    let config = session.config()?;
    let policy = config.reconnect;
    let soft = !policy.is_hard() || session.environment().soft_policy_forced();
    let total_attempts = policy.total_attempts().max(1);
    let mut last_error: Option<Error> = None;

    for attempt in 0..total_attempts {
        if attempt > 0 {
            if soft {
                break;
            }
            if let Some(delay) = policy.delay_before_attempt(attempt) {
                warn!(
                    attempt,
                    "no directory server available, retrying after {:?}", delay
                );
                session.environment().sleep(delay).await;
            }
            info!(attempt, "reconnecting to directory server");
        }

        let start = session.endpoint_index();
        loop {
            let uri = config
                .uris
                .get(session.endpoint_index())
                .map_or("", String::as_str);

            match run_once(session, operation).await {
                Ok(output) => {
                    if attempt > 0 {
                        info!(
                            uri = %uri,
                            "reconnected to directory server after {} attempts",
                            attempt + 1
                        );
                    }
                    session.touch();
                    return Ok(output);
                }
                Err(err) if err.is_unavailable() => {
                    warn!(uri = %uri, attempt, "directory server unavailable: {err}");
                    session.close().await;
                    last_error = Some(err);
                    if session.advance_endpoint() == start {
                        break;
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    let reason = last_error.map_or_else(|| "no attempts made".to_string(), |err| err.to_string());
    error!(
        endpoints = config.uris.len(),
        "could not reach any directory server: {reason}"
    );
    Err(Error::Unavailable(reason))
}

async fn run_once<O>(session: &mut Session, operation: &mut O) -> Result<O::Output>
where
    O: SessionOperation + ?Sized,
{
    session.open().await?;
    operation.execute(session).await
}
