use super::stats::CallCounters;
use crate::connection::{Connection, ConnectionId};
use crate::core::{GatewayError, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// RAII guard for a per-call connection
///
/// Owns the connection from the moment the factory hands it out. The normal
/// path ends with [`ConnectionGuard::finish`]; every other exit (an early
/// `?`, a panic in the unit of work, or a dropped future) goes through
/// `Drop`. Either way the connection is released exactly once: closed if it
/// was opened, disposed if it never was.
pub(crate) struct ConnectionGuard<'g, C: Connection> {
    connection: C,
    id: ConnectionId,
    opened: bool,
    released: bool,
    counters: &'g CallCounters,
}

impl<'g, C: Connection> ConnectionGuard<'g, C> {
    pub(crate) fn new(connection: C, counters: &'g CallCounters) -> Self {
        let id = connection.id();
        Self {
            connection,
            id,
            opened: false,
            released: false,
            counters,
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn connection(&mut self) -> &mut C {
        &mut self.connection
    }

    pub(crate) fn open(&mut self) -> Result<()> {
        self.connection.open()?;
        self.mark_opened();
        Ok(())
    }

    /// Open, racing the driver against `token`. A cancelled open leaves the
    /// connection to be disposed by `Drop`.
    pub(crate) async fn open_async(&mut self, token: &CancellationToken) -> Result<()> {
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(GatewayError::Cancelled),
            result = self.connection.open_async(token) => result,
        };
        outcome?;
        self.mark_opened();
        Ok(())
    }

    /// Close the connection and report how closing went
    pub(crate) fn finish(mut self) -> Result<()> {
        self.release()
    }

    fn mark_opened(&mut self) {
        self.opened = true;
        self.counters.record_open();
        debug!(connection = %self.id, "connection opened");
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        if self.opened {
            let closed = self.connection.close();
            self.counters.record_close();
            debug!(connection = %self.id, "connection closed");
            closed
        } else {
            debug!(connection = %self.id, "disposing connection that never opened");
            self.connection.dispose()
        }
    }
}

impl<C: Connection> Drop for ConnectionGuard<'_, C> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(connection = %self.id, error = %err, "failed to release connection");
        }
    }
}
