pub mod config;
pub mod memory;

use crate::core::{GatewayError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// Global connection ID counter
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Generate a new unique connection ID
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// Produces new, unopened connections.
///
/// Every call must hand out an independent connection that no other caller
/// holds. Pooling, if any, lives behind this trait.
pub trait ConnectionFactory: Send + Sync {
    type Connection: Connection;

    fn create(&self) -> Result<Self::Connection>;
}

/// A physical database connection as seen by the gateway.
#[async_trait]
pub trait Connection: Send + Sized {
    type Command: Command<Self>;

    fn id(&self) -> ConnectionId;

    fn is_open(&self) -> bool;

    fn open(&mut self) -> Result<()>;

    /// Open the connection, giving up early once `token` is cancelled.
    async fn open_async(&mut self, token: &CancellationToken) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// Create a new command already associated with this connection's driver.
    /// The command still has to be bound before it can run.
    fn create_command(&mut self) -> Self::Command;

    /// Release every resource held by the connection
    fn dispose(&mut self) -> Result<()> {
        if self.is_open() {
            self.close()
        } else {
            Ok(())
        }
    }
}

/// An executable command. Opaque to the gateway apart from binding and
/// the non-query default action.
#[async_trait]
pub trait Command<C: Send>: Send {
    fn bind(&mut self, connection: ConnectionId);

    fn bound_to(&self) -> Option<ConnectionId>;

    /// Execute as a statement that returns no rows; yields the affected count
    fn run_non_query(&mut self, connection: &mut C) -> Result<u64>;

    async fn run_non_query_async(
        &mut self,
        connection: &mut C,
        token: &CancellationToken,
    ) -> Result<u64>;
}

/// A command bound to the connection it will run on.
///
/// Handed to every unit of work. The borrow ends with the unit of work, so
/// neither the command binding nor the connection can escape the call.
pub struct BoundCommand<'c, C: Connection> {
    connection: &'c mut C,
    command: &'c mut C::Command,
}

impl<'c, C: Connection> BoundCommand<'c, C> {
    pub(crate) fn new(connection: &'c mut C, command: &'c mut C::Command) -> Self {
        command.bind(connection.id());
        Self {
            connection,
            command,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn command(&mut self) -> &mut C::Command {
        self.command
    }

    pub fn connection(&mut self) -> &mut C {
        self.connection
    }

    pub fn run_non_query(&mut self) -> Result<u64> {
        self.command.run_non_query(self.connection)
    }

    pub async fn run_non_query_async(&mut self, token: &CancellationToken) -> Result<u64> {
        if token.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        self.command.run_non_query_async(self.connection, token).await
    }
}
