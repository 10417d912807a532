//! In-memory driver.
//!
//! Connections here talk to nothing; they record every lifecycle step in a
//! shared [`Trace`] so callers can see exactly what the gateway did with
//! them. Failure and latency knobs on [`MemoryFactory`] make the error and
//! cancellation paths reproducible.

use super::config::ConnectionConfig;
use super::{Command, Connection, ConnectionFactory, ConnectionId};
use crate::core::{GatewayError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Create(ConnectionId),
    Open(ConnectionId),
    Execute { connection: ConnectionId, sql: String },
    Close(ConnectionId),
    Dispose(ConnectionId),
}

impl TraceEvent {
    pub fn connection(&self) -> ConnectionId {
        match self {
            TraceEvent::Create(id)
            | TraceEvent::Open(id)
            | TraceEvent::Close(id)
            | TraceEvent::Dispose(id) => *id,
            TraceEvent::Execute { connection, .. } => *connection,
        }
    }
}

impl std::fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceEvent::Create(id) => write!(f, "CREATE {id}"),
            TraceEvent::Open(id) => write!(f, "OPEN {id}"),
            TraceEvent::Execute { connection, sql } => write!(f, "EXECUTE {connection}: {sql}"),
            TraceEvent::Close(id) => write!(f, "CLOSE {id}"),
            TraceEvent::Dispose(id) => write!(f, "DISPOSE {id}"),
        }
    }
}

/// Shared, append-only log of driver activity
#[derive(Debug, Clone, Default)]
pub struct Trace {
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl Trace {
    fn record(&self, event: TraceEvent) {
        // A poisoned trace still holds valid events
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push(event);
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Lifecycle events only, with `Create` and `Execute` filtered out
    pub fn lifecycle(&self) -> Vec<TraceEvent> {
        self.events()
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    TraceEvent::Open(_) | TraceEvent::Close(_) | TraceEvent::Dispose(_)
                )
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&TraceEvent) -> bool) -> usize {
        self.events().iter().filter(|e| predicate(e)).count()
    }

    /// Connections that were opened and never closed
    pub fn open_connections(&self) -> Vec<ConnectionId> {
        let mut open = Vec::new();
        let mut closed = HashSet::new();
        for event in self.events().into_iter().rev() {
            match event {
                TraceEvent::Close(id) => {
                    closed.insert(id);
                }
                TraceEvent::Open(id) if !closed.contains(&id) => open.push(id),
                _ => {}
            }
        }
        open.reverse();
        open
    }
}

/// Failure and latency settings copied into every connection
#[derive(Debug, Clone, Copy, Default)]
struct Behavior {
    fail_open: bool,
    fail_close: bool,
    open_delay: Duration,
    execute_delay: Duration,
}

/// Factory for [`MemoryConnection`]s
///
/// # Examples
///
/// ```
/// use cmdgate::connection::memory::MemoryFactory;
/// use cmdgate::ConnectionFactory;
///
/// let factory = MemoryFactory::from_url("memdb://localhost/app").unwrap();
/// let _conn = factory.create().unwrap();
/// assert_eq!(factory.created(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryFactory {
    config: ConnectionConfig,
    behavior: Behavior,
    trace: Trace,
    created: Arc<AtomicUsize>,
}

impl MemoryFactory {
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::default()
        })
    }

    pub fn from_url(url: &str) -> Result<Self> {
        Self::new(ConnectionConfig::from_url(url)?)
    }

    /// Every open attempt is refused
    pub fn fail_open(mut self, fail: bool) -> Self {
        self.behavior.fail_open = fail;
        self
    }

    /// Every close reports an error (the connection still ends up closed)
    pub fn fail_close(mut self, fail: bool) -> Self {
        self.behavior.fail_close = fail;
        self
    }

    /// Latency of `open_async`
    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.behavior.open_delay = delay;
        self
    }

    /// Latency of `run_non_query_async`
    pub fn execute_delay(mut self, delay: Duration) -> Self {
        self.behavior.execute_delay = delay;
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    /// Number of `create()` calls so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl ConnectionFactory for MemoryFactory {
    type Connection = MemoryConnection;

    fn create(&self) -> Result<MemoryConnection> {
        let id = ConnectionId::next();
        self.created.fetch_add(1, Ordering::SeqCst);
        self.trace.record(TraceEvent::Create(id));
        Ok(MemoryConnection {
            id,
            state: ConnectionState::Closed,
            behavior: self.behavior,
            connect_timeout: self.config.connect_timeout,
            command_timeout: self.config.command_timeout,
            trace: self.trace.clone(),
            executed: 0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Closed,
    Open,
    Disposed,
}

#[derive(Debug)]
pub struct MemoryConnection {
    id: ConnectionId,
    state: ConnectionState,
    behavior: Behavior,
    connect_timeout: Duration,
    command_timeout: Option<Duration>,
    trace: Trace,
    executed: usize,
}

impl MemoryConnection {
    /// Statements executed on this connection
    pub fn executed(&self) -> usize {
        self.executed
    }

    pub fn is_disposed(&self) -> bool {
        self.state == ConnectionState::Disposed
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.state == ConnectionState::Disposed {
            return Err(GatewayError::Connection(format!(
                "Connection {} is disposed",
                self.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    type Command = MemoryCommand;

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    fn open(&mut self) -> Result<()> {
        self.ensure_usable()?;
        if self.is_open() {
            return Err(GatewayError::Connection(format!(
                "Connection {} is already open",
                self.id
            )));
        }
        if self.behavior.fail_open {
            return Err(GatewayError::Open(format!("Connection {} refused", self.id)));
        }

        self.state = ConnectionState::Open;
        self.trace.record(TraceEvent::Open(self.id));
        Ok(())
    }

    async fn open_async(&mut self, token: &CancellationToken) -> Result<()> {
        if token.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }

        if !self.behavior.open_delay.is_zero() {
            tokio::time::timeout(
                self.connect_timeout,
                tokio::time::sleep(self.behavior.open_delay),
            )
            .await
            .map_err(|_| {
                GatewayError::Open(format!("Connection {} timed out while opening", self.id))
            })?;
        }

        self.open()
    }

    fn close(&mut self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }

        self.state = ConnectionState::Closed;
        self.trace.record(TraceEvent::Close(self.id));

        if self.behavior.fail_close {
            return Err(GatewayError::Close(format!(
                "Connection {} reported an error while closing",
                self.id
            )));
        }
        Ok(())
    }

    fn create_command(&mut self) -> MemoryCommand {
        MemoryCommand::default()
    }

    fn dispose(&mut self) -> Result<()> {
        if self.state == ConnectionState::Disposed {
            return Ok(());
        }

        self.trace.record(TraceEvent::Dispose(self.id));
        let closed = self.close();
        self.state = ConnectionState::Disposed;
        closed
    }
}

/// A SQL statement for the in-memory driver
#[derive(Debug, Clone, Default)]
pub struct MemoryCommand {
    sql: String,
    bound: Option<ConnectionId>,
    runs: usize,
}

impl MemoryCommand {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Self::default()
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn set_sql(&mut self, sql: impl Into<String>) {
        self.sql = sql.into();
    }

    /// How many times this command has been executed
    pub fn runs(&self) -> usize {
        self.runs
    }

    fn check(&self, connection: &MemoryConnection) -> Result<()> {
        match self.bound {
            Some(id) if id == connection.id => {}
            Some(id) => {
                return Err(GatewayError::Command(format!(
                    "Command is bound to {id}, not {}",
                    connection.id
                )));
            }
            None => return Err(GatewayError::Command("Command is not bound".to_string())),
        }

        if !connection.is_open() {
            return Err(GatewayError::Command(format!(
                "Connection {} is not open",
                connection.id
            )));
        }

        if self.sql.trim().is_empty() {
            return Err(GatewayError::Command("Command text is empty".to_string()));
        }

        Ok(())
    }
}

#[async_trait]
impl Command<MemoryConnection> for MemoryCommand {
    fn bind(&mut self, connection: ConnectionId) {
        self.bound = Some(connection);
    }

    fn bound_to(&self) -> Option<ConnectionId> {
        self.bound
    }

    fn run_non_query(&mut self, connection: &mut MemoryConnection) -> Result<u64> {
        self.check(connection)?;

        connection.trace.record(TraceEvent::Execute {
            connection: connection.id,
            sql: self.sql.clone(),
        });
        connection.executed += 1;
        self.runs += 1;

        let statements = self
            .sql
            .split(';')
            .filter(|s| !s.trim().is_empty())
            .count();
        Ok(statements as u64)
    }

    async fn run_non_query_async(
        &mut self,
        connection: &mut MemoryConnection,
        token: &CancellationToken,
    ) -> Result<u64> {
        self.check(connection)?;

        let delay = connection.behavior.execute_delay;
        if !delay.is_zero() {
            let id = connection.id;
            let limit = connection.command_timeout;
            let work = async move {
                match limit {
                    Some(limit) => tokio::time::timeout(limit, tokio::time::sleep(delay))
                        .await
                        .map_err(|_| {
                            GatewayError::Command(format!(
                                "Command on {id} timed out after {limit:?}"
                            ))
                        }),
                    None => {
                        tokio::time::sleep(delay).await;
                        Ok(())
                    }
                }
            };
            tokio::select! {
                _ = token.cancelled() => return Err(GatewayError::Cancelled),
                finished = work => finished?,
            }
        }

        self.run_non_query(connection)
    }
}
