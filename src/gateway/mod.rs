// ============================================================================
// Command Gateway
// ============================================================================
//
// Every execution entry point opens its own connection, runs one unit of
// work on a bound command, and closes the connection before returning.
// All eight entry points funnel into `run_sync` / `run_async`, which differ
// only in whether they suspend; `CommandSource` decides whether the command
// comes from the caller or from the freshly opened connection. The close
// guarantee itself lives in `guard::ConnectionGuard`.
//
// ============================================================================

mod guard;
mod stats;

pub use stats::GatewayStats;

use crate::connection::config::{GatewayMode, GatewayOptions, IsolationLevel};
use crate::connection::{BoundCommand, Connection, ConnectionFactory, ConnectionId};
use crate::core::{GatewayError, Result};
use futures::future::BoxFuture;
use guard::ConnectionGuard;
use once_cell::sync::OnceCell;
use stats::CallCounters;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

/// Command type produced by a factory's connections
pub type CommandOf<F> = <<F as ConnectionFactory>::Connection as Connection>::Command;

/// Shared handle to the ambient connection
pub type AmbientConnection<C> = Arc<Mutex<C>>;

enum CommandSource<'s, Cmd> {
    /// Create a fresh command from the opened connection
    Created,
    /// Bind the caller's command to the opened connection
    Supplied(&'s mut Cmd),
}

/// Connection-scoped command execution gateway
///
/// # Examples
///
/// ```
/// use cmdgate::connection::memory::{MemoryCommand, MemoryFactory};
/// use cmdgate::{CommandGateway, GatewayError};
///
/// let gateway = CommandGateway::new(MemoryFactory::default());
///
/// let mut cmd = MemoryCommand::new("DELETE FROM sessions");
/// gateway.execute_command(&mut cmd).unwrap();
///
/// let affected = gateway
///     .query(|bound| {
///         bound.command().set_sql("UPDATE jobs SET done = true");
///         bound.run_non_query()
///     })
///     .unwrap();
/// assert_eq!(affected, 1);
/// assert_eq!(gateway.stats().in_flight, 0);
/// # Ok::<(), GatewayError>(())
/// ```
pub struct CommandGateway<F: ConnectionFactory> {
    factory: F,
    options: GatewayOptions,
    /// Created on first access, never re-created
    ambient: OnceCell<AmbientConnection<F::Connection>>,
    ambient_released: AtomicBool,
    disposed: AtomicBool,
    counters: CallCounters,
}

impl<F: ConnectionFactory> CommandGateway<F> {
    /// Gateway in read-only mode with the least restrictive isolation level
    pub fn new(factory: F) -> Self {
        Self::with_options(factory, GatewayOptions::default())
    }

    pub fn with_mode(factory: F, mode: GatewayMode, isolation_level: IsolationLevel) -> Self {
        Self::with_options(factory, GatewayOptions::new(mode, isolation_level))
    }

    pub fn with_options(factory: F, options: GatewayOptions) -> Self {
        Self {
            factory,
            options,
            ambient: OnceCell::new(),
            ambient_released: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            counters: CallCounters::default(),
        }
    }

    /// Construct from raw mode and isolation names
    ///
    /// Unrecognized names fail here rather than on first use.
    pub fn from_names(factory: F, mode: &str, isolation_level: &str) -> Result<Self> {
        Ok(Self::with_options(
            factory,
            GatewayOptions::parse(mode, isolation_level)?,
        ))
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn options(&self) -> GatewayOptions {
        self.options
    }

    pub fn mode(&self) -> GatewayMode {
        self.options.mode
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.options.isolation_level
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> GatewayStats {
        self.counters
            .snapshot(self.ambient.get().is_some(), self.is_disposed())
    }

    // ------------------------------------------------------------------
    // Ambient connection
    // ------------------------------------------------------------------

    /// The ambient connection, created by the factory on first access.
    ///
    /// The gateway never opens or closes it; whoever uses it owns its state.
    /// Concurrent first accesses still produce a single connection.
    pub fn current_connection(&self) -> Result<AmbientConnection<F::Connection>> {
        if self.is_disposed() {
            return Err(GatewayError::Disposed);
        }

        let ambient = self.ambient.get_or_try_init(|| {
            let connection = self.factory.create()?;
            debug!(connection = %connection.id(), "ambient connection created");
            Ok::<_, GatewayError>(Arc::new(Mutex::new(connection)))
        })?;

        // dispose() may have run while the factory was creating it
        if self.is_disposed() {
            self.release_ambient();
            return Err(GatewayError::Disposed);
        }

        Ok(Arc::clone(ambient))
    }

    /// Release the ambient connection if it was ever created.
    ///
    /// Safe to call repeatedly; also runs on drop.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.release_ambient();
    }

    /// Dispose the ambient connection at most once
    fn release_ambient(&self) {
        let Some(ambient) = self.ambient.get() else {
            return;
        };
        if self.ambient_released.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut connection = ambient.lock().unwrap_or_else(|poisoned| {
            warn!("ambient connection lock poisoned, disposing anyway");
            poisoned.into_inner()
        });
        let id = connection.id();
        match connection.dispose() {
            Ok(()) => debug!(connection = %id, "ambient connection disposed"),
            Err(err) => warn!(connection = %id, error = %err, "failed to dispose ambient connection"),
        }
    }

    // ------------------------------------------------------------------
    // Synchronous entry points
    // ------------------------------------------------------------------

    /// Run the caller's command as a non-query on a fresh connection
    pub fn execute_command(&self, command: &mut CommandOf<F>) -> Result<()> {
        self.run_sync(CommandSource::Supplied(command), |bound| {
            bound.run_non_query().map(|_| ())
        })
    }

    /// Bind the caller's command to a fresh connection and hand it to `action`
    pub fn execute_command_with<E, A>(
        &self,
        command: &mut CommandOf<F>,
        action: A,
    ) -> std::result::Result<(), E>
    where
        A: FnOnce(&mut BoundCommand<'_, F::Connection>) -> std::result::Result<(), E>,
        E: From<GatewayError>,
    {
        self.run_sync(CommandSource::Supplied(command), action)
    }

    /// Hand a command created from a fresh connection to `action`
    pub fn execute<E, A>(&self, action: A) -> std::result::Result<(), E>
    where
        A: FnOnce(&mut BoundCommand<'_, F::Connection>) -> std::result::Result<(), E>,
        E: From<GatewayError>,
    {
        self.run_sync(CommandSource::Created, action)
    }

    /// Like [`execute`](Self::execute), returning what `func` produces
    pub fn query<T, E, W>(&self, func: W) -> std::result::Result<T, E>
    where
        W: FnOnce(&mut BoundCommand<'_, F::Connection>) -> std::result::Result<T, E>,
        E: From<GatewayError>,
    {
        self.run_sync(CommandSource::Created, func)
    }

    pub fn query_command<T, E, W>(
        &self,
        command: &mut CommandOf<F>,
        func: W,
    ) -> std::result::Result<T, E>
    where
        W: FnOnce(&mut BoundCommand<'_, F::Connection>) -> std::result::Result<T, E>,
        E: From<GatewayError>,
    {
        self.run_sync(CommandSource::Supplied(command), func)
    }

    // ------------------------------------------------------------------
    // Asynchronous entry points
    // ------------------------------------------------------------------

    pub async fn execute_async<E, W>(
        &self,
        action: W,
        token: CancellationToken,
    ) -> std::result::Result<(), E>
    where
        W: for<'b> FnOnce(
                &'b mut BoundCommand<'_, F::Connection>,
                CancellationToken,
            ) -> BoxFuture<'b, std::result::Result<(), E>>
            + Send,
        E: From<GatewayError> + Send,
    {
        self.run_async(CommandSource::Created, action, token).await
    }

    pub async fn execute_command_async<E, W>(
        &self,
        command: &mut CommandOf<F>,
        action: W,
        token: CancellationToken,
    ) -> std::result::Result<(), E>
    where
        W: for<'b> FnOnce(
                &'b mut BoundCommand<'_, F::Connection>,
                CancellationToken,
            ) -> BoxFuture<'b, std::result::Result<(), E>>
            + Send,
        E: From<GatewayError> + Send,
    {
        self.run_async(CommandSource::Supplied(command), action, token)
            .await
    }

    pub async fn query_async<T, E, W>(
        &self,
        func: W,
        token: CancellationToken,
    ) -> std::result::Result<T, E>
    where
        W: for<'b> FnOnce(
                &'b mut BoundCommand<'_, F::Connection>,
                CancellationToken,
            ) -> BoxFuture<'b, std::result::Result<T, E>>
            + Send,
        T: Send,
        E: From<GatewayError> + Send,
    {
        self.run_async(CommandSource::Created, func, token).await
    }

    pub async fn query_command_async<T, E, W>(
        &self,
        command: &mut CommandOf<F>,
        func: W,
        token: CancellationToken,
    ) -> std::result::Result<T, E>
    where
        W: for<'b> FnOnce(
                &'b mut BoundCommand<'_, F::Connection>,
                CancellationToken,
            ) -> BoxFuture<'b, std::result::Result<T, E>>
            + Send,
        T: Send,
        E: From<GatewayError> + Send,
    {
        self.run_async(CommandSource::Supplied(command), func, token)
            .await
    }

    // ------------------------------------------------------------------
    // Open, run, close
    // ------------------------------------------------------------------

    fn run_sync<T, E, W>(
        &self,
        source: CommandSource<'_, CommandOf<F>>,
        work: W,
    ) -> std::result::Result<T, E>
    where
        W: FnOnce(&mut BoundCommand<'_, F::Connection>) -> std::result::Result<T, E>,
        E: From<GatewayError>,
    {
        let mut guard = ConnectionGuard::new(self.factory.create()?, &self.counters);
        let span = info_span!("gateway_call", connection = %guard.id(), mode = %self.options.mode);
        let _entered = span.enter();

        guard.open()?;

        let outcome = {
            let connection = guard.connection();
            let mut created;
            let command = match source {
                CommandSource::Supplied(command) => command,
                CommandSource::Created => {
                    created = connection.create_command();
                    &mut created
                }
            };
            let mut bound = BoundCommand::new(connection, command);
            work(&mut bound)
        };

        let id = guard.id();
        settle(id, outcome, guard.finish())
    }

    async fn run_async<T, E, W>(
        &self,
        source: CommandSource<'_, CommandOf<F>>,
        work: W,
        token: CancellationToken,
    ) -> std::result::Result<T, E>
    where
        W: for<'b> FnOnce(
                &'b mut BoundCommand<'_, F::Connection>,
                CancellationToken,
            ) -> BoxFuture<'b, std::result::Result<T, E>>
            + Send,
        T: Send,
        E: From<GatewayError> + Send,
    {
        let guard = ConnectionGuard::new(self.factory.create()?, &self.counters);
        let span = info_span!("gateway_call", connection = %guard.id(), mode = %self.options.mode);

        run_guarded(guard, source, work, token).instrument(span).await
    }
}

async fn run_guarded<C, T, E, W>(
    mut guard: ConnectionGuard<'_, C>,
    source: CommandSource<'_, C::Command>,
    work: W,
    token: CancellationToken,
) -> std::result::Result<T, E>
where
    C: Connection,
    W: for<'b> FnOnce(
            &'b mut BoundCommand<'_, C>,
            CancellationToken,
        ) -> BoxFuture<'b, std::result::Result<T, E>>
        + Send,
    T: Send,
    E: From<GatewayError> + Send,
{
    guard.open_async(&token).await?;

    let outcome = {
        let connection = guard.connection();
        let mut created;
        let command = match source {
            CommandSource::Supplied(command) => command,
            CommandSource::Created => {
                created = connection.create_command();
                &mut created
            }
        };
        let mut bound = BoundCommand::new(connection, command);
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(E::from(GatewayError::Cancelled)),
            result = work(&mut bound, token.clone()) => result,
        }
    };

    let id = guard.id();
    settle(id, outcome, guard.finish())
}

/// Combine the unit of work's outcome with the close result.
/// A pending error always wins over a close failure.
fn settle<T, E>(
    id: ConnectionId,
    outcome: std::result::Result<T, E>,
    closed: Result<()>,
) -> std::result::Result<T, E>
where
    E: From<GatewayError>,
{
    match (outcome, closed) {
        (outcome, Ok(())) => outcome,
        (Ok(_), Err(close_err)) => Err(close_err.into()),
        (Err(err), Err(close_err)) => {
            warn!(
                connection = %id,
                error = %close_err,
                "close failed while an earlier error was pending"
            );
            Err(err)
        }
    }
}

impl<F: ConnectionFactory> Drop for CommandGateway<F> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Synchronous runner surface, for code that should not care which gateway
/// it is handed.
pub trait CommandRunner {
    type Connection: Connection;

    fn current_connection(&self) -> Result<AmbientConnection<Self::Connection>>;

    fn execute_command(
        &self,
        command: &mut <Self::Connection as Connection>::Command,
    ) -> Result<()>;

    fn execute<E, A>(&self, action: A) -> std::result::Result<(), E>
    where
        A: FnOnce(&mut BoundCommand<'_, Self::Connection>) -> std::result::Result<(), E>,
        E: From<GatewayError>;

    fn query<T, E, W>(&self, func: W) -> std::result::Result<T, E>
    where
        W: FnOnce(&mut BoundCommand<'_, Self::Connection>) -> std::result::Result<T, E>,
        E: From<GatewayError>;

    fn query_command<T, E, W>(
        &self,
        command: &mut <Self::Connection as Connection>::Command,
        func: W,
    ) -> std::result::Result<T, E>
    where
        W: FnOnce(&mut BoundCommand<'_, Self::Connection>) -> std::result::Result<T, E>,
        E: From<GatewayError>;

    fn dispose(&self);
}

impl<F: ConnectionFactory> CommandRunner for CommandGateway<F> {
    type Connection = F::Connection;

    fn current_connection(&self) -> Result<AmbientConnection<F::Connection>> {
        CommandGateway::current_connection(self)
    }

    fn execute_command(&self, command: &mut CommandOf<F>) -> Result<()> {
        CommandGateway::execute_command(self, command)
    }

    fn execute<E, A>(&self, action: A) -> std::result::Result<(), E>
    where
        A: FnOnce(&mut BoundCommand<'_, F::Connection>) -> std::result::Result<(), E>,
        E: From<GatewayError>,
    {
        CommandGateway::execute(self, action)
    }

    fn query<T, E, W>(&self, func: W) -> std::result::Result<T, E>
    where
        W: FnOnce(&mut BoundCommand<'_, F::Connection>) -> std::result::Result<T, E>,
        E: From<GatewayError>,
    {
        CommandGateway::query(self, func)
    }

    fn query_command<T, E, W>(
        &self,
        command: &mut CommandOf<F>,
        func: W,
    ) -> std::result::Result<T, E>
    where
        W: FnOnce(&mut BoundCommand<'_, F::Connection>) -> std::result::Result<T, E>,
        E: From<GatewayError>,
    {
        CommandGateway::query_command(self, command, func)
    }

    fn dispose(&self) {
        CommandGateway::dispose(self)
    }
}
