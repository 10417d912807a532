/// Synchronous gateway tests
///
/// Connection lifecycle guarantees of the blocking entry points
/// Run with: cargo test --test gateway_tests
use cmdgate::connection::memory::{MemoryCommand, MemoryFactory, TraceEvent};
use cmdgate::{
    Command, CommandGateway, CommandRunner, Connection, GatewayError, GatewayMode,
    GatewayOptions, IsolationLevel,
};

#[derive(Debug, PartialEq)]
enum LedgerError {
    Gateway(GatewayError),
    InsufficientFunds { requested: u64, available: u64 },
}

impl From<GatewayError> for LedgerError {
    fn from(err: GatewayError) -> Self {
        LedgerError::Gateway(err)
    }
}

fn setup() -> (MemoryFactory, CommandGateway<MemoryFactory>) {
    let factory = MemoryFactory::from_url("memdb://localhost:5432/ledger").unwrap();
    (factory.clone(), CommandGateway::new(factory))
}

#[test]
fn test_five_typed_calls_open_and_close_five_connections() {
    let (factory, gateway) = setup();

    for i in 0..5 {
        let affected = gateway
            .query(|bound| {
                bound
                    .command()
                    .set_sql(format!("UPDATE accounts SET balance = {i}"));
                bound.run_non_query()
            })
            .unwrap();
        assert_eq!(affected, 1);
    }

    assert_eq!(factory.created(), 5);

    let lifecycle = factory.trace().lifecycle();
    assert_eq!(lifecycle.len(), 10);
    for pair in lifecycle.chunks(2) {
        match pair {
            [TraceEvent::Open(opened), TraceEvent::Close(closed)] => assert_eq!(opened, closed),
            other => panic!("expected [open, close], got {:?}", other),
        }
    }
}

#[test]
fn test_domain_error_is_returned_after_close() {
    let (factory, gateway) = setup();

    let result: Result<u64, LedgerError> = gateway.query(|bound| {
        bound.command().set_sql("SELECT balance FROM accounts WHERE id = 7");
        bound.run_non_query()?;
        Err(LedgerError::InsufficientFunds {
            requested: 500,
            available: 120,
        })
    });

    assert_eq!(
        result,
        Err(LedgerError::InsufficientFunds {
            requested: 500,
            available: 120
        })
    );

    let events = factory.trace().events();
    let id = events[0].connection();
    assert_eq!(
        events,
        vec![
            TraceEvent::Create(id),
            TraceEvent::Open(id),
            TraceEvent::Execute {
                connection: id,
                sql: "SELECT balance FROM accounts WHERE id = 7".to_string()
            },
            TraceEvent::Close(id),
        ]
    );
    assert!(factory.trace().open_connections().is_empty());
}

#[test]
fn test_every_entry_point_uses_a_fresh_connection() {
    let (factory, gateway) = setup();
    let mut cmd = MemoryCommand::new("INSERT INTO audit VALUES ('a')");

    gateway.execute_command(&mut cmd).unwrap();
    let first = cmd.bound_to().unwrap();

    gateway
        .execute_command_with(&mut cmd, |bound| {
            bound.run_non_query()?;
            bound.run_non_query().map(|_| ())
        })
        .unwrap();
    let second = cmd.bound_to().unwrap();

    gateway
        .execute(|bound| {
            bound.command().set_sql("DELETE FROM audit");
            bound.run_non_query().map(|_| ())
        })
        .unwrap();

    let rows: u64 = gateway
        .query_command(&mut cmd, |bound| bound.run_non_query())
        .unwrap();

    assert_ne!(first, second);
    assert_eq!(rows, 1);
    assert_eq!(cmd.runs(), 4);
    assert_eq!(factory.created(), 4);

    let stats = gateway.stats();
    assert_eq!((stats.opened, stats.closed, stats.in_flight), (4, 4, 0));
}

#[test]
fn test_default_action_runs_against_bound_connection_only() {
    let (factory, gateway) = setup();
    let mut cmd = MemoryCommand::new("VACUUM");

    gateway.execute_command(&mut cmd).unwrap();

    let bound = cmd.bound_to().unwrap();
    let executions: Vec<_> = factory
        .trace()
        .events()
        .into_iter()
        .filter(|e| matches!(e, TraceEvent::Execute { .. }))
        .collect();
    assert_eq!(
        executions,
        vec![TraceEvent::Execute {
            connection: bound,
            sql: "VACUUM".to_string()
        }]
    );
}

#[test]
fn test_command_failure_closes_connection() {
    let (factory, gateway) = setup();
    let mut empty = MemoryCommand::new("   ");

    let result = gateway.execute_command(&mut empty);

    assert!(matches!(result, Err(GatewayError::Command(_))));
    assert_eq!(factory.trace().lifecycle().len(), 2);
    assert!(factory.trace().open_connections().is_empty());
}

#[test]
fn test_open_failure_skips_work_and_disposes() {
    let factory = MemoryFactory::default().fail_open(true);
    let gateway = CommandGateway::new(factory.clone());
    let mut ran = false;

    let result: Result<(), GatewayError> = gateway.execute(|_| {
        ran = true;
        Ok(())
    });

    assert!(matches!(result, Err(GatewayError::Open(_))));
    assert!(!ran);

    let lifecycle = factory.trace().lifecycle();
    assert!(matches!(lifecycle.as_slice(), [TraceEvent::Dispose(_)]));
    assert_eq!(gateway.stats().opened, 0);
}

#[test]
fn test_ambient_connection_lifecycle() {
    let (factory, gateway) = setup();

    let handles: Vec<_> = (0..10)
        .map(|_| gateway.current_connection().unwrap())
        .collect();
    assert_eq!(factory.created(), 1);
    assert!(handles.windows(2).all(|w| std::sync::Arc::ptr_eq(&w[0], &w[1])));

    // The caller drives the ambient connection
    {
        let mut conn = handles[0].lock().unwrap();
        conn.open().unwrap();
        let mut cmd = conn.create_command();
        cmd.set_sql("LISTEN ledger_events");
        cmd.bind(conn.id());
        cmd.run_non_query(&mut conn).unwrap();
    }

    gateway.dispose();
    gateway.dispose();

    let ambient_id = handles[0].lock().unwrap().id();
    assert_eq!(
        factory.trace().count(|e| *e == TraceEvent::Dispose(ambient_id)),
        1
    );
    assert!(factory.trace().open_connections().is_empty());
}

#[test]
fn test_configured_gateway_reports_options() {
    let options =
        GatewayOptions::from_json(r#"{"mode": "transactional", "isolation_level": "repeatable_read"}"#)
            .unwrap();
    let factory = MemoryFactory::default();
    let gateway = CommandGateway::with_options(factory.clone(), options);

    assert_eq!(gateway.mode(), GatewayMode::Transactional);
    assert_eq!(gateway.isolation_level(), IsolationLevel::RepeatableRead);

    // Mode is advisory: nothing beyond open/execute/close happens
    gateway
        .execute_command(&mut MemoryCommand::new("INSERT INTO t VALUES (1)"))
        .unwrap();
    assert_eq!(factory.trace().events().len(), 4);
}

fn purge_sessions<R>(runner: &R) -> Result<u64, GatewayError>
where
    R: CommandRunner<Connection = cmdgate::connection::memory::MemoryConnection>,
{
    runner.query(|bound| {
        bound.command().set_sql("DELETE FROM sessions WHERE expired");
        bound.run_non_query()
    })
}

#[test]
fn test_runner_trait_drives_gateway() {
    let (factory, gateway) = setup();

    assert_eq!(purge_sessions(&gateway).unwrap(), 1);
    assert_eq!(factory.created(), 1);

    CommandRunner::dispose(&gateway);
    assert!(gateway.is_disposed());
}
