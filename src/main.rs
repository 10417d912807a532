use anyhow::Context;
use clap::Parser;
use cmdgate::connection::memory::{MemoryCommand, MemoryFactory};
use cmdgate::{CancellationToken, CommandGateway, GatewayError, GatewayOptions};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Run statements through a command gateway backed by the in-memory driver
#[derive(Debug, Parser)]
#[command(name = "cmdgate", version, about)]
struct Cli {
    /// Connection string handed to the connection factory
    #[arg(long, default_value = "memdb://localhost/cmdgate")]
    url: String,

    #[arg(long, default_value = "read_only")]
    mode: String,

    #[arg(long, default_value = "read_uncommitted")]
    isolation: String,

    /// Gateway options as JSON; takes precedence over --mode/--isolation
    #[arg(long)]
    options: Option<String>,

    /// Use the asynchronous entry points
    #[arg(long = "async")]
    use_async: bool,

    /// Simulated latency per statement in milliseconds (async only)
    #[arg(long, default_value_t = 0)]
    latency_ms: u64,

    /// Cancel the remaining async work after this many milliseconds
    #[arg(long)]
    cancel_after_ms: Option<u64>,

    /// Statements to run, one gateway call each
    #[arg(required = true)]
    statements: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let options = match &cli.options {
        Some(json) => GatewayOptions::from_json(json),
        None => GatewayOptions::parse(&cli.mode, &cli.isolation),
    }
    .context("invalid gateway options")?;

    let factory = MemoryFactory::from_url(&cli.url)
        .with_context(|| format!("invalid connection string '{}'", cli.url))?
        .execute_delay(Duration::from_millis(cli.latency_ms));

    let gateway = CommandGateway::with_options(factory, options);
    println!(
        "Gateway: {} / {} on {}",
        gateway.mode(),
        gateway.isolation_level(),
        gateway.factory().config().to_url()
    );

    let token = CancellationToken::new();
    if let Some(ms) = cli.cancel_after_ms {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            token.cancel();
        });
    }

    for sql in &cli.statements {
        let mut cmd = MemoryCommand::new(sql.as_str());

        let result: cmdgate::Result<u64> = if cli.use_async {
            gateway
                .query_command_async(
                    &mut cmd,
                    |bound, token| Box::pin(async move { bound.run_non_query_async(&token).await }),
                    token.clone(),
                )
                .await
        } else {
            gateway.query_command(&mut cmd, |bound| bound.run_non_query())
        };

        match result {
            Ok(affected) => println!("{sql} -> {affected} statement(s)"),
            Err(GatewayError::Cancelled) => {
                println!("{sql} -> cancelled");
                break;
            }
            Err(err) => return Err(err).with_context(|| format!("failed to run '{sql}'")),
        }
    }

    println!("Trace:");
    for event in gateway.factory().trace().events() {
        println!("  {event}");
    }
    println!("{}", gateway.stats());

    gateway.dispose();
    Ok(())
}
