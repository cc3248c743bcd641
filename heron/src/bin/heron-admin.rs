//! heron-admin - HTTP administration server for a Redis-backed heron topology.
//!
//! Serves the dead-letter and queue inspection API. The process only
//! inspects and repairs queues; it never consumes jobs.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;

use heron::telemetry::init_tracing;
use heron::{
    BrokerConnection, HeronConfig, InMemoryLedger, InProcEventBus, JobEventPublisher, JobLedger,
    JobProducer, QueueInspector, RedisConnector, Topology,
};

#[derive(Debug, Parser)]
#[command(name = "heron-admin", version, about = "Queue and dead-letter administration API")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8080", env = "HERON_ADMIN_BIND")]
    bind: SocketAddr,

    /// Optional TOML configuration file; `HERON__*` variables override it.
    #[arg(long, short)]
    config: Option<String>,

    /// Postgres URL for the job ledger. Without it, `/jobs/{id}` only knows
    /// about retries made through this process.
    #[cfg(feature = "postgres")]
    #[arg(long, env = "HERON_LEDGER_URL")]
    ledger_url: Option<String>,
}

async fn ledger(args: &Args) -> anyhow::Result<Arc<dyn JobLedger>> {
    #[cfg(feature = "postgres")]
    if let Some(url) = &args.ledger_url {
        let pool = sqlx::PgPool::connect(url)
            .await
            .context("failed to connect to the ledger database")?;
        let ledger = heron::PostgresLedger::new(pool);
        ledger.migrate().await?;
        return Ok(Arc::new(ledger));
    }

    let _ = args;
    Ok(Arc::new(InMemoryLedger::new()))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = HeronConfig::load(args.config.as_deref())?;
    init_tracing(&config.logging)?;

    let connection = Arc::new(BrokerConnection::new(
        Arc::new(RedisConnector::new(config.redis.clone())),
        Topology::from_config(&config.topology),
    ));
    // Fail fast on an unreachable broker instead of on the first request.
    connection.acquire().await?;

    let ledger = ledger(&args).await?;
    let events: Arc<dyn JobEventPublisher> = Arc::new(InProcEventBus::default());
    let producer = JobProducer::new(
        Arc::clone(&connection),
        Arc::clone(&ledger),
        Arc::clone(&events),
    );
    let inspector = QueueInspector::new(producer, ledger, events);

    let listener = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(
        bind = %args.bind,
        main_queue = %config.topology.main_queue,
        dead_letter_queue = %config.topology.dead_letter_queue,
        "heron-admin listening"
    );

    axum::serve(listener, heron::admin::router(inspector))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("admin server failed")?;

    connection.shutdown().await?;
    tracing::info!("heron-admin stopped");
    Ok(())
}
