//! Outbox relay
//!
//! Polls the PostgreSQL outbox table and hands events to the transport until
//! Ctrl+C. No broker client ships with the relay: it only starts with
//! `--dry-run`, which acknowledges events without delivering them.

mod settings;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use outbox_engine_core::{
    EventPublisher, LoggingDlqHandler, MetricsCollector, NoOpEventPublisher, OutboxRepository,
    PrefixTopicMapper, SchedulerBuilder,
};
use outbox_engine_metrics::PrometheusMetricsCollector;
use outbox_engine_pg::PostgresOutboxRepository;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::settings::RelaySettings;

#[derive(Parser, Debug)]
#[command(name = "outbox-relay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Relays transactional outbox events to the message transport")]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Extra configuration file layered over config/default
    #[arg(short, long)]
    config: Option<String>,

    /// Acknowledge every event without delivering it. Marks rows published.
    #[arg(long)]
    dry_run: bool,
}

/// The relay has no broker client, so only the acknowledge-everything
/// dry-run transport is available and it must be asked for explicitly.
fn select_transport(dry_run: bool) -> anyhow::Result<Arc<dyn EventPublisher>> {
    if !dry_run {
        anyhow::bail!(
            "no message transport configured; pass --dry-run to acknowledge events without delivering them"
        );
    }
    warn!("Dry run: events are marked published without being delivered");
    Ok(Arc::new(NoOpEventPublisher::new()))
}

fn setup_logging(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("outbox={}", level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        warn!("Global tracing subscriber already set");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(args.debug);

    let event_publisher = select_transport(args.dry_run)?;
    let settings =
        RelaySettings::load(args.config.as_deref()).context("Failed to load relay settings")?;
    let scheduler_config = settings.scheduler_config();
    let publisher_config = settings.publisher_config();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        tenant_id = scheduler_config.tenant_id.as_deref().unwrap_or("all"),
        poll_interval = ?scheduler_config.poll_interval,
        batch_size = scheduler_config.batch_size,
        "Starting outbox relay"
    );

    let pool = PgPoolOptions::new()
        .max_connections(settings.database.max_connections)
        .connect(&settings.database.url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    let repository = PostgresOutboxRepository::new(pool.clone());
    if settings.database.run_migrations {
        repository
            .run_migrations()
            .await
            .context("Failed to run outbox migrations")?;
    }

    let metrics = PrometheusMetricsCollector::new().context("Failed to register metrics")?;
    let dlq = Arc::new(LoggingDlqHandler);
    let repository: Arc<dyn OutboxRepository> = Arc::new(repository);

    let mut builder = SchedulerBuilder::new()
        .repository(repository)
        .event_publisher(event_publisher)
        .scheduler_config(scheduler_config)
        .publisher_config(publisher_config)
        .dlq_handler(dlq.clone())
        .dlq_alert_handler(dlq)
        .metrics_collector(Arc::new(metrics.clone()) as Arc<dyn MetricsCollector>)
        .error_handler(|event, err| match event {
            Some(event) => error!(event_id = %event.id, error = %err, "Outbox event failed"),
            None => error!(error = %err, "Outbox relay error"),
        });
    if let Some(prefix) = &settings.publisher.topic_prefix {
        builder = builder.topic_mapper(Arc::new(PrefixTopicMapper::new(prefix.as_str(), "", ".")));
    }
    let scheduler = builder.build().context("Invalid relay configuration")?;

    let cancel = CancellationToken::new();
    scheduler.publisher().start_ack_listener(&cancel);
    scheduler.start(cancel.clone())?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    if let Err(e) = scheduler.stop().await {
        warn!(error = %e, "Scheduler did not stop cleanly");
    }
    cancel.cancel();
    scheduler.publisher().stop_ack_listener().await;

    if let Some(snapshot) = scheduler.metrics() {
        info!(
            polls = snapshot.poll_count,
            processed = snapshot.processed_count,
            retried = snapshot.retried_count,
            cleaned = snapshot.cleaned_count,
            errors = snapshot.error_count,
            "Outbox relay totals"
        );
    }
    match metrics.gather() {
        Ok(text) => debug!(metrics = %text, "Final metrics"),
        Err(e) => warn!(error = %e, "Failed to render metrics"),
    }

    pool.close().await;
    info!("Outbox relay stopped");
    Ok(())
}
