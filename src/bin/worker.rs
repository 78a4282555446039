use mailflow::broker::Broker;
use mailflow::compose::Composer;
use mailflow::events::EventBus;
use mailflow::inbound::IntakeWorker;
use mailflow::outbound::TransferWorker;
use mailflow::periodically::Scheduler;
use mailflow::status::StatusReconciler;
use mailflow::store::LocalDocumentStore;
use mailflow::MailSettings;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    mailflow::init_tracing();

    let settings = MailSettings::from_env();
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/mailflow".to_owned());

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;

    let broker = Broker::connect(&settings.broker)?;
    let events = EventBus::default();
    let store = Arc::new(LocalDocumentStore::new(
        std::env::var("FILE_STORE_ROOT").unwrap_or_else(|_| "./files".to_owned()),
        settings.site_url.clone(),
    ));

    let composer = Arc::new(Composer::new(pool.clone(), store.clone(), settings.clone()));
    let transfer = Arc::new(TransferWorker::new(
        pool.clone(),
        broker.clone(),
        &settings,
    ));
    let intake = Arc::new(IntakeWorker::new(
        pool.clone(),
        store,
        composer.clone(),
        broker.clone(),
        events.clone(),
        settings.clone(),
    ));
    let reconciler = Arc::new(StatusReconciler::new(
        pool.clone(),
        broker.clone(),
        events,
    ));

    let shutdown = CancellationToken::new();
    let scheduler = Arc::new(Scheduler::new(
        pool,
        transfer,
        intake,
        reconciler,
        composer,
        broker,
        settings,
        shutdown.clone(),
    ));
    scheduler.spawn();

    mailflow::shutdown_signal(shutdown.clone()).await;
    shutdown.cancel();

    Ok(())
}
