use mailflow::api::ApiServer;
use mailflow::broker::Broker;
use mailflow::compose::Composer;
use mailflow::outbound::TransferWorker;
use mailflow::store::LocalDocumentStore;
use mailflow::MailSettings;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
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
    let store = Arc::new(LocalDocumentStore::new(
        std::env::var("FILE_STORE_ROOT").unwrap_or_else(|_| "./files".to_owned()),
        settings.site_url.clone(),
    ));
    let composer = Arc::new(Composer::new(pool.clone(), store, settings.clone()));
    let transfer = Arc::new(TransferWorker::new(pool.clone(), broker, &settings));

    let socket: SocketAddr = std::env::var("HTTP_SOCKET")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_owned())
        .parse()?;

    let shutdown = CancellationToken::new();
    let server = ApiServer::new(socket, pool, composer, transfer, settings, shutdown.clone());
    let handle = server.spawn();

    mailflow::shutdown_signal(shutdown.clone()).await;
    shutdown.cancel();
    handle.await?;

    Ok(())
}
