use color_eyre::eyre::{WrapErr, eyre};
use migration::{Migrator, MigratorTrait};
use newsletter::api::{AppState, shutdown_signal, start_webserver};
use newsletter::bot_gate::TurnstileBotGate;
use newsletter::config::{QueueBackend, load_config};
use newsletter::dispatch::{
    BatchSettings, DispatchQueue, EmailDeliveryWorker, JobSource, MemoryDispatchQueue,
    RetryPolicy, SeaOrmDispatchQueue, spawn_consumers,
};
use newsletter::links::LinkBuilder;
use newsletter::logging::init_tracing;
use newsletter::mailer::SmtpEmailTransport;
use newsletter::service::SubscriptionService;
use newsletter::store::SeaOrmSubscriberStore;
use newsletter::token::TokenService;
use rustls::crypto;
use rustls::crypto::CryptoProvider;
use sea_orm::Database;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    init_tracing();

    let config = Arc::new(load_config().wrap_err("Failed to load configuration")?);

    let ring_provider = crypto::ring::default_provider();
    CryptoProvider::install_default(ring_provider)
        .map_err(|_| eyre!("Failed to install crypto provider"))?;

    let db = Arc::new(
        Database::connect(&config.database_url)
            .await
            .wrap_err("Failed to connect to database")?,
    );
    if config.run_migrations {
        Migrator::up(db.as_ref(), None)
            .await
            .wrap_err("Failed to apply migrations")?;
        tracing::info!(
            name = "main.migrations.applied",
            target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
            message = "Database migrations applied"
        );
    }

    let tokens = TokenService::from_config(&config.token)
        .map_err(|e| eyre!("Invalid token secret: {e}"))?;
    let links = LinkBuilder::new(&config.public_base_url).wrap_err("Invalid public_base_url")?;
    let transport = Arc::new(SmtpEmailTransport::from_config(&config.smtp)?);
    let bot_gate = Arc::new(TurnstileBotGate::new(&config.bot_gate)?);

    let (queue, source): (Arc<dyn DispatchQueue>, Arc<dyn JobSource>) =
        match config.dispatch.backend {
            QueueBackend::Database => {
                let queue = Arc::new(SeaOrmDispatchQueue::new(
                    db.clone(),
                    config.dispatch.visibility_timeout(),
                    config.dispatch.poll_interval(),
                ));
                (queue.clone(), queue)
            }
            QueueBackend::Memory => {
                tracing::warn!(
                    name = "main.dispatch.memory_backend",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    message = "Using the in-memory dispatch queue; queued emails are lost on restart"
                );
                let queue = Arc::new(MemoryDispatchQueue::new());
                (queue.clone(), queue)
            }
        };

    let worker = Arc::new(EmailDeliveryWorker::new(
        transport,
        tokens.clone(),
        links,
        RetryPolicy::from(&config.dispatch),
        config.dispatch.skip_domains.clone(),
    ));
    let running = Arc::new(AtomicBool::new(true));
    let consumers = spawn_consumers(
        worker,
        source,
        BatchSettings::from(&config.dispatch),
        config.dispatch.consumers,
        running.clone(),
    );

    let service = SubscriptionService::new(
        Arc::new(SeaOrmSubscriberStore::new(db.clone())),
        bot_gate,
        queue,
        tokens,
    )
    .with_bot_check_help_url(config.bot_gate.help_url.clone());
    let state = AppState { service, db };

    let served = start_webserver(config.listen_addr, state, shutdown_signal()).await;

    // Consumers finish their current batch before exiting.
    running.store(false, Ordering::Relaxed);
    for consumer in consumers {
        if let Err(e) = consumer.await {
            tracing::error!(
                name = "main.shutdown.consumer_failed",
                target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                error = %e,
                message = "Dispatch consumer ended abnormally"
            );
        }
    }

    served
}
