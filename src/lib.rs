use actix_web::{
    middleware::{NormalizePath, TrailingSlash},
    App, HttpServer,
};
use applier::TaskApplier;
use broker::amqp::{AmqpChannel, Topology};
use classifier::DeliveryClassifier;
use config::Config;
use consumer::Consumer;
use store::sqlite::SqliteStore;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod applier;
pub mod broker;
pub mod classifier;
pub mod config;
pub mod consumer;
pub mod error;
pub mod health;
pub mod message;
pub mod store;
pub mod task;

/// Returns a builder for the worker process.
///
/// Runs the queue consumer on its own task next to the liveness endpoint
/// until Ctrl-C or SIGTERM, a broker failure, or the HTTP server exits.
#[bon::builder(finish_fn = start)]
pub async fn run(config: Option<Config>) -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("TASKWORKER_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("TASKWORKER_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };

    let store = SqliteStore::connect(&config).await?;

    let (connection, channel) = broker::amqp::connect(&config).await?;
    let topology = Topology::from(&config);
    topology.declare(&channel).await?;
    let channel = AmqpChannel::new(channel, &topology);
    let deliveries = channel.subscribe(&config).await?;

    let consumer = Consumer::builder()
        .applier(TaskApplier::new(store.clone()))
        .classifier(DeliveryClassifier::new(
            channel,
            config.queue_name(),
            config.max_retries(),
        ))
        .build();

    let shutdown = CancellationToken::new();
    let mut consumer_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { consumer.run(deliveries, shutdown).await }
    });
    tracing::info!("Consumer task started");

    let server = HttpServer::new(|| {
        App::new()
            .wrap(TracingLogger::default())
            .wrap(NormalizePath::new(TrailingSlash::Trim))
            .service(health::service())
    })
    .bind(config.health_addr())?
    .disable_signals()
    .run();
    let server_handle = server.handle();
    tokio::pin!(server);

    let stop_requested = shutdown_signal()?;
    let mut consumer_done = false;
    let mut server_done = false;
    let result: eyre::Result<()> = tokio::select! {
        _ = stop_requested => {
            tracing::info!("Shutdown requested");
            Ok(())
        }
        res = &mut consumer_task => {
            consumer_done = true;
            match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(e.into()),
            }
        }
        res = &mut server => {
            server_done = true;
            tracing::warn!("Health server exited");
            res.map_err(Into::into)
        }
    };

    shutdown.cancel();
    if !consumer_done {
        if let Ok(Err(e)) = consumer_task.await {
            tracing::error!(error = %e, "Consumer stopped with error");
        }
    }

    if !server_done {
        // The server future drives its own shutdown, so keep polling it.
        let ((), res) = tokio::join!(server_handle.stop(true), &mut server);
        if let Err(e) = res {
            tracing::warn!(error = %e, "Health server stopped with error");
        }
    }

    if let Err(e) = connection.close(200, "shutting down").await {
        tracing::warn!(error = %e, "Failed to close broker connection");
    }
    store.close().await;
    tracing::info!("Shutdown complete");

    result
}

/// Resolves on Ctrl-C, or on SIGTERM where there is one.
///
/// SIGTERM is registered before this returns, so a signal sent after the call
/// is never missed.
fn shutdown_signal() -> std::io::Result<impl std::future::Future<Output = ()>> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(async move {
        #[cfg(unix)]
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }

        #[cfg(not(unix))]
        let _ = tokio::signal::ctrl_c().await;
    })
}
