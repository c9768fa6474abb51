// Main entry point for the bisect job dispatcher.

use std::sync::Arc;

use anyhow::{Context, Result};
use dispatcher_core::server::build_app;
use dispatcher_core::{clone_url::StaticCloneUrlProvider, control_loops, Config, Instance};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dispatcher_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting bisect job dispatcher");

    let config = Config::from_env().context("failed to load configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let bind_addr = config.bind_addr.clone();
    let jwt_secret = config.jwt_secret.clone();

    let instance = Arc::new(Instance::new(
        pool,
        config,
        Arc::new(StaticCloneUrlProvider::default()),
    ));

    tokio::spawn(control_loops::heartbeat_loop(instance.clone()));
    tokio::spawn(control_loops::pickup_loop(instance.clone()));
    tokio::spawn(control_loops::recovery_loop(instance.clone()));

    let app = build_app(instance.clone(), &jwt_secret, &[]);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .context("failed to bind to address")?;

    tracing::info!(%bind_addr, "listening");

    let shutdown_instance = instance.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown_instance.shutdown().await;
    })
    .await
    .context("server error")?;

    Ok(())
}
