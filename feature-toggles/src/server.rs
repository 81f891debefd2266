use std::future::Future;
use std::net::SocketAddr;

use anyhow::Context;
use chrono::Utc;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::router;
use crate::store::memory::MemoryStore;
use crate::store::postgres::PgStore;
use crate::store::{StoreResult, Stores};
use crate::time::SystemTime;
use crate::tokens::token_resolver::seed_tokens;

/// Connects the configured backend, Postgres when `DATABASE_URL` is set and memory otherwise.
pub async fn build_stores(config: &Config) -> StoreResult<Stores> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::new(url, config.max_pg_connections).await?;
            if *config.run_migrations {
                store.run_migrations().await?;
                tracing::info!("ran database migrations");
            }
            tracing::info!("using postgres store");
            Ok(Stores::from_backend(store))
        }
        None => {
            tracing::warn!("DATABASE_URL is not set, state is kept in memory only");
            Ok(Stores::from_backend(MemoryStore::new()))
        }
    }
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let stores = build_stores(&config)
        .await
        .context("failed to set up the store")?;

    let seeded = seed_tokens(stores.tokens.as_ref(), &config, Utc::now())
        .await
        .context("failed to seed configured tokens")?;
    if seeded > 0 {
        tracing::info!(seeded, "inserted configured tokens");
    }

    let app = router::router(stores, SystemTime {}, &config);

    tracing::info!("listening on {:?}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}
