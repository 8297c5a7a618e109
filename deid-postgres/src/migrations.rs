use deid_config::shared::{IntoConnectOptions, MIGRATION_OPTIONS, PgConnectionConfig};
use sqlx::Executor;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tracing::info;

const NUM_POOL_CONNECTIONS: u32 = 1;

/// Creates the `deid` schema and applies pending migrations to it.
pub async fn migrate_lease_store(connection_config: &PgConnectionConfig) -> Result<(), sqlx::Error> {
    let options: PgConnectOptions = connection_config.with_db(Some(&MIGRATION_OPTIONS));

    let pool = PgPoolOptions::new()
        .max_connections(NUM_POOL_CONNECTIONS)
        .min_connections(NUM_POOL_CONNECTIONS)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("create schema if not exists deid;").await?;
                // Keeps the `_sqlx_migrations` bookkeeping table inside the `deid` schema.
                conn.execute("set search_path = 'deid';").await?;
                Ok(())
            })
        })
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("lease store migrations applied");

    Ok(())
}
