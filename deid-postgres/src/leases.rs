//! Queries over the `deid.leases` table.
//!
//! Every statement is a single round trip. Conditional writes report whether they took effect
//! through the affected row count, so contention never surfaces as a database error.

use chrono::{DateTime, Utc};
use sqlx::prelude::FromRow;
use sqlx::{PgExecutor, PgPool};

/// A row of the `deid.leases` table.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct LeaseRow {
    pub name: String,
    pub owner: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub version: i64,
}

/// Reads the lease named `name`.
pub async fn get_lease(pool: &PgPool, name: &str) -> sqlx::Result<Option<LeaseRow>> {
    sqlx::query_as::<_, LeaseRow>(
        r#"
        select name, owner, expires_at, version
        from deid.leases
        where name = $1
        "#,
    )
    .bind(name)
    .fetch_optional(pool)
    .await
}

/// Inserts `lease` unless a lease with the same name exists.
///
/// Returns `true` when the row was written.
pub async fn insert_lease_if_absent<'c, E>(executor: E, lease: &LeaseRow) -> sqlx::Result<bool>
where
    E: PgExecutor<'c>,
{
    let result = sqlx::query(
        r#"
        insert into deid.leases (name, owner, expires_at, version)
        values ($1, $2, $3, $4)
        on conflict (name) do nothing
        "#,
    )
    .bind(&lease.name)
    .bind(&lease.owner)
    .bind(lease.expires_at)
    .bind(lease.version)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Overwrites the lease only if its stored version still equals `expected_version`.
///
/// Returns `true` when the row was written.
pub async fn update_lease_if_version<'c, E>(
    executor: E,
    lease: &LeaseRow,
    expected_version: i64,
) -> sqlx::Result<bool>
where
    E: PgExecutor<'c>,
{
    let result = sqlx::query(
        r#"
        update deid.leases
        set owner = $2, expires_at = $3, version = $4, updated_at = now()
        where name = $1 and version = $5
        "#,
    )
    .bind(&lease.name)
    .bind(&lease.owner)
    .bind(lease.expires_at)
    .bind(lease.version)
    .bind(expected_version)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}
