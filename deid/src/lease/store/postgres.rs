use std::time::Duration;

use deid_config::shared::{IntoConnectOptions, LEASE_STORE_OPTIONS, PgConnectionConfig};
use deid_postgres::leases::{self, LeaseRow};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tracing::debug;

use crate::error::{DeidError, DeidResult, ErrorKind};
use crate::lease::LeaseRecord;
use crate::lease::store::{CreateOutcome, LeaseStore, UpdateOutcome};
use crate::deid_error;

/// Two connections let a renewal proceed while the owner performs its own lease call.
const MAX_POOL_CONNECTIONS: u32 = 2;

/// Idle connections are closed after this long, lease traffic being sparse.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Lease store backed by the `deid.leases` table.
///
/// Reads go to the same primary as the writes, so a read observes every write that completed
/// before it.
#[derive(Debug, Clone)]
pub struct PostgresLeaseStore {
    pool: PgPool,
}

impl PostgresLeaseStore {
    /// Creates a store over a lazily connected pool. No connection is opened until first use.
    pub fn new(config: &PgConnectionConfig) -> Self {
        let options: PgConnectOptions = config.with_db(Some(&LEASE_STORE_OPTIONS));

        let pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(MAX_POOL_CONNECTIONS)
            .idle_timeout(Some(IDLE_TIMEOUT))
            .connect_lazy_with(options);

        Self { pool }
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl TryFrom<LeaseRow> for LeaseRecord {
    type Error = DeidError;

    fn try_from(row: LeaseRow) -> Result<Self, Self::Error> {
        let version = u64::try_from(row.version).map_err(|_| {
            deid_error!(
                ErrorKind::InvalidData,
                "Stored lease version is negative",
                format!("lease `{}`", row.name)
            )
        })?;

        Ok(LeaseRecord {
            name: row.name,
            owner: row.owner,
            expires_at: row.expires_at,
            version,
        })
    }
}

impl TryFrom<LeaseRecord> for LeaseRow {
    type Error = DeidError;

    fn try_from(record: LeaseRecord) -> Result<Self, Self::Error> {
        let version = to_row_version(record.version, &record.name)?;

        Ok(LeaseRow {
            name: record.name,
            owner: record.owner,
            expires_at: record.expires_at,
            version,
        })
    }
}

fn to_row_version(version: u64, name: &str) -> DeidResult<i64> {
    i64::try_from(version).map_err(|_| {
        deid_error!(
            ErrorKind::InvalidData,
            "Lease version does not fit the lease table",
            format!("lease `{name}`")
        )
    })
}

impl LeaseStore for PostgresLeaseStore {
    async fn get(&self, name: &str) -> DeidResult<Option<LeaseRecord>> {
        let row = leases::get_lease(&self.pool, name).await?;

        row.map(LeaseRecord::try_from).transpose()
    }

    async fn put_if_absent(&self, record: LeaseRecord) -> DeidResult<CreateOutcome> {
        let row = LeaseRow::try_from(record)?;
        let created = leases::insert_lease_if_absent(&self.pool, &row).await?;

        debug!(lease = %row.name, created, "lease create attempted");

        Ok(if created {
            CreateOutcome::Created
        } else {
            CreateOutcome::AlreadyExists
        })
    }

    async fn put_if_version(
        &self,
        record: LeaseRecord,
        expected_version: u64,
    ) -> DeidResult<UpdateOutcome> {
        let expected_version = to_row_version(expected_version, &record.name)?;
        let row = LeaseRow::try_from(record)?;
        let updated = leases::update_lease_if_version(&self.pool, &row, expected_version).await?;

        debug!(lease = %row.name, expected_version, updated, "lease update attempted");

        Ok(if updated {
            UpdateOutcome::Updated
        } else {
            UpdateOutcome::VersionMismatch
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn negative_versions_are_rejected() {
        let row = LeaseRow {
            name: "identity".to_string(),
            owner: None,
            expires_at: Utc::now(),
            version: -1,
        };

        let err = LeaseRecord::try_from(row).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn records_convert_to_rows() {
        let record = LeaseRecord {
            name: "identity".to_string(),
            owner: Some("runner-1".to_string()),
            expires_at: Utc::now(),
            version: 4,
        };

        let row = LeaseRow::try_from(record.clone()).unwrap();
        assert_eq!(row.version, 4);
        assert_eq!(LeaseRecord::try_from(row).unwrap(), record);
    }

    #[test]
    fn oversized_versions_are_rejected() {
        let err = to_row_version(u64::MAX, "identity").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let record = LeaseRecord {
            name: "identity".to_string(),
            owner: None,
            expires_at: Utc::now(),
            version: u64::MAX,
        };
        let err = LeaseRow::try_from(record).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
