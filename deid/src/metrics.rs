//! Metric names emitted by the de-identification core.
//!
//! Labels never carry identifier values.

/// Label for the lease name.
pub const LEASE_LABEL: &str = "lease";

/// Label for the outcome of an operation.
pub const OUTCOME_LABEL: &str = "outcome";

/// Label for a table name.
pub const TABLE_LABEL: &str = "table";

/// Counter of lease acquire attempts, labeled by outcome (`acquired`, `held`, `raced`).
pub const DEID_LEASE_ACQUIRE_ATTEMPTS_TOTAL: &str = "deid_lease_acquire_attempts_total";

/// Counter of lease renewals, labeled by outcome (`renewed`, `lost`, `failed`).
pub const DEID_LEASE_RENEWALS_TOTAL: &str = "deid_lease_renewals_total";

/// Counter of canonical records emitted by resolution, labeled by outcome (`reused`, `minted`).
pub const DEID_IDENTITIES_RESOLVED_TOTAL: &str = "deid_identities_resolved_total";

/// Counter of identifier type conflicts detected while merging partial records.
pub const DEID_MERGE_CONFLICTS_TOTAL: &str = "deid_merge_conflicts_total";

/// Counter of raw records processed by scrubbing, labeled by table and outcome
/// (`scrubbed`, `dropped`, `passed_through`, `failed`).
pub const DEID_RECORDS_SCRUBBED_TOTAL: &str = "deid_records_scrubbed_total";

/// Gauge of records in the loaded identity snapshot.
pub const DEID_SNAPSHOT_RECORDS: &str = "deid_snapshot_records";
