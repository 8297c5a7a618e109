use std::sync::Arc;

use deid_config::shared::UnresolvedPolicyConfig;
use metrics::counter;
use tracing::{debug, info};

use crate::bail;
use crate::error::{DeidResult, ErrorKind};
use crate::identity::policy::BoundColumn;
use crate::identity::{IdentifierCatalog, IdentitySnapshot, TableIdentityPolicy};
use crate::metrics::{DEID_RECORDS_SCRUBBED_TOTAL, OUTCOME_LABEL, TABLE_LABEL};
use crate::types::{RawRecord, TableLayout};

/// What to do with a record whose main identifier is not in the snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnresolvedIdentityPolicy {
    /// Fail the whole shard.
    #[default]
    Fail,
    /// Leave the record out of the output.
    Drop,
    /// Emit the record unchanged, in the raw layout.
    PassThrough,
}

impl From<UnresolvedPolicyConfig> for UnresolvedIdentityPolicy {
    fn from(config: UnresolvedPolicyConfig) -> Self {
        match config {
            UnresolvedPolicyConfig::Fail => UnresolvedIdentityPolicy::Fail,
            UnresolvedPolicyConfig::Drop => UnresolvedIdentityPolicy::Drop,
            UnresolvedPolicyConfig::PassThrough => UnresolvedIdentityPolicy::PassThrough,
        }
    }
}

/// Result of scrubbing one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrubOutcome {
    /// The record in the output layout.
    Scrubbed(RawRecord),
    Dropped,
    /// The raw record, passed through because its identity is unknown.
    Unscrubbed(RawRecord),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrubCounts {
    pub scrubbed: usize,
    pub dropped: usize,
    pub passed_through: usize,
}

/// Scrubbed output of one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrubbedShard {
    /// Records in the output layout.
    pub scrubbed: Vec<RawRecord>,
    /// Records passed through in the raw layout.
    pub unscrubbed: Vec<RawRecord>,
    pub counts: ScrubCounts,
}

#[derive(Debug, Clone)]
enum OutputColumn {
    Copy(usize),
    /// Pseudonym resolved from the main identifier held in the column.
    Pseudonym(BoundColumn),
}

/// Rewrites raw records of one table with pseudonyms in place of identifiers.
///
/// Identifier columns and other identifying columns are removed. An identifier column able to
/// carry the main identifier is replaced, at the same position, by a column holding the
/// pseudonym resolved through the snapshot.
#[derive(Debug, Clone)]
pub struct IdentityScrubbingStage {
    catalog: IdentifierCatalog,
    snapshot: Arc<IdentitySnapshot>,
    unresolved_policy: UnresolvedIdentityPolicy,
    input_width: usize,
    columns: Vec<OutputColumn>,
    output_layout: TableLayout,
}

impl IdentityScrubbingStage {
    /// Fails with a configuration error if `policy` does not fit `layout`.
    pub fn new(
        catalog: IdentifierCatalog,
        snapshot: Arc<IdentitySnapshot>,
        policy: &TableIdentityPolicy,
        layout: &TableLayout,
        unresolved_policy: UnresolvedIdentityPolicy,
    ) -> DeidResult<Self> {
        let bound = policy.bind(layout)?;

        let mut columns = Vec::with_capacity(layout.width());
        let mut names = Vec::with_capacity(layout.width());
        for (index, name) in layout.columns.iter().enumerate() {
            if let Some(column) = bound
                .identifier_columns
                .iter()
                .find(|column| column.index == index)
            {
                if column.may_carry(catalog.main()) {
                    columns.push(OutputColumn::Pseudonym(column.clone()));
                    names.push(TableIdentityPolicy::pseudonym_column_name(name));
                }
                continue;
            }
            if bound.pii_columns.contains(&index) {
                continue;
            }

            columns.push(OutputColumn::Copy(index));
            names.push(name.clone());
        }

        debug!(
            table = %layout.name,
            input_columns = layout.width(),
            output_columns = names.len(),
            "scrubbing stage built"
        );

        Ok(Self {
            catalog,
            snapshot,
            unresolved_policy,
            input_width: layout.width(),
            columns,
            output_layout: TableLayout::new(&layout.name, names),
        })
    }

    pub fn output_layout(&self) -> &TableLayout {
        &self.output_layout
    }

    pub fn unresolved_policy(&self) -> UnresolvedIdentityPolicy {
        self.unresolved_policy
    }

    /// Scrubs one record.
    ///
    /// A null main identifier cell, or a value of a multiplexed column that is not a main
    /// identifier, yields a null pseudonym. A main identifier missing from the snapshot is
    /// handled per the unresolved identity policy; under [`UnresolvedIdentityPolicy::Fail`]
    /// the error names the table and column, never the value.
    pub fn scrub(&self, record: &RawRecord) -> DeidResult<ScrubOutcome> {
        let table = &self.output_layout.name;
        if record.width() != self.input_width {
            bail!(
                ErrorKind::InvalidData,
                "Record width does not match the table layout",
                format!(
                    "table `{table}` expects {} cells, got {}",
                    self.input_width,
                    record.width()
                )
            );
        }

        let mut values = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            match column {
                OutputColumn::Copy(index) => values.push(record.values[*index].clone()),
                OutputColumn::Pseudonym(column) => {
                    let Some(text) = record.get(column.index) else {
                        values.push(None);
                        continue;
                    };
                    let main_value = match column.classify(table, text)? {
                        Some((ty, value)) if ty == self.catalog.main() => value,
                        _ => {
                            values.push(None);
                            continue;
                        }
                    };

                    match self.snapshot.pseudonym_for(&main_value) {
                        Some(pseudonym) => values.push(Some(pseudonym.to_string())),
                        None => return self.unresolved(record, &column.name),
                    }
                }
            }
        }

        Ok(ScrubOutcome::Scrubbed(RawRecord::new(values)))
    }

    /// Scrubs every record of a shard.
    ///
    /// Under [`UnresolvedIdentityPolicy::Fail`] the shard is all or nothing: the first
    /// unresolved record fails it and no output is returned.
    pub fn scrub_shard<'a, I>(&self, records: I) -> DeidResult<ScrubbedShard>
    where
        I: IntoIterator<Item = &'a RawRecord>,
    {
        let mut shard = ScrubbedShard::default();
        for record in records {
            match self.scrub(record)? {
                ScrubOutcome::Scrubbed(record) => {
                    shard.scrubbed.push(record);
                    shard.counts.scrubbed += 1;
                }
                ScrubOutcome::Dropped => shard.counts.dropped += 1,
                ScrubOutcome::Unscrubbed(record) => {
                    shard.unscrubbed.push(record);
                    shard.counts.passed_through += 1;
                }
            }
        }

        let table = self.output_layout.name.clone();
        for (outcome, count) in [
            ("scrubbed", shard.counts.scrubbed),
            ("dropped", shard.counts.dropped),
            ("passed_through", shard.counts.passed_through),
        ] {
            counter!(
                DEID_RECORDS_SCRUBBED_TOTAL,
                TABLE_LABEL => table.clone(),
                OUTCOME_LABEL => outcome
            )
            .increment(count as u64);
        }

        info!(
            table = %table,
            scrubbed = shard.counts.scrubbed,
            dropped = shard.counts.dropped,
            passed_through = shard.counts.passed_through,
            "shard scrubbed"
        );

        Ok(shard)
    }

    fn unresolved(&self, record: &RawRecord, column: &str) -> DeidResult<ScrubOutcome> {
        let table = &self.output_layout.name;
        match self.unresolved_policy {
            UnresolvedIdentityPolicy::Fail => {
                counter!(
                    DEID_RECORDS_SCRUBBED_TOTAL,
                    TABLE_LABEL => table.clone(),
                    OUTCOME_LABEL => "failed"
                )
                .increment(1);

                bail!(
                    ErrorKind::UnresolvedIdentity,
                    "Main identifier is missing from the identity snapshot",
                    format!("table `{table}` column `{column}`")
                );
            }
            UnresolvedIdentityPolicy::Drop => Ok(ScrubOutcome::Dropped),
            UnresolvedIdentityPolicy::PassThrough => Ok(ScrubOutcome::Unscrubbed(record.clone())),
        }
    }
}
