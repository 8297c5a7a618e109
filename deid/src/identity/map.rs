use std::collections::BTreeMap;

use tracing::debug;

use crate::error::DeidResult;
use crate::identity::policy::BoundPolicy;
use crate::identity::{
    IdentifierCatalog, IdentifierType, IdentifierValue, IdentityRecord, SetOutcome,
    TableIdentityPolicy,
};
use crate::types::{RawRecord, TableLayout};

/// Key under which partial records are co-located for resolution: one identifier value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupingKey {
    pub identifier_type: IdentifierType,
    pub value: IdentifierValue,
}

impl GroupingKey {
    pub fn new(identifier_type: IdentifierType, value: impl Into<IdentifierValue>) -> Self {
        Self {
            identifier_type,
            value: value.into(),
        }
    }
}

/// Extracts partial identity records from the raw records of one table.
#[derive(Debug, Clone)]
pub struct IdentityMapStage {
    catalog: IdentifierCatalog,
    table: String,
    policy: BoundPolicy,
}

impl IdentityMapStage {
    /// Fails with a configuration error if `policy` does not fit `layout`.
    pub fn new(
        catalog: IdentifierCatalog,
        policy: &TableIdentityPolicy,
        layout: &TableLayout,
    ) -> DeidResult<Self> {
        let bound = policy.bind(layout)?;

        Ok(Self {
            catalog,
            table: policy.table.clone(),
            policy: bound,
        })
    }

    /// Emits one `(key, partial)` pair per distinct identifier value in `record`.
    ///
    /// The partial holds every identifier of the record, the first value winning when a type
    /// appears twice. A record without identifiers yields nothing. A record carrying several
    /// main identifier values cannot say which entity its other identifiers belong to, so each
    /// main key gets a partial holding only its own value and the other keys get the partial
    /// without main identifier.
    pub fn map_record(&self, record: &RawRecord) -> DeidResult<Vec<(GroupingKey, IdentityRecord)>> {
        let mut keys: Vec<GroupingKey> = Vec::new();
        for column in &self.policy.identifier_columns {
            let Some(text) = record.get(column.index) else {
                continue;
            };
            let Some((ty, value)) = column.classify(&self.table, text)? else {
                continue;
            };

            let key = GroupingKey::new(ty, value);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut partial = IdentityRecord::new();
        let mut repeated_types = Vec::new();
        for key in &keys {
            if partial.set_if_absent(key.identifier_type, key.value.clone())? == SetOutcome::Conflict
            {
                repeated_types.push(key.identifier_type);
            }
        }

        let main = self.catalog.main();
        if !repeated_types.contains(&main) {
            return Ok(keys
                .into_iter()
                .map(|key| (key, partial.clone()))
                .collect());
        }

        debug!(
            table = %self.table,
            "record carries several main identifier values, splitting its partials"
        );
        partial.remove(main);

        let mut pairs = Vec::with_capacity(keys.len());
        for key in keys {
            if key.identifier_type == main {
                let mut own = IdentityRecord::new();
                own.set(main, key.value.clone())?;
                pairs.push((key, own));
            } else {
                pairs.push((key, partial.clone()));
            }
        }

        Ok(pairs)
    }

    /// Maps every record of a shard.
    pub fn map_shard<'a, I>(&self, records: I) -> DeidResult<Vec<(GroupingKey, IdentityRecord)>>
    where
        I: IntoIterator<Item = &'a RawRecord>,
    {
        let mut pairs = Vec::new();
        let mut records_without_identifiers = 0usize;
        for record in records {
            let mapped = self.map_record(record)?;
            if mapped.is_empty() {
                records_without_identifiers += 1;
            }
            pairs.extend(mapped);
        }

        debug!(
            table = %self.table,
            pairs = pairs.len(),
            records_without_identifiers,
            "shard mapped"
        );

        Ok(pairs)
    }
}

/// Co-locates partial records by key, keeping their emission order within a key.
pub fn group_partials<I>(pairs: I) -> BTreeMap<GroupingKey, Vec<IdentityRecord>>
where
    I: IntoIterator<Item = (GroupingKey, IdentityRecord)>,
{
    let mut groups: BTreeMap<GroupingKey, Vec<IdentityRecord>> = BTreeMap::new();
    for (key, partial) in pairs {
        groups.entry(key).or_default().push(partial);
    }

    groups
}
