use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::Arc;

use deid_config::shared::MergePolicyConfig;
use metrics::counter;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bail;
use crate::error::{DeidResult, ErrorKind};
use crate::identity::codec::encode_record;
use crate::identity::{
    GroupingKey, IdentifierCatalog, IdentifierType, IdentityRecord, IdentitySnapshot, SetOutcome,
};
use crate::metrics::{DEID_IDENTITIES_RESOLVED_TOTAL, DEID_MERGE_CONFLICTS_TOTAL, OUTCOME_LABEL};

/// How a value conflict within one identifier type is settled while merging partial records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergePolicy {
    /// The first value in input order wins. Depends on the order partials arrive in.
    #[default]
    FirstSeen,
    /// The smallest value wins, whatever the input order.
    LeastValue,
}

impl From<MergePolicyConfig> for MergePolicy {
    fn from(config: MergePolicyConfig) -> Self {
        match config {
            MergePolicyConfig::FirstSeen => MergePolicy::FirstSeen,
            MergePolicyConfig::LeastValue => MergePolicy::LeastValue,
        }
    }
}

/// Mints pseudonyms for entities missing from the snapshot.
pub trait PseudonymGenerator: Debug + Send + Sync {
    fn generate(&self) -> String;
}

/// Mints random version 4 UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidPseudonymGenerator;

impl PseudonymGenerator for UuidPseudonymGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Whether a resolved pseudonym came from the snapshot or was minted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudonymOrigin {
    Reused,
    Minted,
}

impl PseudonymOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            PseudonymOrigin::Reused => "reused",
            PseudonymOrigin::Minted => "minted",
        }
    }
}

/// Canonical record produced for one main identifier key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub key: GroupingKey,
    pub record: IdentityRecord,
    pub origin: PseudonymOrigin,
    /// Types that had several values among the partial records.
    pub conflicts: Vec<IdentifierType>,
}

impl Resolution {
    pub fn pseudonym(&self) -> Option<&str> {
        self.record.pseudonym()
    }

    /// The canonical line of the record.
    pub fn encode(&self) -> String {
        encode_record(&self.record)
    }
}

/// Merges the partial records of one key and assigns the entity its pseudonym.
///
/// Only keys of the main identifier type produce canonical records. Keys of other types exist
/// for co-location and resolve to nothing.
#[derive(Debug, Clone)]
pub struct IdentityResolutionStage {
    catalog: IdentifierCatalog,
    snapshot: Arc<IdentitySnapshot>,
    merge_policy: MergePolicy,
    generator: Arc<dyn PseudonymGenerator>,
}

impl IdentityResolutionStage {
    pub fn new(
        catalog: IdentifierCatalog,
        snapshot: Arc<IdentitySnapshot>,
        merge_policy: MergePolicy,
    ) -> Self {
        Self {
            catalog,
            snapshot,
            merge_policy,
            generator: Arc::new(UuidPseudonymGenerator),
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn PseudonymGenerator>) -> Self {
        self.generator = generator;
        self
    }

    /// Resolves `key` given every partial record emitted under it.
    ///
    /// 1. Merge the partials into a working record seeded with the key's own value.
    /// 2. Reuse the snapshot's pseudonym only if the snapshot entry for the key holds the key
    ///    value as its main identifier. Identifiers the snapshot knows and this run lacks are
    ///    carried forward.
    /// 3. Otherwise mint a new pseudonym.
    pub fn resolve(
        &self,
        key: &GroupingKey,
        partials: &[IdentityRecord],
    ) -> DeidResult<Option<Resolution>> {
        if key.identifier_type != self.catalog.main() {
            return Ok(None);
        }

        let (mut record, conflicts) = self.merge(key, partials)?;

        let origin = match self.snapshot.record_for(&key.value) {
            Some(known) => {
                for (ty, value) in known.iter() {
                    if !record.contains(ty) {
                        record.set(ty, value.clone())?;
                    }
                }
                PseudonymOrigin::Reused
            }
            None => {
                let pseudonym = self.generator.generate();
                let Some(value) = IdentifierType::PSEUDONYM.recognize(&pseudonym) else {
                    bail!(
                        ErrorKind::InvalidIdentifier,
                        "Minted pseudonym does not match the pseudonym format",
                        format!("generator {:?}", self.generator)
                    );
                };
                record.set(IdentifierType::PSEUDONYM, value)?;
                PseudonymOrigin::Minted
            }
        };

        counter!(DEID_IDENTITIES_RESOLVED_TOTAL, OUTCOME_LABEL => origin.as_str()).increment(1);
        if !conflicts.is_empty() {
            counter!(DEID_MERGE_CONFLICTS_TOTAL).increment(conflicts.len() as u64);
            warn!(
                identifier_types = ?conflicts.iter().map(IdentifierType::field_name).collect::<Vec<_>>(),
                partials = partials.len(),
                "partial records disagree on identifier values"
            );
        }

        Ok(Some(Resolution {
            key: key.clone(),
            record,
            origin,
            conflicts,
        }))
    }

    /// Resolves every group, skipping keys that produce no canonical record.
    pub fn resolve_groups(
        &self,
        groups: &BTreeMap<GroupingKey, Vec<IdentityRecord>>,
    ) -> DeidResult<Vec<Resolution>> {
        let mut resolutions = Vec::new();
        for (key, partials) in groups {
            if let Some(resolution) = self.resolve(key, partials)? {
                resolutions.push(resolution);
            }
        }

        let minted = resolutions
            .iter()
            .filter(|resolution| resolution.origin == PseudonymOrigin::Minted)
            .count();
        debug!(
            groups = groups.len(),
            resolved = resolutions.len(),
            minted,
            "groups resolved"
        );

        Ok(resolutions)
    }

    fn merge(
        &self,
        key: &GroupingKey,
        partials: &[IdentityRecord],
    ) -> DeidResult<(IdentityRecord, Vec<IdentifierType>)> {
        let mut working = IdentityRecord::new();
        working.set(key.identifier_type, key.value.clone())?;

        let mut conflicts = BTreeSet::new();
        for partial in partials {
            for (ty, value) in partial.iter() {
                if ty.is_pseudonym() {
                    continue;
                }

                match self.merge_policy {
                    MergePolicy::FirstSeen => {
                        if working.set_if_absent(ty, value.clone())? == SetOutcome::Conflict {
                            conflicts.insert(ty);
                        }
                    }
                    MergePolicy::LeastValue => match working.get(ty) {
                        None => working.set(ty, value.clone())?,
                        Some(current) if current == value => {}
                        Some(current) => {
                            conflicts.insert(ty);
                            if ty != key.identifier_type && value < current {
                                working.set(ty, value.clone())?;
                            }
                        }
                    },
                }
            }
        }

        Ok((working, conflicts.into_iter().collect()))
    }
}
