//! Publication of snapshot generations.
//!
//! Each generation is a directory named by its zero-padded number under a common root. A
//! generation is written to a hidden temporary directory and renamed into place once all its
//! partitions are written, so readers only ever see complete generations. The newest
//! generation is the one with the highest number.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::bail;
use crate::error::{DeidResult, ErrorKind};
use crate::identity::codec::encode_record;
use crate::identity::{IdentifierValue, IdentitySnapshot, IdentityRecord, Resolution};

/// Marker written into a generation once every partition is in place.
pub const SUCCESS_MARKER: &str = "_SUCCESS";

/// A published generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotGeneration {
    pub number: u64,
    pub path: PathBuf,
}

/// The generations under one root directory.
#[derive(Debug, Clone)]
pub struct SnapshotGenerations {
    root: PathBuf,
}

impl SnapshotGenerations {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The newest published generation. `None` before the first publication.
    pub async fn latest(&self) -> DeidResult<Option<SnapshotGeneration>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut latest: Option<SnapshotGeneration> = None;
        while let Some(entry) = entries.next_entry().await? {
            let Some(number) = entry.file_name().to_str().and_then(parse_generation) else {
                continue;
            };
            if !entry.file_type().await?.is_dir() {
                continue;
            }

            if latest.as_ref().is_none_or(|current| number > current.number) {
                latest = Some(SnapshotGeneration {
                    number,
                    path: entry.path(),
                });
            }
        }

        Ok(latest)
    }

    /// Starts writing the generation following the newest one.
    ///
    /// Leftovers of an interrupted write of the same generation are removed first. Callers
    /// must hold the identity phase lease, which makes them the only writer.
    pub async fn begin(&self) -> DeidResult<GenerationWriter> {
        let number = self.latest().await?.map_or(1, |latest| latest.number + 1);
        let staging = self.root.join(format!(".{}.tmp", generation_name(number)));

        if tokio::fs::try_exists(&staging).await? {
            warn!(path = %staging.display(), "removing an interrupted generation write");
            tokio::fs::remove_dir_all(&staging).await?;
        }
        tokio::fs::create_dir_all(&staging).await?;

        Ok(GenerationWriter {
            number,
            staging,
            target: self.root.join(generation_name(number)),
            partitions: 0,
            records: 0,
        })
    }
}

/// A generation being written.
#[derive(Debug)]
pub struct GenerationWriter {
    number: u64,
    staging: PathBuf,
    target: PathBuf,
    partitions: usize,
    records: usize,
}

impl GenerationWriter {
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Writes one partition file holding `records`, one encoded record per line.
    pub async fn write_partition<'a, I>(&mut self, records: I) -> DeidResult<PathBuf>
    where
        I: IntoIterator<Item = &'a IdentityRecord>,
    {
        let mut contents = String::new();
        let mut count = 0;
        for record in records {
            if !record.is_complete() {
                bail!(
                    ErrorKind::InvalidState,
                    "Only canonical records can be published",
                    format!("generation {}", self.number)
                );
            }
            contents.push_str(&encode_record(record));
            contents.push('\n');
            count += 1;
        }

        let path = self
            .staging
            .join(format!("part-{:05}.tsv", self.partitions));
        tokio::fs::write(&path, contents).await?;
        self.partitions += 1;
        self.records += count;

        Ok(path)
    }

    /// Makes the generation visible to readers.
    pub async fn publish(self) -> DeidResult<SnapshotGeneration> {
        if tokio::fs::try_exists(&self.target).await? {
            bail!(
                ErrorKind::InvalidState,
                "Snapshot generation already exists",
                format!("{}", self.target.display())
            );
        }

        tokio::fs::write(self.staging.join(SUCCESS_MARKER), "").await?;
        tokio::fs::rename(&self.staging, &self.target).await?;

        info!(
            generation = self.number,
            partitions = self.partitions,
            records = self.records,
            path = %self.target.display(),
            "snapshot generation published"
        );

        Ok(SnapshotGeneration {
            number: self.number,
            path: self.target,
        })
    }

    /// Discards everything written so far.
    pub async fn abort(self) -> DeidResult<()> {
        tokio::fs::remove_dir_all(&self.staging).await?;

        Ok(())
    }
}

/// Records of the generation following `snapshot` after a run produced `resolutions`.
///
/// Entities this run did not see keep their snapshot record, so a generation never forgets an
/// entity. Records are ordered by main identifier value.
pub fn next_generation(
    snapshot: &IdentitySnapshot,
    resolutions: &[Resolution],
) -> Vec<IdentityRecord> {
    let main = snapshot.main();
    let resolved: HashSet<&IdentifierValue> = resolutions
        .iter()
        .map(|resolution| &resolution.key.value)
        .collect();

    let mut records: Vec<IdentityRecord> = resolutions
        .iter()
        .map(|resolution| resolution.record.clone())
        .chain(
            snapshot
                .records()
                .filter(|record| {
                    record
                        .get(main)
                        .is_some_and(|value| !resolved.contains(value))
                })
                .cloned(),
        )
        .collect();
    records.sort_by(|a, b| a.get(main).cmp(&b.get(main)));

    records
}

fn generation_name(number: u64) -> String {
    format!("{number:010}")
}

fn parse_generation(name: &str) -> Option<u64> {
    if name.is_empty() || !name.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }

    name.parse().ok()
}

#[cfg(test)]
mod tests {
    use deid_config::shared::RetryConfig;

    use super::*;
    use crate::identity::{
        FileSnapshotSource, IdentifierCatalog, IdentifierType, IdentitySnapshot,
    };
    use crate::test_utils::records::canonical_record;

    #[tokio::test]
    async fn generations_become_visible_only_when_published() {
        let dir = tempfile::tempdir().unwrap();
        let generations = SnapshotGenerations::new(dir.path().join("snapshots"));
        assert_eq!(generations.latest().await.unwrap(), None);

        let record = canonical_record(
            "0f8fad5b-d9cb-469f-a165-70867728950e",
            &[(IdentifierType::Huid, "12345678".into())],
        );
        let mut writer = generations.begin().await.unwrap();
        writer.write_partition([&record]).await.unwrap();
        assert_eq!(generations.latest().await.unwrap(), None);

        let published = writer.publish().await.unwrap();
        assert_eq!(published.number, 1);
        assert_eq!(generations.latest().await.unwrap(), Some(published.clone()));

        let catalog = IdentifierCatalog::new(IdentifierType::Huid).unwrap();
        let source = FileSnapshotSource::new(&published.path, RetryConfig::default());
        let snapshot = IdentitySnapshot::load(&source, &catalog).await.unwrap();
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn numbers_increase_and_interrupted_writes_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let generations = SnapshotGenerations::new(dir.path());

        generations.begin().await.unwrap().publish().await.unwrap();
        let interrupted = generations.begin().await.unwrap();
        assert_eq!(interrupted.number(), 2);
        drop(interrupted);

        let writer = generations.begin().await.unwrap();
        let published = writer.publish().await.unwrap();

        assert_eq!(published.number, 2);
        assert!(published.path.ends_with("0000000002"));
    }

    #[test]
    fn next_generation_keeps_entities_not_seen_again() {
        use std::sync::Arc;

        use crate::identity::{GroupingKey, IdentityResolutionStage, MergePolicy};

        let catalog = IdentifierCatalog::new(IdentifierType::Huid).unwrap();
        let old = canonical_record(
            "0f8fad5b-d9cb-469f-a165-70867728950e",
            &[(IdentifierType::Huid, "11111111".into())],
        );
        let snapshot = Arc::new(IdentitySnapshot::from_records(&catalog, [old.clone()]).unwrap());
        let stage = IdentityResolutionStage::new(catalog, snapshot.clone(), MergePolicy::FirstSeen);

        let resolution = stage
            .resolve(&GroupingKey::new(IdentifierType::Huid, "22222222"), &[])
            .unwrap()
            .unwrap();
        let records = next_generation(&snapshot, &[resolution.clone()]);

        assert_eq!(records, vec![old, resolution.record]);
    }

    #[test]
    fn only_numeric_names_are_generations() {
        assert_eq!(parse_generation("0000000012"), Some(12));
        assert_eq!(parse_generation(".0000000012.tmp"), None);
        assert_eq!(parse_generation("+12"), None);
        assert_eq!(parse_generation(""), None);
    }
}
