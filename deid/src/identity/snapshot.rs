//! Loading of the previously published identity snapshot.
//!
//! A snapshot is indexed by main identifier value. Workers load it once, share it through an
//! [`std::sync::Arc`] and never refresh it during a run.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use deid_config::shared::RetryConfig;
use metrics::gauge;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{DeidResult, ErrorKind};
#[cfg(feature = "failpoints")]
use crate::failpoints::{SNAPSHOT__READ_PARTITION, deid_fail_point};
use crate::identity::codec::decode_record;
use crate::identity::{IdentifierCatalog, IdentifierType, IdentifierValue, IdentityRecord};
use crate::metrics::DEID_SNAPSHOT_RECORDS;
use crate::{bail, deid_error};

/// Supplies the canonical records of one snapshot generation, whatever their storage.
pub trait SnapshotSource {
    /// Reads every record of the generation, in read order.
    ///
    /// Fails with [`ErrorKind::CorruptSnapshot`] on malformed records.
    fn read_records(
        &self,
        catalog: &IdentifierCatalog,
    ) -> impl Future<Output = DeidResult<Vec<IdentityRecord>>> + Send;
}

/// Snapshot generation stored as a directory of partition files, one encoded record per line.
///
/// A missing directory is an empty snapshot. Files whose name starts with `.` or `_`, such as
/// completion markers, are skipped.
#[derive(Debug, Clone)]
pub struct FileSnapshotSource {
    directory: PathBuf,
    retry: RetryConfig,
}

impl FileSnapshotSource {
    pub fn new(directory: impl Into<PathBuf>, retry: RetryConfig) -> Self {
        Self {
            directory: directory.into(),
            retry,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Partition files in name order.
    async fn partitions(&self) -> DeidResult<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(
                    directory = %self.directory.display(),
                    "snapshot directory does not exist, starting from an empty snapshot"
                );
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };

        let mut partitions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let hidden = file_name
                .to_str()
                .is_none_or(|name| name.starts_with('.') || name.starts_with('_'));
            if hidden || !entry.file_type().await?.is_file() {
                continue;
            }

            partitions.push(entry.path());
        }
        partitions.sort();

        Ok(partitions)
    }

    /// Reads a partition, retrying transient I/O failures with exponential backoff.
    async fn read_partition(&self, path: &Path) -> DeidResult<String> {
        let mut delay = Duration::from_millis(self.retry.initial_delay_ms);
        let mut attempt = 1;

        loop {
            match read_partition_once(path).await {
                Ok(contents) => return Ok(contents),
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    warn!(
                        path = %path.display(),
                        attempt,
                        error = %err,
                        "reading snapshot partition failed, retrying"
                    );
                    sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

async fn read_partition_once(path: &Path) -> DeidResult<String> {
    #[cfg(feature = "failpoints")]
    deid_fail_point(SNAPSHOT__READ_PARTITION)?;

    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == io::ErrorKind::InvalidData => Err(deid_error!(
            ErrorKind::CorruptSnapshot,
            "Snapshot partition is not valid UTF-8",
            format!("{}", path.display()),
            source: err
        )),
        Err(err) => Err(err.into()),
    }
}

impl SnapshotSource for FileSnapshotSource {
    async fn read_records(&self, catalog: &IdentifierCatalog) -> DeidResult<Vec<IdentityRecord>> {
        let partitions = self.partitions().await?;

        let mut records = Vec::new();
        for path in &partitions {
            let contents = self.read_partition(path).await?;
            for (i, line) in contents.lines().enumerate() {
                let record = decode_record(line, catalog).map_err(|err| {
                    deid_error!(
                        ErrorKind::CorruptSnapshot,
                        "Snapshot partition holds a malformed record",
                        format!("{}:{}", path.display(), i + 1),
                        source: err
                    )
                })?;
                records.push(record);
            }
            debug!(path = %path.display(), "snapshot partition read");
        }

        info!(
            directory = %self.directory.display(),
            partitions = partitions.len(),
            records = records.len(),
            "snapshot generation read"
        );

        Ok(records)
    }
}

/// Snapshot source serving records held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotSource {
    records: Vec<IdentityRecord>,
}

impl MemorySnapshotSource {
    pub fn new(records: Vec<IdentityRecord>) -> Self {
        Self { records }
    }
}

impl SnapshotSource for MemorySnapshotSource {
    async fn read_records(&self, _catalog: &IdentifierCatalog) -> DeidResult<Vec<IdentityRecord>> {
        Ok(self.records.clone())
    }
}

/// Read-only index from main identifier value to canonical record.
#[derive(Debug, Clone)]
pub struct IdentitySnapshot {
    main: IdentifierType,
    entries: HashMap<IdentifierValue, IdentityRecord>,
    duplicates: usize,
}

impl IdentitySnapshot {
    /// The snapshot of a first run.
    pub fn empty(catalog: &IdentifierCatalog) -> Self {
        Self {
            main: catalog.main(),
            entries: HashMap::new(),
            duplicates: 0,
        }
    }

    /// Indexes canonical records by their main identifier. A later record for the same main
    /// identifier value replaces an earlier one.
    ///
    /// Fails with [`ErrorKind::CorruptSnapshot`] if a record lacks its pseudonym or main
    /// identifier.
    pub fn from_records<I>(catalog: &IdentifierCatalog, records: I) -> DeidResult<Self>
    where
        I: IntoIterator<Item = IdentityRecord>,
    {
        let mut snapshot = Self::empty(catalog);
        for record in records {
            if !record.is_complete() {
                bail!(ErrorKind::CorruptSnapshot, "Snapshot record has no pseudonym");
            }
            let Some(key) = record.get(snapshot.main).cloned() else {
                bail!(
                    ErrorKind::CorruptSnapshot,
                    "Snapshot record has no main identifier",
                    format!("field `{}`", snapshot.main)
                );
            };

            if snapshot.insert(key, record).is_some() {
                snapshot.duplicates += 1;
            }
        }

        if snapshot.duplicates > 0 {
            warn!(
                duplicates = snapshot.duplicates,
                "snapshot holds several records for the same main identifier, keeping the last read"
            );
        }

        Ok(snapshot)
    }

    /// Reads all records from `source` and indexes them.
    pub async fn load<S>(source: &S, catalog: &IdentifierCatalog) -> DeidResult<Self>
    where
        S: SnapshotSource,
    {
        let records = source.read_records(catalog).await?;
        let snapshot = Self::from_records(catalog, records)?;

        gauge!(DEID_SNAPSHOT_RECORDS).set(snapshot.len() as f64);
        info!(
            records = snapshot.len(),
            duplicates = snapshot.duplicates,
            main_identifier = %snapshot.main,
            "identity snapshot loaded"
        );

        Ok(snapshot)
    }

    /// Indexes `record` under `key`, returning the record it replaces.
    ///
    /// Loading always indexes a record under its own main identifier value. Lookups through
    /// [`IdentitySnapshot::pseudonym_for`] re-check that match, so an entry indexed under any
    /// other value never lends its pseudonym.
    pub fn insert(&mut self, key: IdentifierValue, record: IdentityRecord) -> Option<IdentityRecord> {
        self.entries.insert(key, record)
    }

    /// The entry indexed under `key`, without any check.
    pub fn get(&self, key: &IdentifierValue) -> Option<&IdentityRecord> {
        self.entries.get(key)
    }

    /// The record of the entity whose main identifier is `main_value`.
    ///
    /// Returns `None` when the entry indexed under `main_value` holds a different main value:
    /// such an entry belongs to another entity, for example after an identifier was reassigned.
    pub fn record_for(&self, main_value: &IdentifierValue) -> Option<&IdentityRecord> {
        self.entries
            .get(main_value)
            .filter(|record| record.get(self.main) == Some(main_value))
    }

    /// The pseudonym of the entity whose main identifier is `main_value`.
    pub fn pseudonym_for(&self, main_value: &IdentifierValue) -> Option<&str> {
        self.record_for(main_value)
            .and_then(IdentityRecord::pseudonym)
    }

    pub fn main(&self) -> IdentifierType {
        self.main
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records replaced by a later record with the same main identifier while loading.
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    pub fn records(&self) -> impl Iterator<Item = &IdentityRecord> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::codec::encode_record;
    use crate::test_utils::records::canonical_record;

    const PSEUDONYM_A: &str = "0f8fad5b-d9cb-469f-a165-70867728950e";
    const PSEUDONYM_B: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";

    fn catalog() -> IdentifierCatalog {
        IdentifierCatalog::new(IdentifierType::Huid).unwrap()
    }

    fn retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            initial_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn missing_directory_is_an_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileSnapshotSource::new(dir.path().join("absent"), retry());

        let snapshot = IdentitySnapshot::load(&source, &catalog()).await.unwrap();

        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn reads_every_partition_and_skips_markers() {
        let dir = tempfile::tempdir().unwrap();
        let a = canonical_record(PSEUDONYM_A, &[(IdentifierType::Huid, "11111111".into())]);
        let b = canonical_record(PSEUDONYM_B, &[(IdentifierType::Huid, "22222222".into())]);
        std::fs::write(dir.path().join("part-00000.tsv"), encode_record(&a) + "\n").unwrap();
        std::fs::write(dir.path().join("part-00001.tsv"), encode_record(&b)).unwrap();
        std::fs::write(dir.path().join("_SUCCESS"), "").unwrap();
        std::fs::write(dir.path().join(".part-00002.tsv.crc"), "garbage").unwrap();

        let source = FileSnapshotSource::new(dir.path(), retry());
        let snapshot = IdentitySnapshot::load(&source, &catalog()).await.unwrap();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot.pseudonym_for(&"22222222".into()),
            Some(PSEUDONYM_B)
        );
    }

    #[tokio::test]
    async fn malformed_rows_name_file_and_line_only() {
        let dir = tempfile::tempdir().unwrap();
        let a = canonical_record(PSEUDONYM_A, &[(IdentifierType::Huid, "11111111".into())]);
        let contents = format!("{}\n99999999\tnot-a-pseudonym\n", encode_record(&a));
        std::fs::write(dir.path().join("part-00000.tsv"), contents).unwrap();

        let source = FileSnapshotSource::new(dir.path(), retry());
        let err = IdentitySnapshot::load(&source, &catalog())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::CorruptSnapshot);
        assert!(!err.is_transient());
        let detail = err.detail().unwrap();
        assert!(detail.ends_with("part-00000.tsv:2"));
        assert!(!format!("{err}").contains("99999999"));
    }

    #[tokio::test]
    async fn duplicate_main_identifiers_keep_the_last_record() {
        let first = canonical_record(PSEUDONYM_A, &[(IdentifierType::Huid, "11111111".into())]);
        let second = canonical_record(PSEUDONYM_B, &[(IdentifierType::Huid, "11111111".into())]);
        let source = MemorySnapshotSource::new(vec![first, second]);

        let snapshot = IdentitySnapshot::load(&source, &catalog()).await.unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.duplicates(), 1);
        assert_eq!(snapshot.pseudonym_for(&"11111111".into()), Some(PSEUDONYM_B));
    }

    #[test]
    fn incomplete_records_are_rejected() {
        let mut record = IdentityRecord::new();
        record.set(IdentifierType::Huid, "11111111".into()).unwrap();

        let err = IdentitySnapshot::from_records(&catalog(), [record]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptSnapshot);

        let without_main =
            canonical_record(PSEUDONYM_A, &[(IdentifierType::Xid, "a1234567".into())]);
        let err = IdentitySnapshot::from_records(&catalog(), [without_main]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptSnapshot);
    }

    #[test]
    fn entries_under_a_foreign_key_lend_no_pseudonym() {
        let mut snapshot = IdentitySnapshot::empty(&catalog());
        let record = canonical_record(PSEUDONYM_A, &[(IdentifierType::Huid, "11111111".into())]);
        snapshot.insert("22222222".into(), record);

        assert!(snapshot.get(&"22222222".into()).is_some());
        assert_eq!(snapshot.pseudonym_for(&"22222222".into()), None);
    }
}
