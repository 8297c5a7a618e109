use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use deid::bail;
use deid::error::{DeidError, DeidResult, ErrorKind};
use deid::identity::{
    FileSnapshotSource, GenerationWriter, IdentifierCatalog, IdentityMapStage, IdentityRecord,
    IdentityResolutionStage, IdentityScrubbingStage, IdentitySnapshot, ScrubCounts,
    SnapshotGeneration, SnapshotGenerations, TableIdentityPolicy, group_partials,
    next_generation,
};
use deid::lease::store::LeaseStore;
use deid::lease::store::memory::MemoryLeaseStore;
use deid::lease::store::postgres::PostgresLeaseStore;
use deid::lease::{LeaseManager, LeaseRenewalLoop, LeaseRequest};
use deid_config::shared::{LeaseStoreConfig, RunnerConfig, RunnerConfigWithoutSecrets};
use deid_postgres::migrations::migrate_lease_store;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::RunnerResult;
use crate::shard::{list_shards, list_tables, read_shard, write_shard};
use crate::summary::{RunSummary, TableSummary};

/// Records per snapshot partition file.
const PARTITION_RECORDS: usize = 100_000;

/// Directory below the output directory receiving records passed through unscrubbed.
pub const UNSCRUBBED_DIR: &str = "_unscrubbed";

/// Runs one identity phase with the lease store named by the configuration.
///
/// Both stores are handled separately so the renewal loop is statically dispatched.
pub async fn start_runner_with_config(config: RunnerConfig) -> RunnerResult<RunSummary> {
    info!("starting identity phase runner");

    log_config(&config);

    match &config.lease_store {
        LeaseStoreConfig::Memory => {
            warn!("using the memory lease store, runs in other processes are not excluded");
            run_with_store(MemoryLeaseStore::new(), &config).await
        }
        LeaseStoreConfig::Postgres { connection } => {
            migrate_lease_store(connection).await?;
            run_with_store(PostgresLeaseStore::new(connection), &config).await
        }
    }
}

/// Holds the identity lease for the duration of one identity phase run over `store`.
///
/// The lease is released whether or not the run succeeds. A run is only reported successful if
/// the lease was still held once its output was complete.
pub async fn run_with_store<S>(store: S, config: &RunnerConfig) -> RunnerResult<RunSummary>
where
    S: LeaseStore + Clone + Send + Sync + 'static,
{
    // Configuration mistakes surface before the lease is taken.
    let phase = IdentityPhase::new(config)?;

    let owner = config
        .lease
        .owner
        .clone()
        .unwrap_or_else(|| format!("deid-runner-{}", Uuid::new_v4()));
    let request = LeaseRequest::new(
        config.lease.name.clone(),
        owner.clone(),
        Duration::from_secs(config.lease.ttl_secs),
    );
    let renewal =
        LeaseRenewalLoop::start(LeaseManager::new(store), request, &config.lease.acquire).await?;

    let result = match phase.run(&renewal).await {
        Ok(summary) => renewal.check_lease().map(|_| summary),
        Err(err) => Err(err),
    };

    match renewal.release().await {
        Ok(status) => info!(
            lease = %config.lease.name,
            state = status.state.as_str(),
            "identity lease released"
        ),
        Err(err) if result.is_ok() => return Err(err.into()),
        Err(err) => warn!(
            lease = %config.lease.name,
            error = %err,
            "failed to release the identity lease after a failed run"
        ),
    }

    let mut summary = result?;
    summary.lease = config.lease.name.clone();
    summary.owner = owner;

    info!(
        generation = summary.generation,
        resolved = summary.resolved,
        minted = summary.minted,
        "identity phase completed"
    );

    Ok(summary)
}

/// The work done under the lease: map, resolve, publish, scrub.
struct IdentityPhase<'a> {
    config: &'a RunnerConfig,
    catalog: IdentifierCatalog,
    policies: Vec<TableIdentityPolicy>,
}

impl<'a> IdentityPhase<'a> {
    fn new(config: &'a RunnerConfig) -> DeidResult<Self> {
        let catalog = IdentifierCatalog::from_main_identifier(&config.identity.main_identifier)?;
        let policies = config
            .identity
            .tables
            .iter()
            .map(TableIdentityPolicy::from_config)
            .collect::<DeidResult<Vec<_>>>()?;

        if policies.is_empty() {
            warn!("no table policies configured, nothing will be scrubbed");
        }

        Ok(Self {
            config,
            catalog,
            policies,
        })
    }

    async fn run<S>(&self, renewal: &LeaseRenewalLoop<S>) -> DeidResult<RunSummary>
    where
        S: LeaseStore + Clone + Send + Sync + 'static,
    {
        let mut summary = RunSummary::default();
        self.warn_unconfigured_tables().await?;

        let generations = SnapshotGenerations::new(&self.config.snapshot.directory);
        let previous = generations.latest().await?;
        summary.previous_generation = previous.as_ref().map(|generation| generation.number);
        let snapshot = Arc::new(self.load_generation(previous.as_ref()).await?);

        let mut pairs = Vec::new();
        for policy in &self.policies {
            for path in list_shards(&self.input_dir(policy)).await? {
                renewal.check_lease()?;

                let shard = read_shard(&policy.table, &path).await?;
                let stage = IdentityMapStage::new(self.catalog, policy, &shard.layout)?;
                pairs.extend(stage.map_shard(&shard.records)?);
            }
        }
        let groups = group_partials(pairs);

        renewal.check_lease()?;
        let resolution = IdentityResolutionStage::new(
            self.catalog,
            snapshot.clone(),
            self.config.identity.merge_policy.into(),
        );
        let resolutions = resolution.resolve_groups(&groups)?;
        summary.record_resolutions(&resolutions);

        let records = next_generation(&snapshot, &resolutions);
        let generation = self.publish(&generations, &records, renewal).await?;
        summary.generation = generation.number;

        // Scrubbing reads the published generation, exactly as any later reader would.
        let snapshot = Arc::new(self.load_generation(Some(&generation)).await?);
        summary.snapshot_records = snapshot.len();

        let mut failures = Vec::new();
        for policy in &self.policies {
            let table = self
                .scrub_table(policy, &snapshot, renewal, &mut failures)
                .await?;
            summary.tables.push(table);
        }

        if !failures.is_empty() {
            return Err(DeidError::from(failures));
        }

        Ok(summary)
    }

    async fn load_generation(
        &self,
        generation: Option<&SnapshotGeneration>,
    ) -> DeidResult<IdentitySnapshot> {
        let Some(generation) = generation else {
            info!("no snapshot generation published yet, starting from an empty snapshot");
            return Ok(IdentitySnapshot::empty(&self.catalog));
        };

        let source =
            FileSnapshotSource::new(&generation.path, self.config.snapshot.read_retry.clone());
        let snapshot = IdentitySnapshot::load(&source, &self.catalog).await?;
        info!(
            generation = generation.number,
            records = snapshot.len(),
            "snapshot generation loaded"
        );

        Ok(snapshot)
    }

    async fn publish<S>(
        &self,
        generations: &SnapshotGenerations,
        records: &[IdentityRecord],
        renewal: &LeaseRenewalLoop<S>,
    ) -> DeidResult<SnapshotGeneration>
    where
        S: LeaseStore + Clone + Send + Sync + 'static,
    {
        let mut writer = generations.begin().await?;

        if let Err(err) = write_partitions(&mut writer, records, renewal).await {
            if let Err(abort_err) = writer.abort().await {
                warn!(error = %abort_err, "failed to remove the staged snapshot generation");
            }
            return Err(err);
        }

        let generation = writer.publish().await?;
        info!(
            generation = generation.number,
            records = records.len(),
            "snapshot generation published"
        );

        Ok(generation)
    }

    /// Scrubs every shard of one table.
    ///
    /// A failing shard is logged, counted and skipped. Its error is collected into `failures`
    /// so the run still fails once every table was attempted. Losing the lease stops the run.
    async fn scrub_table<S>(
        &self,
        policy: &TableIdentityPolicy,
        snapshot: &Arc<IdentitySnapshot>,
        renewal: &LeaseRenewalLoop<S>,
        failures: &mut Vec<DeidError>,
    ) -> DeidResult<TableSummary>
    where
        S: LeaseStore + Clone + Send + Sync + 'static,
    {
        let mut table = TableSummary::new(&policy.table);

        for path in list_shards(&self.input_dir(policy)).await? {
            renewal.check_lease()?;

            match self.scrub_shard(policy, snapshot, &path).await {
                Ok(counts) => table.add(counts),
                Err(err) => {
                    error!(
                        table = %policy.table,
                        shard = %path.display(),
                        error = %err,
                        "scrubbing shard failed, skipping it"
                    );
                    table.failed_shards += 1;
                    failures.push(err);
                }
            }
        }

        Ok(table)
    }

    async fn scrub_shard(
        &self,
        policy: &TableIdentityPolicy,
        snapshot: &Arc<IdentitySnapshot>,
        path: &Path,
    ) -> DeidResult<ScrubCounts> {
        let Some(file_name) = path.file_name() else {
            bail!(
                ErrorKind::InvalidState,
                "Shard path has no file name",
                format!("{}", path.display())
            );
        };

        let shard = read_shard(&policy.table, path).await?;
        let stage = IdentityScrubbingStage::new(
            self.catalog,
            snapshot.clone(),
            policy,
            &shard.layout,
            self.config.identity.unresolved_policy.into(),
        )?;
        let scrubbed = stage.scrub_shard(&shard.records)?;

        let output_dir = &self.config.io.output_dir;
        write_shard(
            &output_dir.join(&policy.table).join(file_name),
            stage.output_layout(),
            &scrubbed.scrubbed,
        )
        .await?;

        if !scrubbed.unscrubbed.is_empty() {
            warn!(
                table = %policy.table,
                records = scrubbed.unscrubbed.len(),
                "writing records without a resolved identity unscrubbed"
            );
            write_shard(
                &output_dir.join(UNSCRUBBED_DIR).join(&policy.table).join(file_name),
                &shard.layout,
                &scrubbed.unscrubbed,
            )
            .await?;
        }

        Ok(scrubbed.counts)
    }

    async fn warn_unconfigured_tables(&self) -> DeidResult<()> {
        let configured: HashSet<&str> = self
            .policies
            .iter()
            .map(|policy| policy.table.as_str())
            .collect();

        for table in list_tables(&self.config.io.input_dir).await? {
            if !configured.contains(table.as_str()) {
                warn!(table = %table, "input table has no identity policy, it is not scrubbed");
            }
        }

        Ok(())
    }

    fn input_dir(&self, policy: &TableIdentityPolicy) -> PathBuf {
        self.config.io.input_dir.join(&policy.table)
    }
}

async fn write_partitions<S>(
    writer: &mut GenerationWriter,
    records: &[IdentityRecord],
    renewal: &LeaseRenewalLoop<S>,
) -> DeidResult<()>
where
    S: LeaseStore + Clone + Send + Sync + 'static,
{
    for partition in records.chunks(PARTITION_RECORDS) {
        writer.write_partition(partition).await?;
    }

    // Publishing is the commit point of the run.
    renewal.check_lease()
}

fn log_config(config: &RunnerConfig) {
    match render_config(config) {
        Ok(rendered) => debug!(config = %rendered, "using runner config"),
        Err(err) => warn!(error = %err, "failed to render the runner config"),
    }
}

/// Renders the configuration for logging, with connection secrets removed.
fn render_config(config: &RunnerConfig) -> serde_json::Result<String> {
    serde_json::to_string(&RunnerConfigWithoutSecrets::from(config.clone()))
}
