use std::collections::HashMap;
use std::sync::Arc;

use deid::error::ErrorKind;
use deid::identity::{
    FileSnapshotSource, GroupingKey, IdentifierCatalog, IdentifierType, IdentityMapStage,
    IdentityResolutionStage, IdentityScrubbingStage, IdentitySnapshot, MergePolicy,
    IdentifierValue, PseudonymOrigin, Resolution, SnapshotGenerations, TableIdentityPolicy,
    UnresolvedIdentityPolicy, group_partials, next_generation,
};
use deid::test_utils::pseudonym::SequentialPseudonymGenerator;
use deid::test_utils::records::raw_record;
use deid::types::{RawRecord, TableLayout};
use deid_config::shared::RetryConfig;
use deid_telemetry::tracing::init_test_tracing;
use tempfile::TempDir;

fn catalog() -> IdentifierCatalog {
    IdentifierCatalog::new(IdentifierType::Huid).unwrap()
}

fn users_layout() -> TableLayout {
    TableLayout::new("users", ["huid", "canvas_id", "name", "email"])
}

fn users_policy() -> TableIdentityPolicy {
    TableIdentityPolicy::new("users")
        .with_identifier_column("huid", [IdentifierType::Huid])
        .with_identifier_column("canvas_id", [IdentifierType::SourceId])
        .with_pii_column("name")
        .with_pii_column("email")
}

fn submissions_layout() -> TableLayout {
    TableLayout::new("submissions", ["id", "author", "score"])
}

fn submissions_policy() -> TableIdentityPolicy {
    TableIdentityPolicy::new("submissions")
        .with_identifier_column("author", [IdentifierType::Huid, IdentifierType::Xid])
}

/// Runs map, group and resolve over both tables and publishes the next generation.
async fn resolve_run(
    generations: &SnapshotGenerations,
    snapshot: Arc<IdentitySnapshot>,
    generator: Arc<SequentialPseudonymGenerator>,
    users: &[RawRecord],
    submissions: &[RawRecord],
) -> Vec<Resolution> {
    let users_map = IdentityMapStage::new(catalog(), &users_policy(), &users_layout()).unwrap();
    let submissions_map =
        IdentityMapStage::new(catalog(), &submissions_policy(), &submissions_layout()).unwrap();

    let mut pairs = users_map.map_shard(users).unwrap();
    pairs.extend(submissions_map.map_shard(submissions).unwrap());
    let groups = group_partials(pairs);

    let stage = IdentityResolutionStage::new(catalog(), snapshot.clone(), MergePolicy::FirstSeen)
        .with_generator(generator);
    let resolutions = stage.resolve_groups(&groups).unwrap();

    let mut writer = generations.begin().await.unwrap();
    writer
        .write_partition(&next_generation(&snapshot, &resolutions))
        .await
        .unwrap();
    writer.publish().await.unwrap();

    resolutions
}

async fn load_latest(generations: &SnapshotGenerations) -> Arc<IdentitySnapshot> {
    let Some(latest) = generations.latest().await.unwrap() else {
        return Arc::new(IdentitySnapshot::empty(&catalog()));
    };
    let source = FileSnapshotSource::new(latest.path, RetryConfig::default());

    Arc::new(IdentitySnapshot::load(&source, &catalog()).await.unwrap())
}

fn pseudonyms(resolutions: &[Resolution]) -> HashMap<String, String> {
    resolutions
        .iter()
        .map(|resolution| {
            (
                resolution.key.value.to_string(),
                resolution.pseudonym().unwrap().to_string(),
            )
        })
        .collect()
}

fn setup() -> (TempDir, SnapshotGenerations) {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let generations = SnapshotGenerations::new(dir.path().join("identity_map"));

    (dir, generations)
}

#[tokio::test]
async fn pseudonyms_are_stable_across_runs() {
    let (_dir, generations) = setup();
    let generator = Arc::new(SequentialPseudonymGenerator::new());

    let first_users = [
        raw_record(&[Some("11111111"), Some("501"), Some("Ada"), Some("ada@example.edu")]),
        raw_record(&[Some("22222222"), Some("502"), Some("Bo"), None]),
    ];
    let first = resolve_run(
        &generations,
        load_latest(&generations).await,
        generator.clone(),
        &first_users,
        &[],
    )
    .await;
    let first = pseudonyms(&first);
    assert_eq!(first.len(), 2);
    assert_eq!(generator.minted(), 2);

    // Only one of the known entities shows up again, next to a new one.
    let second_users = [
        raw_record(&[Some("22222222"), Some("502"), Some("Bo"), None]),
        raw_record(&[Some("33333333"), None, Some("Cy"), None]),
    ];
    let second = resolve_run(
        &generations,
        load_latest(&generations).await,
        generator.clone(),
        &second_users,
        &[],
    )
    .await;
    let origins: HashMap<_, _> = second
        .iter()
        .map(|resolution| (resolution.key.value.to_string(), resolution.origin))
        .collect();
    let second = pseudonyms(&second);
    assert_eq!(second["22222222"], first["22222222"]);
    assert_eq!(origins["22222222"], PseudonymOrigin::Reused);
    assert_eq!(origins["33333333"], PseudonymOrigin::Minted);

    // The entity absent from the second run is still known to the third.
    let third = resolve_run(
        &generations,
        load_latest(&generations).await,
        generator.clone(),
        &[raw_record(&[Some("11111111"), None, None, None])],
        &[],
    )
    .await;
    assert_eq!(pseudonyms(&third)["11111111"], first["11111111"]);
    assert_eq!(generator.minted(), 3);

    let latest = load_latest(&generations).await;
    assert_eq!(latest.len(), 3);
    assert_eq!(
        latest
            .record_for(&IdentifierValue::from("22222222"))
            .unwrap()
            .get(IdentifierType::SourceId),
        Some(&IdentifierValue::Int(502))
    );
}

#[tokio::test]
async fn scrubbing_uses_one_pseudonym_per_entity_across_tables() {
    let (_dir, generations) = setup();
    let generator = Arc::new(SequentialPseudonymGenerator::new());

    let users = [
        raw_record(&[Some("11111111"), Some("501"), Some("Ada"), Some("ada@example.edu")]),
        raw_record(&[Some("22222222"), None, Some("Bo"), None]),
    ];
    let submissions = [
        raw_record(&[Some("1"), Some("11111111"), Some("90")]),
        raw_record(&[Some("2"), Some("a1234567"), Some("75")]),
        raw_record(&[Some("3"), Some("22222222"), Some("60")]),
    ];
    resolve_run(
        &generations,
        load_latest(&generations).await,
        generator,
        &users,
        &submissions,
    )
    .await;
    let snapshot = load_latest(&generations).await;

    let users_scrub = IdentityScrubbingStage::new(
        catalog(),
        snapshot.clone(),
        &users_policy(),
        &users_layout(),
        UnresolvedIdentityPolicy::Fail,
    )
    .unwrap();
    let submissions_scrub = IdentityScrubbingStage::new(
        catalog(),
        snapshot.clone(),
        &submissions_policy(),
        &submissions_layout(),
        UnresolvedIdentityPolicy::Fail,
    )
    .unwrap();

    assert_eq!(users_scrub.output_layout().columns, vec!["huid_research_id"]);
    assert_eq!(
        submissions_scrub.output_layout().columns,
        vec!["id", "author_research_id", "score"]
    );

    let scrubbed_users = users_scrub.scrub_shard(&users).unwrap();
    let scrubbed_submissions = submissions_scrub.scrub_shard(&submissions).unwrap();
    assert_eq!(scrubbed_users.counts.scrubbed, 2);
    assert_eq!(scrubbed_submissions.counts.scrubbed, 3);

    let ada = scrubbed_users.scrubbed[0].get(0).unwrap();
    assert_eq!(scrubbed_submissions.scrubbed[0].get(1), Some(ada));
    // An xid author is no main identifier and cannot be resolved.
    assert_eq!(scrubbed_submissions.scrubbed[1].get(1), None);
    assert_ne!(scrubbed_submissions.scrubbed[2].get(1), Some(ada));

    for record in scrubbed_users
        .scrubbed
        .iter()
        .chain(&scrubbed_submissions.scrubbed)
    {
        for cell in record.values.iter().flatten() {
            assert!(!["11111111", "22222222", "a1234567", "501", "Ada", "Bo"].contains(&cell.as_str()));
        }
    }
}

#[tokio::test]
async fn unknown_entities_follow_the_unresolved_policy() {
    let (_dir, generations) = setup();
    let snapshot = load_latest(&generations).await;
    assert!(snapshot.is_empty());

    let submissions = [raw_record(&[Some("1"), Some("11111111"), Some("90")])];
    let build = |policy| {
        IdentityScrubbingStage::new(
            catalog(),
            snapshot.clone(),
            &submissions_policy(),
            &submissions_layout(),
            policy,
        )
        .unwrap()
    };

    let err = build(UnresolvedIdentityPolicy::Fail)
        .scrub_shard(&submissions)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnresolvedIdentity);

    let dropped = build(UnresolvedIdentityPolicy::Drop)
        .scrub_shard(&submissions)
        .unwrap();
    assert!(dropped.scrubbed.is_empty());
    assert_eq!(dropped.counts.dropped, 1);

    let passed = build(UnresolvedIdentityPolicy::PassThrough)
        .scrub_shard(&submissions)
        .unwrap();
    assert_eq!(passed.unscrubbed, submissions.to_vec());
}

#[tokio::test]
async fn non_main_keys_only_co_locate() {
    let (_dir, _generations) = setup();
    let snapshot = Arc::new(IdentitySnapshot::empty(&catalog()));
    let map = IdentityMapStage::new(catalog(), &users_policy(), &users_layout()).unwrap();
    let groups = group_partials(
        map.map_shard(&[raw_record(&[Some("11111111"), Some("501"), None, None])])
            .unwrap(),
    );
    assert_eq!(groups.len(), 2);

    let stage = IdentityResolutionStage::new(catalog(), snapshot, MergePolicy::FirstSeen);
    let source_key = GroupingKey::new(IdentifierType::SourceId, 501i64);

    assert!(stage.resolve(&source_key, &groups[&source_key]).unwrap().is_none());
    assert_eq!(stage.resolve_groups(&groups).unwrap().len(), 1);
}
