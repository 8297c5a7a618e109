use deid::error::ErrorKind;
use deid::failpoints::SNAPSHOT__READ_PARTITION;
use deid::identity::{
    FileSnapshotSource, IdentifierCatalog, IdentifierType, IdentifierValue, IdentitySnapshot,
    SnapshotGenerations,
};
use deid::test_utils::failpoints::FailpointScenario;
use deid::test_utils::records::canonical_record;
use deid_config::shared::RetryConfig;
use deid_telemetry::tracing::init_test_tracing;
use tempfile::TempDir;

fn catalog() -> IdentifierCatalog {
    IdentifierCatalog::new(IdentifierType::Huid).unwrap()
}

fn retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 10,
    }
}

/// Publishes a one-record generation and returns a source reading it.
async fn published_source() -> (TempDir, FileSnapshotSource) {
    let dir = tempfile::tempdir().unwrap();
    let generations = SnapshotGenerations::new(dir.path());

    let record = canonical_record(
        "00000000-0000-4000-8000-000000000001",
        &[(IdentifierType::Huid, IdentifierValue::from("11111111"))],
    );
    let mut writer = generations.begin().await.unwrap();
    writer.write_partition([&record]).await.unwrap();
    let generation = writer.publish().await.unwrap();

    (dir, FileSnapshotSource::new(generation.path, retry()))
}

#[tokio::test]
async fn transient_read_failures_are_retried() {
    init_test_tracing();
    let (_dir, source) = published_source().await;
    let _scenario = FailpointScenario::setup(&[(SNAPSHOT__READ_PARTITION, "2*return(io)")]);

    let snapshot = IdentitySnapshot::load(&source, &catalog()).await.unwrap();

    assert_eq!(snapshot.len(), 1);
    assert_eq!(
        snapshot.pseudonym_for(&IdentifierValue::from("11111111")),
        Some("00000000-0000-4000-8000-000000000001")
    );
}

#[tokio::test]
async fn persistent_read_failures_surface_as_transient_errors() {
    init_test_tracing();
    let (_dir, source) = published_source().await;
    let _scenario = FailpointScenario::setup(&[(SNAPSHOT__READ_PARTITION, "return(io)")]);

    let err = IdentitySnapshot::load(&source, &catalog()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::IoError);
    assert!(err.is_transient());
}
