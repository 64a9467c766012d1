//! Durable archive round-trips: a reloaded store must be indistinguishable
//! from one that ingested every document in original order.

mod common;

use std::sync::Arc;

use tempfile::TempDir;
use uuid::Uuid;

use cfdi_engine::cert_status::StaticStatusProvider;
use cfdi_engine::engine::{EngineConfig, IngestionEngine};
use cfdi_engine::lifecycle::DocumentStatus;
use cfdi_engine::store::QueryScope;

use common::{U1, U2, U3, cancellation_notice, signed_invoice};

fn engine_with_archive(dir: &TempDir) -> IngestionEngine {
    let config = EngineConfig {
        archive_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    IngestionEngine::new(
        config,
        Some(Arc::new(StaticStatusProvider::all_valid())),
    )
}

#[tokio::test]
async fn test_reload_reproduces_store() {
    let dir = TempDir::new().unwrap();

    let first = engine_with_archive(&dir);
    first.ingest(&signed_invoice(U1, "100.00")).await;
    first.ingest(&signed_invoice(U2, "250.50")).await;
    first.ingest(&signed_invoice(U3, "42.00")).await;
    first
        .ingest(&cancellation_notice(&[U1], "2024-04-01T09:00:00"))
        .await;

    let original_records = first.store().records();
    let original_aggregates = first.aggregate_by_status(&QueryScope::unrestricted());
    drop(first);

    let second = engine_with_archive(&dir);
    let loaded = second.load_archive().await.unwrap();
    assert_eq!(loaded, 3);

    assert_eq!(second.store().records(), original_records);
    assert_eq!(
        second.aggregate_by_status(&QueryScope::unrestricted()),
        original_aggregates
    );
    assert!(second.store().check_index_invariants());

    // The canceled folio kept its terminal status and audit trail.
    let record = second
        .get(&Uuid::parse_str(U1).unwrap(), &QueryScope::unrestricted())
        .unwrap();
    assert_eq!(record.status, DocumentStatus::Canceled);
    assert!(!record.audit.is_empty());
}

#[tokio::test]
async fn test_reloaded_store_enforces_dedup_and_conflict() {
    let dir = TempDir::new().unwrap();

    let first = engine_with_archive(&dir);
    let document = signed_invoice(U1, "100.00");
    first.ingest(&document).await;
    drop(first);

    let second = engine_with_archive(&dir);
    second.load_archive().await.unwrap();

    // Identical bytes: idempotent after reload.
    assert_eq!(second.ingest(&document).await.kind(), "duplicate-ignored");
    // Different content under the same folio: still a conflict.
    let tampered = signed_invoice(U1, "999.99");
    assert_eq!(second.ingest(&tampered).await.kind(), "conflict-rejected");
}

#[tokio::test]
async fn test_raw_document_survives_for_replay() {
    let dir = TempDir::new().unwrap();

    let first = engine_with_archive(&dir);
    let document = signed_invoice(U1, "100.00");
    first.ingest(&document).await;
    drop(first);

    let second = engine_with_archive(&dir);
    second.load_archive().await.unwrap();

    let (tree, raw) = second
        .store()
        .document(&Uuid::parse_str(U1).unwrap())
        .expect("document must reload");
    assert_eq!(&*raw, document.as_str());

    // Replayed bytes still verify: the seal check is reproducible from
    // the archive alone.
    let (_, _, failure) = cfdi_engine::seal::verify_offline(&tree);
    assert_eq!(failure, None);
}

#[tokio::test]
async fn test_memory_only_engine_has_no_archive() {
    let engine = IngestionEngine::new(
        EngineConfig::default(),
        Some(Arc::new(StaticStatusProvider::all_valid())),
    );
    engine.ingest(&signed_invoice(U1, "100.00")).await;
    assert_eq!(engine.load_archive().await.unwrap(), 0);
}
