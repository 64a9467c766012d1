//! End-to-end ingestion flows: accept, dedup, conflict, cancellation
//! ordering, and substitution chains.

mod common;

use std::sync::Arc;

use uuid::Uuid;

use cfdi_engine::cert_status::{CertificateStatus, StaticStatusProvider};
use cfdi_engine::engine::{EngineConfig, IngestOutcome, IngestionEngine};
use cfdi_engine::lifecycle::DocumentStatus;
use cfdi_engine::seal::{ChainStatus, SealFailure};
use cfdi_engine::store::QueryScope;

use common::{InvoiceBuilder, TEST_SERIAL, U1, U2, U3, cancellation_notice, signed_invoice};

fn engine() -> IngestionEngine {
    IngestionEngine::new(
        EngineConfig::default(),
        Some(Arc::new(StaticStatusProvider::all_valid())),
    )
}

fn uuid(text: &str) -> Uuid {
    Uuid::parse_str(text).unwrap()
}

#[tokio::test]
async fn test_valid_document_accepted_and_queryable() {
    let engine = engine();
    let outcome = engine.ingest(&signed_invoice(U1, "100.00")).await;

    match &outcome {
        IngestOutcome::Accepted(record) => {
            assert_eq!(record.uuid, uuid(U1));
            assert_eq!(record.status, DocumentStatus::Valid);
        }
        other => panic!("expected Accepted, got {:?}", other.kind()),
    }

    let record = engine
        .get(&uuid(U1), &QueryScope::unrestricted())
        .expect("record must be queryable");
    assert_eq!(record.status, DocumentStatus::Valid);
    assert_eq!(record.issuer_rfc, common::ISSUER_RFC);
}

#[tokio::test]
async fn test_reingestion_is_idempotent() {
    let engine = engine();
    let document = signed_invoice(U1, "100.00");

    let first = engine.ingest(&document).await;
    assert_eq!(first.kind(), "accepted");

    let aggregates_before = engine.aggregate_by_status(&QueryScope::unrestricted());

    let second = engine.ingest(&document).await;
    match second {
        IngestOutcome::DuplicateIgnored(id) => assert_eq!(id, uuid(U1)),
        other => panic!("expected DuplicateIgnored, got {:?}", other.kind()),
    }

    let aggregates_after = engine.aggregate_by_status(&QueryScope::unrestricted());
    assert_eq!(aggregates_before, aggregates_after);
}

#[tokio::test]
async fn test_identifier_conflict_keeps_original() {
    let engine = engine();
    let original = signed_invoice(U1, "100.00");
    let tampered = signed_invoice(U1, "999.99");

    assert_eq!(engine.ingest(&original).await.kind(), "accepted");
    let outcome = engine.ingest(&tampered).await;
    match outcome {
        IngestOutcome::ConflictRejected(id) => assert_eq!(id, uuid(U1)),
        other => panic!("expected ConflictRejected, got {:?}", other.kind()),
    }

    let record = engine.get(&uuid(U1), &QueryScope::unrestricted()).unwrap();
    assert_eq!(record.total.to_string(), "100.00");
}

#[tokio::test]
async fn test_totals_mismatch_rejected_with_rule() {
    let engine = engine();
    // Break the declared total after sealing; validation runs before the
    // seal check, so the totals rule is what must fire.
    let document =
        signed_invoice(U1, "100.00").replace(" Total=\"100.00\"", " Total=\"100.02\"");

    match engine.ingest(&document).await {
        IngestOutcome::RejectedValidation(report) => {
            assert!(report.has_violation("total-consistency"));
        }
        other => panic!("expected RejectedValidation, got {:?}", other.kind()),
    }
}

#[tokio::test]
async fn test_cancellation_after_ingestion() {
    let engine = engine();
    engine.ingest(&signed_invoice(U1, "100.00")).await;

    let outcome = engine
        .ingest(&cancellation_notice(&[U1], "2024-04-01T09:00:00"))
        .await;
    match outcome {
        IngestOutcome::CancellationProcessed { applied, deferred } => {
            assert_eq!(applied, vec![uuid(U1)]);
            assert!(deferred.is_empty());
        }
        other => panic!("expected CancellationProcessed, got {:?}", other.kind()),
    }

    let record = engine.get(&uuid(U1), &QueryScope::unrestricted()).unwrap();
    assert_eq!(record.status, DocumentStatus::Canceled);
    assert!(!record.audit.is_empty());
}

#[tokio::test]
async fn test_cancellation_before_ingestion_applies_on_arrival() {
    let engine = engine();

    let outcome = engine
        .ingest(&cancellation_notice(&[U1], "2024-04-01T09:00:00"))
        .await;
    match outcome {
        IngestOutcome::CancellationProcessed { applied, deferred } => {
            assert!(applied.is_empty());
            assert_eq!(deferred, vec![uuid(U1)]);
        }
        other => panic!("expected CancellationProcessed, got {:?}", other.kind()),
    }

    // The folio arrives later; the deferred event must apply immediately.
    assert_eq!(
        engine.ingest(&signed_invoice(U1, "100.00")).await.kind(),
        "accepted"
    );
    let record = engine.get(&uuid(U1), &QueryScope::unrestricted()).unwrap();
    assert_eq!(record.status, DocumentStatus::Canceled);
    assert_eq!(engine.deferred_len(), 0);
}

#[tokio::test]
async fn test_substitution_marks_target_replaced() {
    let engine = engine();
    engine.ingest(&signed_invoice(U1, "100.00")).await;

    let replacement = InvoiceBuilder::new(U2, "100.00").substitutes(U1).build();
    assert_eq!(engine.ingest(&replacement).await.kind(), "accepted");

    let replaced = engine.get(&uuid(U1), &QueryScope::unrestricted()).unwrap();
    assert_eq!(replaced.status, DocumentStatus::Replaced);
    assert_eq!(replaced.transitioned_by, Some(uuid(U2)));
}

#[tokio::test]
async fn test_canceled_folio_never_reverts() {
    let engine = engine();
    engine.ingest(&signed_invoice(U1, "100.00")).await;
    engine
        .ingest(&cancellation_notice(&[U1], "2024-04-01T09:00:00"))
        .await;

    // A later substitution event must not move the folio out of Canceled.
    let replacement = InvoiceBuilder::new(U2, "100.00").substitutes(U1).build();
    engine.ingest(&replacement).await;

    let record = engine.get(&uuid(U1), &QueryScope::unrestricted()).unwrap();
    assert_eq!(record.status, DocumentStatus::Canceled);
}

#[tokio::test]
async fn test_status_aggregates_scenario() {
    // U1 Valid 100.00, U2 Valid 250.50, U3 cancels U1:
    // Valid {1, 250.50}, Canceled {1, 100.00}.
    let engine = engine();
    engine.ingest(&signed_invoice(U1, "100.00")).await;
    engine.ingest(&signed_invoice(U2, "250.50")).await;
    engine
        .ingest(&cancellation_notice(&[U1], "2024-04-01T09:00:00"))
        .await;

    let aggregates = engine.aggregate_by_status(&QueryScope::unrestricted());
    let valid = &aggregates[&DocumentStatus::Valid];
    assert_eq!(valid.count, 1);
    assert_eq!(valid.total.to_string(), "250.50");
    let canceled = &aggregates[&DocumentStatus::Canceled];
    assert_eq!(canceled.count, 1);
    assert_eq!(canceled.total.to_string(), "100.00");
}

#[tokio::test]
async fn test_revoked_certificate_rejected() {
    let provider =
        StaticStatusProvider::all_valid().with_status(TEST_SERIAL, CertificateStatus::Revoked);
    let engine = IngestionEngine::new(
        EngineConfig::default(),
        Some(Arc::new(provider)),
    );

    match engine.ingest(&signed_invoice(U1, "100.00")).await {
        IngestOutcome::RejectedSeal(verification) => {
            assert_eq!(verification.chain_status, ChainStatus::Revoked);
            assert_eq!(verification.failure, Some(SealFailure::CertificateRevoked));
        }
        other => panic!("expected RejectedSeal, got {:?}", other.kind()),
    }
}

#[tokio::test]
async fn test_unverifiable_chain_accepted_with_warning() {
    // No collaborator configured: signature still verifies, chain status
    // degrades to a warning on the stored record.
    let engine = IngestionEngine::new(EngineConfig::default(), None);

    match engine.ingest(&signed_invoice(U1, "100.00")).await {
        IngestOutcome::Accepted(record) => {
            assert!(
                record
                    .audit
                    .iter()
                    .any(|entry| entry.message.contains("chain unverifiable"))
            );
        }
        other => panic!("expected Accepted, got {:?}", other.kind()),
    }
}

#[tokio::test]
async fn test_batch_outcomes_preserve_order_and_independence() {
    let engine = engine();
    let documents = vec![
        signed_invoice(U1, "100.00"),
        "<broken".to_string(),
        signed_invoice(U2, "250.50"),
        signed_invoice(U3, "50.00").replace(" Total=\"50.00\"", " Total=\"51.00\""),
    ];

    let outcomes = engine.ingest_batch(documents).await;
    assert_eq!(outcomes.len(), 4);
    assert_eq!(outcomes[0].kind(), "accepted");
    assert_eq!(outcomes[1].kind(), "rejected-parse");
    assert_eq!(outcomes[2].kind(), "accepted");
    assert_eq!(outcomes[3].kind(), "rejected-validation");

    // The broken documents did not affect the committed ones.
    assert_eq!(engine.store().len(), 2);
}
