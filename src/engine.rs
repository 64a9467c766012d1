//! Ingestion Orchestrator
//!
//! The public entry point. Sequences Parser -> Rule Engine -> Seal Verifier
//! -> Lifecycle Resolver -> Index Store for each submitted document,
//! short-circuiting on fatal failure, and exposes the read-only query and
//! aggregate API consumed by dashboards. Every submitted document produces
//! exactly one typed outcome and one structured log event; nothing is
//! silently dropped and no single document's failure affects the rest of a
//! batch.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::archive::DocumentArchive;
use crate::cert_status::CertificateStatusProvider;
use crate::document::{Amount, CancellationNotice, DocumentTree, Period};
use crate::error::{ConfigError, ParseError, Result};
use crate::lifecycle::{DeferredEvents, DocumentStatus, LifecycleAction, LifecycleEvent};
use crate::parser::{Parsed, parse};
use crate::rules::{RuleContext, ValidationReport, validate};
use crate::seal::{ChainStatus, SealVerification, SealVerifier};
use crate::store::{
    AggregateBucket, AuditEntry, AuditKind, CfdiRecord, IndexStore, PeriodAggregate, QueryScope,
    UpsertDisposition,
};

/// Engine configuration. Loadable from a TOML file; every field has a
/// production default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrent ingestions in a batch.
    pub max_concurrent_ingestions: usize,
    /// Forward clock-skew tolerance for issue dates, in seconds.
    pub clock_skew_secs: u64,
    /// Certificate-status lookup timeout, in seconds.
    pub status_timeout_secs: u64,
    /// Retention window for deferred lifecycle events, in days.
    pub deferred_retention_days: i64,
    /// Durable archive directory; `None` keeps the engine memory-only.
    pub archive_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_ingestions: num_cpus::get(),
            clock_skew_secs: 300,
            status_timeout_secs: 5,
            deferred_retention_days: 30,
            archive_dir: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub async fn from_file(path: &std::path::Path) -> std::result::Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let text = tokio::fs::read_to_string(path).await?;
        let config: EngineConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.max_concurrent_ingestions == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_concurrent_ingestions".to_string(),
                value: "0".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.deferred_retention_days < 0 {
            return Err(ConfigError::InvalidValue {
                field: "deferred_retention_days".to_string(),
                value: self.deferred_retention_days.to_string(),
                reason: "must be non-negative".to_string(),
            });
        }
        Ok(())
    }
}

/// Outcome of ingesting one submitted document. Exactly one is produced
/// per submission, accepted or not.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// Stored with status `Valid` (possibly transitioned immediately by a
    /// deferred event).
    Accepted(CfdiRecord),
    RejectedParse(ParseError),
    RejectedValidation(ValidationReport),
    RejectedSeal(SealVerification),
    /// Identical bytes for an already-stored folio.
    DuplicateIgnored(Uuid),
    /// Same folio, different content: integrity violation.
    ConflictRejected(Uuid),
    /// A cancellation notice was applied and/or deferred.
    CancellationProcessed {
        applied: Vec<Uuid>,
        deferred: Vec<Uuid>,
    },
}

impl IngestOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            IngestOutcome::Accepted(_) => "accepted",
            IngestOutcome::RejectedParse(_) => "rejected-parse",
            IngestOutcome::RejectedValidation(_) => "rejected-validation",
            IngestOutcome::RejectedSeal(_) => "rejected-seal",
            IngestOutcome::DuplicateIgnored(_) => "duplicate-ignored",
            IngestOutcome::ConflictRejected(_) => "conflict-rejected",
            IngestOutcome::CancellationProcessed { .. } => "cancellation-processed",
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            IngestOutcome::Accepted(_) | IngestOutcome::CancellationProcessed { .. }
        )
    }
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<IndexStore>,
    seal_verifier: SealVerifier,
    deferred: Mutex<DeferredEvents>,
    archive: Option<DocumentArchive>,
}

/// The CFDI ingestion engine. Cloning is cheap; clones share the same
/// store, deferred-event queue and archive.
#[derive(Clone)]
pub struct IngestionEngine {
    inner: Arc<EngineInner>,
}

impl IngestionEngine {
    pub fn new(
        config: EngineConfig,
        status_provider: Option<Arc<dyn CertificateStatusProvider>>,
    ) -> Self {
        let seal_verifier = SealVerifier::new(
            status_provider,
            Duration::from_secs(config.status_timeout_secs),
        );
        let deferred = Mutex::new(DeferredEvents::new(chrono::Duration::days(
            config.deferred_retention_days,
        )));
        let archive = config.archive_dir.clone().map(DocumentArchive::new);

        Self {
            inner: Arc::new(EngineInner {
                config,
                store: Arc::new(IndexStore::new()),
                seal_verifier,
                deferred,
                archive,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.inner.store
    }

    /// Rebuild the index from the durable archive, if one is configured.
    pub async fn load_archive(&self) -> Result<usize> {
        match &self.inner.archive {
            Some(archive) => {
                let loaded = archive.load_into(&self.inner.store).await?;
                tracing::info!(records = loaded, "archive loaded");
                Ok(loaded)
            }
            None => Ok(0),
        }
    }

    /// Ingest one raw XML document and return its outcome.
    pub async fn ingest(&self, raw: &str) -> IngestOutcome {
        let outcome = self.ingest_inner(raw).await;
        self.log_outcome(&outcome);
        outcome
    }

    /// Ingest a batch concurrently, bounded by
    /// `max_concurrent_ingestions`. Outcomes are returned in submission
    /// order; each document is independently atomic.
    pub async fn ingest_batch(&self, documents: Vec<String>) -> Vec<IngestOutcome> {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(
            self.inner.config.max_concurrent_ingestions,
        ));

        let tasks: Vec<_> = documents
            .into_iter()
            .map(|raw| {
                let engine = self.clone();
                let semaphore = Arc::clone(&semaphore);
                tokio::spawn(async move {
                    let _permit = semaphore.acquire().await;
                    engine.ingest(&raw).await
                })
            })
            .collect();

        join_all(tasks)
            .await
            .into_iter()
            .map(|joined| match joined {
                Ok(outcome) => outcome,
                Err(e) => IngestOutcome::RejectedParse(ParseError::Malformed {
                    detail: format!("ingestion task failed: {}", e),
                }),
            })
            .collect()
    }

    async fn ingest_inner(&self, raw: &str) -> IngestOutcome {
        let tree = match parse(raw) {
            Ok(Parsed::Comprobante(tree)) => tree,
            Ok(Parsed::Cancellation(notice)) => {
                return self.process_cancellation(notice).await;
            }
            Err(e) => return IngestOutcome::RejectedParse(e),
        };

        let rule_ctx = RuleContext {
            now: Utc::now().naive_utc(),
            clock_skew: chrono::Duration::seconds(self.inner.config.clock_skew_secs as i64),
        };
        let report = validate(&tree, &rule_ctx);
        if !report.passed() {
            return IngestOutcome::RejectedValidation(report);
        }

        let verification = self.inner.seal_verifier.verify(&tree).await;
        if !verification.valid {
            return IngestOutcome::RejectedSeal(verification);
        }

        self.commit(*tree, raw, &report, &verification).await
    }

    /// Store a fully verified document and apply any lifecycle events
    /// waiting for it.
    async fn commit(
        &self,
        tree: DocumentTree,
        raw: &str,
        report: &ValidationReport,
        verification: &SealVerification,
    ) -> IngestOutcome {
        let now = Utc::now();
        let uuid = tree.uuid();

        let mut audit = Vec::new();
        for warning in report.warnings() {
            audit.push(AuditEntry {
                at: now,
                kind: AuditKind::Warning,
                message: format!("{}: {}", warning.rule, warning.message),
            });
        }
        if verification.chain_status == ChainStatus::Unverifiable {
            audit.push(AuditEntry {
                at: now,
                kind: AuditKind::Warning,
                message: "certificate chain unverifiable".to_string(),
            });
        }

        let record = CfdiRecord {
            uuid,
            issuer_rfc: tree.issuer.rfc.clone(),
            receiver_rfc: tree.receiver.rfc.clone(),
            issued_at: tree.issue_date.value.unwrap_or_default(),
            total: tree.total.value().copied().unwrap_or(Amount::ZERO),
            currency: tree.currency.clone(),
            document_type: tree.document_type.clone(),
            status: DocumentStatus::Valid,
            transitioned_by: None,
            content_hash: content_hash(raw),
            audit,
        };

        let substituted: Vec<Uuid> = tree.substituted_folios().collect();
        let effective_at = tree.issue_date.value.unwrap_or_default();
        let tree = Arc::new(tree);
        let raw_arc: Arc<str> = Arc::from(raw);

        match self
            .inner
            .store
            .upsert(record, Arc::clone(&tree), Arc::clone(&raw_arc))
        {
            Ok(UpsertDisposition::Inserted) => {}
            Ok(UpsertDisposition::Duplicate) => return IngestOutcome::DuplicateIgnored(uuid),
            Err(_) => return IngestOutcome::ConflictRejected(uuid),
        }

        // Deferred events queued against this folio apply now, in arrival
        // order.
        let waiting = self.inner.deferred.lock().take_for(&uuid, now);
        for event in waiting {
            self.apply_event(&event).await;
        }

        // This document may itself replace earlier folios.
        for target in substituted {
            let event = LifecycleEvent {
                target,
                action: LifecycleAction::Replace,
                actor: Some(uuid),
                effective_at,
            };
            self.apply_or_defer(event, now).await;
        }

        let Some(record) = self.inner.store.get(&uuid) else {
            // Unreachable in practice: the record was just inserted.
            return IngestOutcome::ConflictRejected(uuid);
        };
        self.persist(&record).await;
        IngestOutcome::Accepted(record)
    }

    async fn process_cancellation(&self, notice: CancellationNotice) -> IngestOutcome {
        let now = Utc::now();
        self.inner.deferred.lock().expire(now);

        let mut applied = Vec::new();
        let mut deferred = Vec::new();
        for folio in &notice.folios {
            let event = LifecycleEvent {
                target: folio.uuid,
                action: LifecycleAction::Cancel,
                actor: folio.substitution,
                effective_at: notice.effective_at,
            };
            match self.apply_or_defer(event, now).await {
                EventDisposition::Applied => applied.push(folio.uuid),
                EventDisposition::Deferred => deferred.push(folio.uuid),
                EventDisposition::Ignored => {}
            }
        }

        IngestOutcome::CancellationProcessed { applied, deferred }
    }

    async fn apply_or_defer(
        &self,
        event: LifecycleEvent,
        now: chrono::DateTime<Utc>,
    ) -> EventDisposition {
        use crate::store::TransitionOutcome;
        match self.inner.store.transition(&event, now) {
            TransitionOutcome::Applied { .. } => {
                if let Some(record) = self.inner.store.get(&event.target) {
                    self.persist(&record).await;
                }
                EventDisposition::Applied
            }
            TransitionOutcome::AlreadyTerminal(status) => {
                tracing::info!(
                    target_folio = %event.target,
                    status = %status,
                    "lifecycle event ignored: folio already terminal"
                );
                EventDisposition::Ignored
            }
            TransitionOutcome::UnknownTarget => {
                self.inner.deferred.lock().defer(event, now);
                EventDisposition::Deferred
            }
        }
    }

    async fn apply_event(&self, event: &LifecycleEvent) {
        use crate::store::TransitionOutcome;
        match self.inner.store.transition(event, Utc::now()) {
            TransitionOutcome::Applied { .. } => {
                if let Some(record) = self.inner.store.get(&event.target) {
                    self.persist(&record).await;
                }
            }
            TransitionOutcome::AlreadyTerminal(status) => {
                tracing::info!(
                    target_folio = %event.target,
                    status = %status,
                    "deferred event ignored: folio already terminal"
                );
            }
            TransitionOutcome::UnknownTarget => {
                // take_for only returns events for a folio that was just
                // inserted; a miss here means the store lost it, which the
                // conflict path would have reported already.
                tracing::warn!(target_folio = %event.target, "deferred event target vanished");
            }
        }
    }

    async fn persist(&self, record: &CfdiRecord) {
        let Some(archive) = &self.inner.archive else {
            return;
        };
        let Some((tree, raw)) = self.inner.store.document(&record.uuid) else {
            return;
        };
        if let Err(e) = archive.persist(record, &tree, &raw).await {
            // Archive failures degrade durability, not ingestion.
            tracing::error!(folio = %record.uuid, error = %e, "archive write failed");
        }
    }

    fn log_outcome(&self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Accepted(record) => {
                tracing::info!(
                    folio = %record.uuid,
                    outcome = outcome.kind(),
                    issuer = %record.issuer_rfc,
                    total = %record.total,
                    "document ingested"
                );
            }
            IngestOutcome::RejectedParse(e) => {
                tracing::info!(outcome = outcome.kind(), error = %e, "document rejected");
            }
            IngestOutcome::RejectedValidation(report) => {
                tracing::info!(
                    outcome = outcome.kind(),
                    violations = report.violations().len(),
                    first = report.violations().first().map(|v| v.rule).unwrap_or(""),
                    "document rejected"
                );
            }
            IngestOutcome::RejectedSeal(verification) => {
                tracing::info!(
                    outcome = outcome.kind(),
                    failure = ?verification.failure,
                    chain = ?verification.chain_status,
                    "document rejected"
                );
            }
            IngestOutcome::DuplicateIgnored(uuid) => {
                tracing::info!(folio = %uuid, outcome = outcome.kind(), "duplicate ignored");
            }
            IngestOutcome::ConflictRejected(uuid) => {
                tracing::warn!(
                    folio = %uuid,
                    outcome = outcome.kind(),
                    "identifier conflict: possible tampering"
                );
            }
            IngestOutcome::CancellationProcessed { applied, deferred } => {
                tracing::info!(
                    outcome = outcome.kind(),
                    applied = applied.len(),
                    deferred = deferred.len(),
                    "cancellation notice processed"
                );
            }
        }
    }

    // -- read API ------------------------------------------------------

    pub fn get(&self, uuid: &Uuid, scope: &QueryScope) -> Option<CfdiRecord> {
        self.inner
            .store
            .get(uuid)
            .filter(|record| scope.allows(&record.issuer_rfc))
    }

    pub fn query_by_issuer_period(
        &self,
        issuer_rfc: &str,
        period: Period,
        scope: &QueryScope,
    ) -> Vec<CfdiRecord> {
        self.inner
            .store
            .query_by_issuer_period(issuer_rfc, period, scope)
    }

    pub fn aggregate_by_status(
        &self,
        scope: &QueryScope,
    ) -> BTreeMap<DocumentStatus, AggregateBucket> {
        self.inner.store.aggregate_by_status(scope)
    }

    pub fn aggregate_by_period(&self, period: Period, scope: &QueryScope) -> PeriodAggregate {
        self.inner.store.aggregate_by_period(period, scope)
    }

    /// Drop deferred events past the retention window. Returns how many
    /// were dropped.
    pub fn expire_deferred(&self) -> usize {
        self.inner.deferred.lock().expire(Utc::now())
    }

    pub fn deferred_len(&self) -> usize {
        self.inner.deferred.lock().len()
    }

    pub fn orphaned_events_total(&self) -> u64 {
        self.inner.deferred.lock().orphaned_total()
    }
}

enum EventDisposition {
    Applied,
    Deferred,
    Ignored,
}

/// SHA-256 of the raw submitted bytes, lowercase hex.
pub fn content_hash(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
