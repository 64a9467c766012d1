//! Index Store
//!
//! Owns the canonical record set. One `parking_lot::RwLock` guards the
//! primary map, the secondary indices and the incrementally-maintained
//! aggregate buckets, so every mutation is a single logical transaction:
//! readers always observe primary and secondary state that agree.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::{Amount, DocumentTree, Period};
use crate::error::StoreError;
use crate::lifecycle::{DocumentStatus, LifecycleEvent, apply_transition};

/// One entry in a record's append-only audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub kind: AuditKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    Warning,
    Transition,
}

/// The unit stored in the index: queryable metadata for one folio.
///
/// Records are never deleted; cancellation and replacement only transition
/// `status` and append to `audit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CfdiRecord {
    pub uuid: Uuid,
    pub issuer_rfc: String,
    pub receiver_rfc: String,
    pub issued_at: NaiveDateTime,
    pub total: Amount,
    pub currency: String,
    pub document_type: String,
    pub status: DocumentStatus,
    /// Folio of the document or notice that canceled/replaced this one.
    pub transitioned_by: Option<Uuid>,
    /// SHA-256 of the raw submitted bytes, lowercase hex. Drives
    /// deduplication and conflict detection.
    pub content_hash: String,
    pub audit: Vec<AuditEntry>,
}

impl CfdiRecord {
    pub fn period(&self) -> Period {
        Period::from_date(&self.issued_at)
    }
}

struct StoredEntry {
    record: CfdiRecord,
    tree: Arc<DocumentTree>,
    raw_xml: Arc<str>,
}

/// Disposition of an `upsert` that did not conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertDisposition {
    Inserted,
    /// Identifier already present with identical content; no-op.
    Duplicate,
}

/// Result of applying a lifecycle event to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied {
        from: DocumentStatus,
        to: DocumentStatus,
    },
    /// Target is already in a terminal status; the event is a no-op.
    AlreadyTerminal(DocumentStatus),
    /// Target folio is not in the store.
    UnknownTarget,
}

/// Count/sum pair for one aggregate bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AggregateBucket {
    pub count: usize,
    pub total: Amount,
}

impl AggregateBucket {
    fn add(&mut self, amount: &Amount) {
        self.count += 1;
        self.total = self.total.add(amount);
    }

    fn remove(&mut self, amount: &Amount) {
        self.count = self.count.saturating_sub(1);
        self.total = self.total.sub(amount);
    }
}

/// Aggregate view of one period.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PeriodAggregate {
    pub count: usize,
    pub total: Amount,
    pub by_document_type: BTreeMap<String, AggregateBucket>,
}

/// Issuer-RFC scope restricting what a caller may read.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryScope {
    pub issuer_rfc: Option<String>,
}

impl QueryScope {
    pub fn unrestricted() -> Self {
        QueryScope::default()
    }

    pub fn for_issuer(rfc: impl Into<String>) -> Self {
        QueryScope {
            issuer_rfc: Some(rfc.into()),
        }
    }

    pub fn allows(&self, issuer_rfc: &str) -> bool {
        match &self.issuer_rfc {
            Some(scope_rfc) => scope_rfc == issuer_rfc,
            None => true,
        }
    }
}

#[derive(Default)]
struct Inner {
    primary: HashMap<Uuid, StoredEntry>,
    by_issuer_period: BTreeMap<(String, Period), BTreeSet<(NaiveDateTime, Uuid)>>,
    by_status: HashMap<DocumentStatus, BTreeSet<Uuid>>,
    status_aggregates: HashMap<DocumentStatus, AggregateBucket>,
    period_aggregates: HashMap<Period, PeriodAggregate>,
}

/// In-memory index keyed by folio fiscal with secondary indices by
/// (issuer RFC, period) and by status.
#[derive(Default)]
pub struct IndexStore {
    inner: RwLock<Inner>,
}

impl IndexStore {
    pub fn new() -> Self {
        IndexStore::default()
    }

    /// Insert a record. Re-submitting identical content is an idempotent
    /// no-op; the same identifier with different content is rejected.
    pub fn upsert(
        &self,
        record: CfdiRecord,
        tree: Arc<DocumentTree>,
        raw_xml: Arc<str>,
    ) -> Result<UpsertDisposition, StoreError> {
        let mut inner = self.inner.write();

        if let Some(existing) = inner.primary.get(&record.uuid) {
            if existing.record.content_hash == record.content_hash {
                return Ok(UpsertDisposition::Duplicate);
            }
            return Err(StoreError::IdentifierConflict {
                identifier: record.uuid,
            });
        }

        let uuid = record.uuid;
        let period = record.period();
        inner
            .by_issuer_period
            .entry((record.issuer_rfc.clone(), period))
            .or_default()
            .insert((record.issued_at, uuid));
        inner.by_status.entry(record.status).or_default().insert(uuid);
        inner
            .status_aggregates
            .entry(record.status)
            .or_default()
            .add(&record.total);
        let period_agg = inner.period_aggregates.entry(period).or_default();
        period_agg.count += 1;
        period_agg.total = period_agg.total.add(&record.total);
        period_agg
            .by_document_type
            .entry(record.document_type.clone())
            .or_default()
            .add(&record.total);

        inner.primary.insert(
            uuid,
            StoredEntry {
                record,
                tree,
                raw_xml,
            },
        );
        Ok(UpsertDisposition::Inserted)
    }

    /// Apply a cancellation/replacement event. Primary record, status index
    /// and aggregates move together under the write lock.
    pub fn transition(&self, event: &LifecycleEvent, now: DateTime<Utc>) -> TransitionOutcome {
        let mut guard = self.inner.write();
        let Inner {
            primary,
            by_status,
            status_aggregates,
            ..
        } = &mut *guard;
        let Some(entry) = primary.get_mut(&event.target) else {
            return TransitionOutcome::UnknownTarget;
        };
        let from = entry.record.status;
        let total = entry.record.total;
        let Some(to) = apply_transition(from, event.action) else {
            return TransitionOutcome::AlreadyTerminal(from);
        };

        if let Some(set) = by_status.get_mut(&from) {
            set.remove(&event.target);
        }
        by_status.entry(to).or_default().insert(event.target);
        status_aggregates.entry(from).or_default().remove(&total);
        status_aggregates.entry(to).or_default().add(&total);

        entry.record.status = to;
        entry.record.transitioned_by = event.actor;
        entry.record.audit.push(AuditEntry {
            at: now,
            kind: AuditKind::Transition,
            message: format!("{} -> {} effective {}", from, to, event.effective_at),
        });

        TransitionOutcome::Applied { from, to }
    }

    pub fn get(&self, uuid: &Uuid) -> Option<CfdiRecord> {
        self.inner.read().primary.get(uuid).map(|e| e.record.clone())
    }

    /// The parsed tree and raw bytes of a stored document, for audit
    /// replay and re-verification.
    pub fn document(&self, uuid: &Uuid) -> Option<(Arc<DocumentTree>, Arc<str>)> {
        self.inner
            .read()
            .primary
            .get(uuid)
            .map(|e| (Arc::clone(&e.tree), Arc::clone(&e.raw_xml)))
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.inner.read().primary.contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.inner.read().primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().primary.is_empty()
    }

    /// Records for one issuer and period, ordered by (issue timestamp,
    /// folio).
    pub fn query_by_issuer_period(
        &self,
        issuer_rfc: &str,
        period: Period,
        scope: &QueryScope,
    ) -> Vec<CfdiRecord> {
        if !scope.allows(issuer_rfc) {
            return Vec::new();
        }
        let inner = self.inner.read();
        let Some(ids) = inner
            .by_issuer_period
            .get(&(issuer_rfc.to_string(), period))
        else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|(_, uuid)| inner.primary.get(uuid))
            .map(|e| e.record.clone())
            .collect()
    }

    /// Counts and sums per status. Unscoped calls read the incrementally
    /// maintained buckets; scoped calls scan the issuer's records under the
    /// same read lock.
    pub fn aggregate_by_status(
        &self,
        scope: &QueryScope,
    ) -> BTreeMap<DocumentStatus, AggregateBucket> {
        let inner = self.inner.read();
        match &scope.issuer_rfc {
            None => inner
                .status_aggregates
                .iter()
                .filter(|(_, bucket)| bucket.count > 0)
                .map(|(status, bucket)| (*status, *bucket))
                .collect(),
            Some(rfc) => {
                let mut out: BTreeMap<DocumentStatus, AggregateBucket> = BTreeMap::new();
                for entry in inner.primary.values() {
                    if &entry.record.issuer_rfc == rfc {
                        out.entry(entry.record.status)
                            .or_default()
                            .add(&entry.record.total);
                    }
                }
                out
            }
        }
    }

    /// Count, sum and document-type breakdown for one period.
    pub fn aggregate_by_period(&self, period: Period, scope: &QueryScope) -> PeriodAggregate {
        let inner = self.inner.read();
        match &scope.issuer_rfc {
            None => inner
                .period_aggregates
                .get(&period)
                .cloned()
                .unwrap_or_default(),
            Some(rfc) => {
                let mut out = PeriodAggregate::default();
                for entry in inner.primary.values() {
                    let record = &entry.record;
                    if &record.issuer_rfc == rfc && record.period() == period {
                        out.count += 1;
                        out.total = out.total.add(&record.total);
                        out.by_document_type
                            .entry(record.document_type.clone())
                            .or_default()
                            .add(&record.total);
                    }
                }
                out
            }
        }
    }

    /// Snapshot of every record, ordered by folio for determinism.
    pub fn records(&self) -> Vec<CfdiRecord> {
        let inner = self.inner.read();
        let mut records: Vec<CfdiRecord> =
            inner.primary.values().map(|e| e.record.clone()).collect();
        records.sort_by_key(|r| r.uuid);
        records
    }

    /// Every identifier in a secondary index must resolve in the primary
    /// map. Exposed for tests and startup sanity checks.
    pub fn check_index_invariants(&self) -> bool {
        let inner = self.inner.read();
        let primary_ok = inner
            .by_issuer_period
            .values()
            .flatten()
            .all(|(_, uuid)| inner.primary.contains_key(uuid));
        let status_ok = inner
            .by_status
            .values()
            .flatten()
            .all(|uuid| inner.primary.contains_key(uuid));
        let counts_ok = inner
            .by_status
            .iter()
            .all(|(status, set)| {
                inner
                    .status_aggregates
                    .get(status)
                    .map(|b| b.count)
                    .unwrap_or(0)
                    == set.len()
            });
        primary_ok && status_ok && counts_ok
    }
}
