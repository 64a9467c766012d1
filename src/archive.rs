//! Durable Document Archive
//!
//! Content-addressed persistence via cacache: one envelope per folio holding
//! the record (status and audit trail included), the parsed tree, and the
//! raw submitted XML for re-verification and audit replay. Reloading an
//! archive rebuilds an index store indistinguishable from one that ingested
//! every document in original order.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::DocumentTree;
use crate::error::ArchiveError;
use crate::store::{CfdiRecord, IndexStore};

/// Serialized per-folio payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordEnvelope {
    record: CfdiRecord,
    tree: DocumentTree,
    raw_xml: String,
}

/// cacache-backed archive rooted at one directory.
pub struct DocumentArchive {
    dir: PathBuf,
}

impl DocumentArchive {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Write (or overwrite) the envelope for one folio. Called after every
    /// accepted ingestion and after every status transition so the stored
    /// state always matches the index.
    pub async fn persist(
        &self,
        record: &CfdiRecord,
        tree: &DocumentTree,
        raw_xml: &str,
    ) -> Result<(), ArchiveError> {
        let key = record.uuid.to_string();
        let envelope = RecordEnvelope {
            record: record.clone(),
            tree: tree.clone(),
            raw_xml: raw_xml.to_string(),
        };
        let bytes = serde_json::to_vec(&envelope).map_err(|e| ArchiveError::Write {
            key: key.clone(),
            detail: e.to_string(),
        })?;
        cacache::write(&self.dir, &key, &bytes)
            .await
            .map_err(|e| ArchiveError::Write {
                key,
                detail: e.to_string(),
            })?;
        Ok(())
    }

    /// Load one folio's envelope, if present.
    pub async fn load(
        &self,
        uuid: &Uuid,
    ) -> Result<Option<(CfdiRecord, DocumentTree, String)>, ArchiveError> {
        let key = uuid.to_string();
        let bytes = match cacache::read(&self.dir, &key).await {
            Ok(bytes) => bytes,
            Err(cacache::Error::EntryNotFound(_, _)) => return Ok(None),
            Err(e) => {
                return Err(ArchiveError::Read {
                    key,
                    detail: e.to_string(),
                });
            }
        };
        let envelope: RecordEnvelope =
            serde_json::from_slice(&bytes).map_err(|e| ArchiveError::Corrupt {
                key,
                detail: e.to_string(),
            })?;
        Ok(Some((envelope.record, envelope.tree, envelope.raw_xml)))
    }

    /// Rebuild a store from every archived envelope. Returns the number of
    /// records loaded.
    pub async fn load_into(&self, store: &IndexStore) -> Result<usize, ArchiveError> {
        let entries = match cacache::index::ls(&self.dir).collect::<Result<Vec<_>, _>>() {
            Ok(entries) => entries,
            // A directory that has never been written to is an empty
            // archive, not an error.
            Err(_) => return Ok(0),
        };

        let mut loaded = 0;
        for entry in entries {
            let uuid = Uuid::parse_str(&entry.key).map_err(|e| ArchiveError::Index {
                detail: format!("non-folio key {:?}: {}", entry.key, e),
            })?;
            let Some((record, tree, raw_xml)) = self.load(&uuid).await? else {
                continue;
            };
            store
                .upsert(record, Arc::from(tree), Arc::from(raw_xml.as_str()))
                .map_err(|e| ArchiveError::Corrupt {
                    key: entry.key.clone(),
                    detail: e.to_string(),
                })?;
            loaded += 1;
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Amount;
    use crate::lifecycle::DocumentStatus;
    use crate::parser::{Parsed, parse};
    use chrono::NaiveDateTime;
    use tempfile::TempDir;

    const XML: &str = r#"<cfdi:Comprobante xmlns:cfdi="http://www.sat.gob.mx/cfd/4" Version="4.0"
    Fecha="2024-03-15T10:30:00" Moneda="MXN" SubTotal="100.00" Total="116.00"
    TipoDeComprobante="I" Exportacion="01" Sello="QQ==" NoCertificado="1" Certificado="QQ==">
  <cfdi:Emisor Rfc="EKU9003173C9" Nombre="E"/>
  <cfdi:Receptor Rfc="XAXX010101000" Nombre="P"/>
  <cfdi:Conceptos><cfdi:Concepto Cantidad="1" Descripcion="S" ValorUnitario="100.00" Importe="100.00"/></cfdi:Conceptos>
  <cfdi:Complemento>
    <tfd:TimbreFiscalDigital xmlns:tfd="http://www.sat.gob.mx/TimbreFiscalDigital"
        UUID="AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE"/>
  </cfdi:Complemento>
</cfdi:Comprobante>"#;

    fn sample() -> (CfdiRecord, DocumentTree) {
        let tree = match parse(XML).unwrap() {
            Parsed::Comprobante(tree) => *tree,
            other => panic!("expected Comprobante, got {:?}", other),
        };
        let record = CfdiRecord {
            uuid: tree.uuid(),
            issuer_rfc: tree.issuer.rfc.clone(),
            receiver_rfc: tree.receiver.rfc.clone(),
            issued_at: NaiveDateTime::parse_from_str(
                "2024-03-15T10:30:00",
                "%Y-%m-%dT%H:%M:%S",
            )
            .unwrap(),
            total: Amount::from_centavos(11_600),
            currency: "MXN".to_string(),
            document_type: "I".to_string(),
            status: DocumentStatus::Valid,
            transitioned_by: None,
            content_hash: "abc123".to_string(),
            audit: Vec::new(),
        };
        (record, tree)
    }

    #[tokio::test]
    async fn test_persist_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let archive = DocumentArchive::new(dir.path().to_path_buf());
        let (record, tree) = sample();

        archive.persist(&record, &tree, XML).await.unwrap();
        let (loaded_record, loaded_tree, loaded_raw) =
            archive.load(&record.uuid).await.unwrap().unwrap();
        assert_eq!(loaded_record, record);
        assert_eq!(loaded_tree, tree);
        assert_eq!(loaded_raw, XML);
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let archive = DocumentArchive::new(dir.path().to_path_buf());
        assert!(archive.load(&Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persist_overwrites_on_transition() {
        let dir = TempDir::new().unwrap();
        let archive = DocumentArchive::new(dir.path().to_path_buf());
        let (mut record, tree) = sample();

        archive.persist(&record, &tree, XML).await.unwrap();
        record.status = DocumentStatus::Canceled;
        archive.persist(&record, &tree, XML).await.unwrap();

        let (loaded, _, _) = archive.load(&record.uuid).await.unwrap().unwrap();
        assert_eq!(loaded.status, DocumentStatus::Canceled);
    }

    #[tokio::test]
    async fn test_corrupt_entry_reported() {
        let dir = TempDir::new().unwrap();
        let archive = DocumentArchive::new(dir.path().to_path_buf());
        let uuid = Uuid::new_v4();
        cacache::write(dir.path(), uuid.to_string(), b"not json")
            .await
            .unwrap();

        match archive.load(&uuid).await {
            Err(ArchiveError::Corrupt { .. }) => (),
            other => panic!("expected Corrupt, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_load_into_empty_dir() {
        let dir = TempDir::new().unwrap();
        let archive = DocumentArchive::new(dir.path().join("never-written"));
        let store = IndexStore::new();
        assert_eq!(archive.load_into(&store).await.unwrap(), 0);
    }
}
