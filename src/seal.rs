//! Digital Seal Verification
//!
//! Rebuilds the pipe-delimited original chain the issuer signed, decodes the
//! embedded certificate and seal, and verifies SHA-256-with-RSA (PKCS#1
//! v1.5) over the chain. Fails closed: every decoding error, algorithm
//! mismatch or signature mismatch yields an `invalid` result, never an
//! error that aborts ingestion.
//!
//! Certificate revocation is delegated to the certificate-status
//! collaborator. The chain check and the signature check are orthogonal and
//! both surfaced: an unreachable collaborator degrades the chain status to
//! `Unverifiable` while the local signature verdict stands on its own.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rsa::RsaPublicKey;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_cert::Certificate;
use x509_cert::der::{Decode, Encode};

use crate::cert_status::{CertificateStatus, CertificateStatusProvider};
use crate::document::DocumentTree;

/// The signing-algorithm identifier the tax authority mandates.
pub const REQUIRED_ALGORITHM: &str = "SHA256withRSA";

/// Why a seal failed verification.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SealFailure {
    #[error("malformed certificate: {detail}")]
    MalformedCertificate { detail: String },

    #[error("certificate serial mismatch: document declares {declared}, certificate carries {embedded}")]
    SerialMismatch { declared: String, embedded: String },

    #[error("unsupported signing algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },

    #[error("certificate not valid at issue time")]
    CertificateExpired,

    #[error("certificate revoked by the certification authority")]
    CertificateRevoked,

    #[error("signature does not match the original chain")]
    SignatureMismatch,
}

/// Trust-chain verdict from the certificate-status collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChainStatus {
    Trusted,
    Revoked,
    /// Collaborator absent, timed out, or answered `unknown`.
    Unverifiable,
}

/// Result of verifying one document's seal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SealVerification {
    /// True only when the signature matched and the certificate passed all
    /// local checks and is not known-revoked.
    pub valid: bool,
    /// SHA-256 digest of the original chain, lowercase hex.
    pub digest_hex: String,
    /// The reconstructed canonical plaintext.
    pub original_chain: String,
    pub failure: Option<SealFailure>,
    pub chain_status: ChainStatus,
}

/// Rebuild the canonical pipe-delimited plaintext the issuer signed.
///
/// Field order is fixed: header fields, then one
/// `cantidad|valorUnitario|importe` triple per concept, in document order.
/// Raw lexemes are used verbatim so the chain matches the signed bytes.
pub fn original_chain(tree: &DocumentTree) -> String {
    let mut fields: Vec<&str> = vec![
        tree.version.as_str(),
        &tree.issue_date.raw,
        &tree.document_type,
        &tree.currency,
        &tree.subtotal.raw,
        &tree.total.raw,
        &tree.issuer.rfc,
        &tree.receiver.rfc,
        &tree.seal.certificate_serial,
    ];
    for concept in &tree.concepts {
        fields.push(&concept.quantity.raw);
        fields.push(&concept.unit_value.raw);
        fields.push(&concept.amount.raw);
    }
    format!("||{}||", fields.join("|"))
}

/// Signature and local certificate checks only; no collaborator involved.
/// Returns the chain, its digest and the first failure encountered.
pub fn verify_offline(tree: &DocumentTree) -> (String, String, Option<SealFailure>) {
    let chain = original_chain(tree);
    let digest_hex = hex_digest(&chain);
    let failure = check_signature(tree, &chain).err();
    (chain, digest_hex, failure)
}

fn hex_digest(chain: &str) -> String {
    let digest = Sha256::digest(chain.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn check_signature(tree: &DocumentTree, chain: &str) -> Result<(), SealFailure> {
    if let Some(algorithm) = &tree.seal.algorithm
        && algorithm != REQUIRED_ALGORITHM
    {
        return Err(SealFailure::UnsupportedAlgorithm {
            algorithm: algorithm.clone(),
        });
    }

    let cert_der = decode_b64(&tree.seal.certificate_b64).map_err(|detail| {
        SealFailure::MalformedCertificate { detail }
    })?;
    let certificate =
        Certificate::from_der(&cert_der).map_err(|e| SealFailure::MalformedCertificate {
            detail: e.to_string(),
        })?;

    let embedded_serial = serial_text(certificate.tbs_certificate.serial_number.as_bytes());
    if embedded_serial != tree.seal.certificate_serial {
        return Err(SealFailure::SerialMismatch {
            declared: tree.seal.certificate_serial.clone(),
            embedded: embedded_serial,
        });
    }

    if let Some(issued_at) = tree.issue_date.value {
        let ts = issued_at.and_utc().timestamp();
        let not_before = certificate
            .tbs_certificate
            .validity
            .not_before
            .to_unix_duration()
            .as_secs() as i64;
        let not_after = certificate
            .tbs_certificate
            .validity
            .not_after
            .to_unix_duration()
            .as_secs() as i64;
        if ts < not_before || ts > not_after {
            return Err(SealFailure::CertificateExpired);
        }
    }

    let spki_der = certificate
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| SealFailure::MalformedCertificate {
            detail: e.to_string(),
        })?;
    let public_key = RsaPublicKey::from_public_key_der(&spki_der).map_err(|_| {
        SealFailure::UnsupportedAlgorithm {
            algorithm: "non-RSA subject public key".to_string(),
        }
    })?;

    let seal_bytes =
        decode_b64(&tree.seal.seal_b64).map_err(|_| SealFailure::SignatureMismatch)?;
    let signature =
        Signature::try_from(seal_bytes.as_slice()).map_err(|_| SealFailure::SignatureMismatch)?;

    verify_chain_with_key(&public_key, chain, &signature)
}

/// Verify the chain against an already-resolved public key. Split out so
/// the RSA path is testable without constructing a certificate.
pub fn verify_chain_with_key(
    public_key: &RsaPublicKey,
    chain: &str,
    signature: &Signature,
) -> Result<(), SealFailure> {
    let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());
    verifying_key
        .verify(chain.as_bytes(), signature)
        .map_err(|_| SealFailure::SignatureMismatch)
}

fn decode_b64(text: &str) -> Result<Vec<u8>, String> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    BASE64.decode(compact.as_bytes()).map_err(|e| e.to_string())
}

/// SAT certificate serials are ASCII digits carried directly in the serial
/// integer bytes; fall back to hex for anything else.
fn serial_text(bytes: &[u8]) -> String {
    if !bytes.is_empty() && bytes.iter().all(|b| b.is_ascii_alphanumeric()) {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Seal verifier with an optional certificate-status collaborator.
pub struct SealVerifier {
    provider: Option<Arc<dyn CertificateStatusProvider>>,
    status_timeout: Duration,
}

impl SealVerifier {
    pub fn new(
        provider: Option<Arc<dyn CertificateStatusProvider>>,
        status_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            status_timeout,
        }
    }

    /// Verify a document's seal: local signature checks plus the
    /// (timeout-bounded) trust-chain lookup.
    pub async fn verify(&self, tree: &DocumentTree) -> SealVerification {
        let (original_chain, digest_hex, mut failure) = verify_offline(tree);

        let chain_status = self.chain_status(&tree.seal.certificate_serial).await;
        if chain_status == ChainStatus::Revoked && failure.is_none() {
            failure = Some(SealFailure::CertificateRevoked);
        }

        SealVerification {
            valid: failure.is_none(),
            digest_hex,
            original_chain,
            failure,
            chain_status,
        }
    }

    async fn chain_status(&self, serial: &str) -> ChainStatus {
        let Some(provider) = &self.provider else {
            return ChainStatus::Unverifiable;
        };
        match tokio::time::timeout(self.status_timeout, provider.check(serial)).await {
            Ok(Ok(CertificateStatus::Valid)) => ChainStatus::Trusted,
            Ok(Ok(CertificateStatus::Revoked)) => ChainStatus::Revoked,
            // `unknown` and collaborator failures are never treated as
            // revocation.
            Ok(Ok(CertificateStatus::Unknown)) | Ok(Err(_)) | Err(_) => {
                ChainStatus::Unverifiable
            }
        }
    }
}
