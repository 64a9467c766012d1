//! Shared fixtures: a test RSA issuer identity (key + self-signed
//! certificate) and builders for correctly sealed CFDI documents and
//! cancellation notices.

#![allow(dead_code)]

use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rsa::RsaPrivateKey;
use rsa::pkcs1v15::{Signature, SigningKey};
use rsa::pkcs8::EncodePublicKey;
use rsa::signature::{SignatureEncoding, Signer};
use sha2::Sha256;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::asn1::UtcTime;
use x509_cert::der::{Decode, Encode};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::{Time, Validity};

use cfdi_engine::parser::{Parsed, parse};
use cfdi_engine::seal::original_chain;

/// Certificate serial embedded in the test certificate and declared by
/// every fixture document.
pub const TEST_SERIAL: &str = "30001000000400002434";

pub const ISSUER_RFC: &str = "EKU9003173C9";
pub const RECEIVER_RFC: &str = "XAXX010101000";

const SELLO_PLACEHOLDER: &str = "__SELLO__";

/// 2020-01-01T00:00:00Z .. 2030-01-01T00:00:00Z
const NOT_BEFORE_UNIX: u64 = 1_577_836_800;
const NOT_AFTER_UNIX: u64 = 1_893_456_000;

pub struct TestIdentity {
    pub signing_key: SigningKey<Sha256>,
    pub certificate_b64: String,
}

/// Lazily generated issuer identity, shared across the whole test binary:
/// RSA key generation is expensive.
pub fn identity() -> &'static TestIdentity {
    static IDENTITY: OnceLock<TestIdentity> = OnceLock::new();
    IDENTITY.get_or_init(|| {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("test key generation");
        let signing_key = SigningKey::<Sha256>::new(private_key.clone());

        let serial = SerialNumber::new(TEST_SERIAL.as_bytes()).expect("serial");
        let validity = Validity {
            not_before: Time::UtcTime(
                UtcTime::from_unix_duration(Duration::from_secs(NOT_BEFORE_UNIX)).expect("time"),
            ),
            not_after: Time::UtcTime(
                UtcTime::from_unix_duration(Duration::from_secs(NOT_AFTER_UNIX)).expect("time"),
            ),
        };
        let subject =
            Name::from_str("CN=ESCUELA KEMPER URGATE,O=EKU9003173C9").expect("subject name");
        let spki_der = private_key
            .to_public_key()
            .to_public_key_der()
            .expect("spki der");
        let spki = SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes()).expect("spki");

        let builder = CertificateBuilder::new(
            Profile::Root,
            serial,
            validity,
            subject,
            spki,
            &signing_key,
        )
        .expect("certificate builder");
        let certificate = builder.build::<Signature>().expect("certificate build");
        let certificate_b64 = BASE64.encode(certificate.to_der().expect("certificate der"));

        TestIdentity {
            signing_key,
            certificate_b64,
        }
    })
}

/// Builder for a correctly sealed single-concept CFDI 4.0 fixture with no
/// taxes (SubTotal == Total == concept Importe).
pub struct InvoiceBuilder {
    uuid: String,
    total: String,
    fecha: String,
    issuer_rfc: String,
    certificate_serial: String,
    document_type: String,
    substitutes: Option<String>,
}

impl InvoiceBuilder {
    pub fn new(uuid: &str, total: &str) -> Self {
        Self {
            uuid: uuid.to_string(),
            total: total.to_string(),
            fecha: "2024-03-15T10:30:00".to_string(),
            issuer_rfc: ISSUER_RFC.to_string(),
            certificate_serial: TEST_SERIAL.to_string(),
            document_type: "I".to_string(),
            substitutes: None,
        }
    }

    pub fn fecha(mut self, fecha: &str) -> Self {
        self.fecha = fecha.to_string();
        self
    }

    pub fn issuer_rfc(mut self, rfc: &str) -> Self {
        self.issuer_rfc = rfc.to_string();
        self
    }

    pub fn certificate_serial(mut self, serial: &str) -> Self {
        self.certificate_serial = serial.to_string();
        self
    }

    pub fn document_type(mut self, document_type: &str) -> Self {
        self.document_type = document_type.to_string();
        self
    }

    /// Declare this document as the substitution of another folio
    /// (TipoRelacion 04).
    pub fn substitutes(mut self, folio: &str) -> Self {
        self.substitutes = Some(folio.to_string());
        self
    }

    fn render(&self, sello: &str) -> String {
        let relation = match &self.substitutes {
            Some(folio) => format!(
                r#"  <cfdi:CfdiRelacionados TipoRelacion="04">
    <cfdi:CfdiRelacionado UUID="{folio}"/>
  </cfdi:CfdiRelacionados>
"#
            ),
            None => String::new(),
        };
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<cfdi:Comprobante xmlns:cfdi="http://www.sat.gob.mx/cfd/4" Version="4.0"
    Fecha="{fecha}" Moneda="MXN" SubTotal="{total}" Total="{total}"
    TipoDeComprobante="{document_type}" MetodoPago="PUE" LugarExpedicion="64000"
    Exportacion="01" Sello="{sello}" NoCertificado="{serial}"
    Certificado="{certificate}">
{relation}  <cfdi:Emisor Rfc="{issuer}" Nombre="ESCUELA KEMPER URGATE" RegimenFiscal="601"/>
  <cfdi:Receptor Rfc="{receiver}" Nombre="PUBLICO EN GENERAL" UsoCFDI="G03"
      DomicilioFiscalReceptor="64000" RegimenFiscalReceptor="616"/>
  <cfdi:Conceptos>
    <cfdi:Concepto ClaveProdServ="01010101" Cantidad="1.00" Descripcion="Servicio general"
        ValorUnitario="{total}" Importe="{total}"/>
  </cfdi:Conceptos>
  <cfdi:Complemento>
    <tfd:TimbreFiscalDigital xmlns:tfd="http://www.sat.gob.mx/TimbreFiscalDigital"
        Version="1.1" UUID="{uuid}" FechaTimbrado="{fecha}"
        NoCertificadoSAT="30001000000400002495"/>
  </cfdi:Complemento>
</cfdi:Comprobante>"#,
            fecha = self.fecha,
            total = self.total,
            document_type = self.document_type,
            sello = sello,
            serial = self.certificate_serial,
            certificate = identity().certificate_b64,
            relation = relation,
            issuer = self.issuer_rfc,
            receiver = RECEIVER_RFC,
            uuid = self.uuid,
        )
    }

    /// Render the document, then seal it: parse the placeholder version,
    /// rebuild the original chain, sign it, and splice the signature in.
    /// The seal attribute is not part of the chain, so the result verifies.
    pub fn build(&self) -> String {
        let unsealed = self.render(SELLO_PLACEHOLDER);
        let tree = match parse(&unsealed).expect("fixture must parse") {
            Parsed::Comprobante(tree) => tree,
            other => panic!("fixture parsed as {:?}", other),
        };
        let chain = original_chain(&tree);
        let signature = identity().signing_key.sign(chain.as_bytes());
        let sello = BASE64.encode(signature.to_bytes());
        unsealed.replace(SELLO_PLACEHOLDER, &sello)
    }
}

/// Shorthand for the common case.
pub fn signed_invoice(uuid: &str, total: &str) -> String {
    InvoiceBuilder::new(uuid, total).build()
}

/// A SAT cancellation notice targeting the given folios.
pub fn cancellation_notice(folios: &[&str], fecha: &str) -> String {
    let folio_lines: String = folios
        .iter()
        .map(|uuid| format!("    <Folio UUID=\"{}\" Motivo=\"02\"/>\n", uuid))
        .collect();
    format!(
        r#"<Cancelacion Fecha="{fecha}" RfcEmisor="{issuer}">
  <Folios>
{folio_lines}  </Folios>
</Cancelacion>"#,
        fecha = fecha,
        issuer = ISSUER_RFC,
        folio_lines = folio_lines,
    )
}

pub const U1: &str = "11111111-1111-1111-1111-111111111111";
pub const U2: &str = "22222222-2222-2222-2222-222222222222";
pub const U3: &str = "33333333-3333-3333-3333-333333333333";
