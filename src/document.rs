//! CFDI Document Model
//!
//! Typed representation of a parsed CFDI ("Comprobante Fiscal Digital por
//! Internet") plus the fixed-point amount arithmetic used by the rule engine.
//! All monetary math is integer-based; no floating point is used anywhere on
//! the validation path.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported CFDI versions.
///
/// Unsupported version tags fail at parse time and never reach the rule
/// engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CfdiVersion {
    /// CFDI 3.3 (Anexo 20 revision C)
    V33,
    /// CFDI 4.0 (current)
    V40,
}

impl CfdiVersion {
    /// Parse a `Version` attribute value.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim() {
            "3.3" => Some(CfdiVersion::V33),
            "4.0" => Some(CfdiVersion::V40),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CfdiVersion::V33 => "3.3",
            CfdiVersion::V40 => "4.0",
        }
    }
}

impl fmt::Display for CfdiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-point monetary amount: an integer count of millionths of a
/// currency unit. CFDI allows at most six fraction digits, so every lexically
/// valid amount is representable exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Amount {
    micros: i64,
    scale: u8,
}

/// Millionths per whole currency unit.
const MICROS_PER_UNIT: i64 = 1_000_000;

/// Totals-consistency tolerance: 0.01 currency units.
pub const TOLERANCE_MICROS: i64 = MICROS_PER_UNIT / 100;

impl Amount {
    /// Maximum fraction digits a CFDI amount may carry.
    pub const MAX_SCALE: u8 = 6;

    pub const ZERO: Amount = Amount { micros: 0, scale: 0 };

    /// Parse a decimal string such as `"1234.50"`. Returns `None` for
    /// anything that is not a plain decimal number or that carries more
    /// than [`Amount::MAX_SCALE`] fraction digits.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (negative, digits) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        if digits.is_empty() {
            return None;
        }

        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return None;
        }
        if frac_part.len() > Self::MAX_SCALE as usize {
            return None;
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }

        let whole: i64 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().ok()?
        };
        let mut frac: i64 = if frac_part.is_empty() {
            0
        } else {
            frac_part.parse().ok()?
        };
        for _ in frac_part.len()..Self::MAX_SCALE as usize {
            frac *= 10;
        }

        let micros = whole.checked_mul(MICROS_PER_UNIT)?.checked_add(frac)?;
        let micros = if negative { -micros } else { micros };
        Some(Amount {
            micros,
            scale: frac_part.len() as u8,
        })
    }

    /// Build an amount from a count of centavos (hundredths). Scale is 2.
    pub fn from_centavos(centavos: i64) -> Self {
        Amount {
            micros: centavos * (MICROS_PER_UNIT / 100),
            scale: 2,
        }
    }

    pub fn micros(&self) -> i64 {
        self.micros
    }

    /// Fraction digits present in the source text.
    pub fn scale(&self) -> u8 {
        self.scale
    }

    pub fn is_negative(&self) -> bool {
        self.micros < 0
    }

    /// Saturating sum, keeping the wider scale.
    pub fn add(&self, other: &Amount) -> Amount {
        Amount {
            micros: self.micros.saturating_add(other.micros),
            scale: self.scale.max(other.scale),
        }
    }

    pub fn sub(&self, other: &Amount) -> Amount {
        Amount {
            micros: self.micros.saturating_sub(other.micros),
            scale: self.scale.max(other.scale),
        }
    }

    /// Multiply by a fractional rate (e.g. a 0.160000 tax rate), rounding
    /// half away from zero at the sixth fraction digit.
    pub fn mul_rate(&self, rate: &Amount) -> Amount {
        let product = self.micros as i128 * rate.micros as i128;
        let half = (MICROS_PER_UNIT as i128) / 2;
        let rounded = if product >= 0 {
            (product + half) / MICROS_PER_UNIT as i128
        } else {
            (product - half) / MICROS_PER_UNIT as i128
        };
        Amount {
            micros: rounded as i64,
            scale: Self::MAX_SCALE,
        }
    }

    /// Absolute difference in millionths.
    pub fn abs_diff_micros(&self, other: &Amount) -> i64 {
        (self.micros - other.micros).abs()
    }

    /// True when the two amounts agree within the totals tolerance.
    pub fn within_tolerance(&self, other: &Amount) -> bool {
        self.abs_diff_micros(other) <= TOLERANCE_MICROS
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.scale.max(2) as usize;
        let negative = self.micros < 0;
        let abs = self.micros.unsigned_abs();
        let whole = abs / MICROS_PER_UNIT as u64;
        let frac = abs % MICROS_PER_UNIT as u64;
        let frac_str = format!("{:06}", frac);
        write!(
            f,
            "{}{}.{}",
            if negative { "-" } else { "" },
            whole,
            &frac_str[..digits]
        )
    }
}

/// A monetary attribute as it appeared in the XML: the raw text plus the
/// parsed value when the text was a lexically valid decimal. Consistency
/// rules skip fields whose value is `None`; the field-type rule reports the
/// bad lexeme exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountField {
    pub raw: String,
    pub value: Option<Amount>,
}

impl AmountField {
    pub fn parse(raw: &str) -> Self {
        AmountField {
            raw: raw.to_string(),
            value: Amount::parse(raw),
        }
    }

    pub fn value(&self) -> Option<&Amount> {
        self.value.as_ref()
    }
}

/// A date-time attribute (`AAAA-MM-DDThh:mm:ss`, no offset) with its raw
/// lexeme preserved for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateField {
    pub raw: String,
    pub value: Option<NaiveDateTime>,
}

impl DateField {
    pub fn parse(raw: &str) -> Self {
        DateField {
            raw: raw.to_string(),
            value: NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%dT%H:%M:%S").ok(),
        }
    }
}

/// Calendar period (year, month) used as a secondary index key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Self {
        Period { year, month }
    }

    pub fn from_date(date: &NaiveDateTime) -> Self {
        use chrono::Datelike;
        Period {
            year: date.year(),
            month: date.month(),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Issuer data (`Emisor` node).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issuer {
    pub rfc: String,
    pub name: Option<String>,
    pub tax_regime: Option<String>,
}

/// Receiver data (`Receptor` node). The 4.0-only attributes are optional
/// here; their presence is enforced by the version-specific rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receiver {
    pub rfc: String,
    pub name: Option<String>,
    pub cfdi_use: Option<String>,
    pub fiscal_domicile: Option<String>,
    pub tax_regime: Option<String>,
}

/// A per-concept tax line (`Traslado` or `Retencion`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptTax {
    /// Tax code: 001 = ISR, 002 = IVA, 003 = IEPS.
    pub tax_code: String,
    pub base: AmountField,
    pub rate: Option<AmountField>,
    pub amount: Option<AmountField>,
}

/// One invoice line item (`Concepto` node).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concept {
    pub description: String,
    pub quantity: AmountField,
    pub unit_value: AmountField,
    pub amount: AmountField,
    pub discount: Option<AmountField>,
    pub transferred_taxes: Vec<ConceptTax>,
    pub withheld_taxes: Vec<ConceptTax>,
}

/// A `CfdiRelacionados` group: relation type plus the related folios.
/// Relation type `"04"` (substitution) drives the `Replaced` lifecycle
/// transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub relation_type: String,
    pub related: Vec<Uuid>,
}

/// Substitution relation code from the SAT `c_TipoRelacion` catalog.
pub const RELATION_SUBSTITUTION: &str = "04";

/// The issuer's seal block: base64 seal and certificate plus the declared
/// certificate serial and (optional) signing-algorithm identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealBlock {
    pub seal_b64: String,
    pub certificate_b64: String,
    pub certificate_serial: String,
    pub algorithm: Option<String>,
}

/// Stamping data extracted from the `TimbreFiscalDigital` complement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StampInfo {
    /// The folio fiscal: the document's globally unique identifier.
    pub uuid: Uuid,
    pub stamped_at: Option<NaiveDateTime>,
    pub sat_certificate_serial: Option<String>,
}

/// Parsed representation of one CFDI document.
///
/// Field extraction is purely structural: amounts and dates keep their raw
/// lexemes so the rule engine can report type violations without re-reading
/// the XML. Unknown elements and attributes encountered during parsing are
/// dropped, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentTree {
    pub version: CfdiVersion,
    pub stamp: StampInfo,
    pub issue_date: DateField,
    /// `TipoDeComprobante`: I, E, T, N or P.
    pub document_type: String,
    pub payment_method: Option<String>,
    pub currency: String,
    pub subtotal: AmountField,
    pub discount: Option<AmountField>,
    pub total: AmountField,
    pub place_of_issue: Option<String>,
    /// `Exportacion` (4.0 only).
    pub export_code: Option<String>,
    pub issuer: Issuer,
    pub receiver: Receiver,
    pub concepts: Vec<Concept>,
    /// Local names of complement children other than the fiscal stamp.
    pub complements: Vec<String>,
    pub relations: Vec<Relation>,
    pub seal: SealBlock,
}

impl DocumentTree {
    /// The folio fiscal.
    pub fn uuid(&self) -> Uuid {
        self.stamp.uuid
    }

    /// Period derived from the issue date, when the date parsed.
    pub fn period(&self) -> Option<Period> {
        self.issue_date.value.as_ref().map(Period::from_date)
    }

    /// Related folios declared with the substitution relation type.
    pub fn substituted_folios(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.relations
            .iter()
            .filter(|r| r.relation_type == RELATION_SUBSTITUTION)
            .flat_map(|r| r.related.iter().copied())
    }
}

/// One folio targeted by a cancellation notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationFolio {
    pub uuid: Uuid,
    /// Folio of the document that substitutes the canceled one, when the
    /// cancellation reason requires it.
    pub substitution: Option<Uuid>,
}

/// A parsed SAT cancellation notice (`Cancelacion` root).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationNotice {
    pub issuer_rfc: Option<String>,
    pub effective_at: NaiveDateTime,
    pub folios: Vec<CancellationFolio>,
}
