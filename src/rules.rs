//! CFDI Rule Engine
//!
//! An ordered set of independently-testable rules, each tagged with the
//! version(s) it applies to and a severity. Presence/type rules run first in
//! declaration order; consistency rules silently skip fields that already
//! failed extraction so a missing field is reported exactly once rather than
//! cascading into misleading secondary failures. Identical input always
//! yields an identical, order-stable report.

use std::sync::OnceLock;

use chrono::{Duration, NaiveDateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::document::{Amount, CfdiVersion, DocumentTree};

/// Rule severity: fatal violations block storage, warnings do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Fatal,
    Warning,
}

/// A single rule finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub rule: &'static str,
    pub severity: Severity,
    pub message: String,
}

/// Outcome of validating one document. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    violations: Vec<Violation>,
    warnings: Vec<Violation>,
}

impl ValidationReport {
    /// True when no fatal violation was found.
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Fatal violations, in rule-declaration order.
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    /// Non-fatal warnings, in rule-declaration order.
    pub fn warnings(&self) -> &[Violation] {
        &self.warnings
    }

    pub fn has_violation(&self, rule: &str) -> bool {
        self.violations.iter().any(|v| v.rule == rule)
    }
}

/// Evaluation context. `now` is injected so validation stays a pure
/// function of its inputs.
#[derive(Debug, Clone)]
pub struct RuleContext {
    pub now: NaiveDateTime,
    pub clock_skew: Duration,
}

impl Default for RuleContext {
    fn default() -> Self {
        RuleContext {
            now: Utc::now().naive_utc(),
            clock_skew: Duration::seconds(300),
        }
    }
}

type CheckFn = fn(&DocumentTree, &RuleContext) -> Vec<String>;

struct Rule {
    id: &'static str,
    severity: Severity,
    applies: &'static [CfdiVersion],
    check: CheckFn,
}

const ALL_VERSIONS: &[CfdiVersion] = &[CfdiVersion::V33, CfdiVersion::V40];
const V40_ONLY: &[CfdiVersion] = &[CfdiVersion::V40];
const V33_ONLY: &[CfdiVersion] = &[CfdiVersion::V33];

/// The rule set, in evaluation order: presence/type rules first, then
/// cross-field consistency, then version-specific sets, then warnings.
/// Adding a version means adding rules tagged with it, not editing the
/// existing ones.
const RULES: &[Rule] = &[
    // -- field presence and type --------------------------------------
    Rule {
        id: "subtotal-decimal",
        severity: Severity::Fatal,
        applies: ALL_VERSIONS,
        check: check_subtotal_decimal,
    },
    Rule {
        id: "total-decimal",
        severity: Severity::Fatal,
        applies: ALL_VERSIONS,
        check: check_total_decimal,
    },
    Rule {
        id: "issuer-rfc-format",
        severity: Severity::Fatal,
        applies: ALL_VERSIONS,
        check: check_issuer_rfc,
    },
    Rule {
        id: "receiver-rfc-format",
        severity: Severity::Fatal,
        applies: ALL_VERSIONS,
        check: check_receiver_rfc,
    },
    Rule {
        id: "issue-date-valid",
        severity: Severity::Fatal,
        applies: ALL_VERSIONS,
        check: check_issue_date,
    },
    Rule {
        id: "concept-fields",
        severity: Severity::Fatal,
        applies: ALL_VERSIONS,
        check: check_concept_fields,
    },
    // -- cross-field consistency --------------------------------------
    Rule {
        id: "concept-amount-consistency",
        severity: Severity::Fatal,
        applies: ALL_VERSIONS,
        check: check_concept_amounts,
    },
    Rule {
        id: "concept-tax-consistency",
        severity: Severity::Fatal,
        applies: ALL_VERSIONS,
        check: check_concept_taxes,
    },
    Rule {
        id: "subtotal-matches-concepts",
        severity: Severity::Fatal,
        applies: ALL_VERSIONS,
        check: check_subtotal_sum,
    },
    Rule {
        id: "total-consistency",
        severity: Severity::Fatal,
        applies: ALL_VERSIONS,
        check: check_total_consistency,
    },
    // -- version-specific ---------------------------------------------
    Rule {
        id: "33-receiver-cfdi-use",
        severity: Severity::Fatal,
        applies: V33_ONLY,
        check: check_33_receiver_use,
    },
    Rule {
        id: "40-receiver-tax-regime",
        severity: Severity::Fatal,
        applies: V40_ONLY,
        check: check_40_receiver_regime,
    },
    Rule {
        id: "40-receiver-domicile",
        severity: Severity::Fatal,
        applies: V40_ONLY,
        check: check_40_receiver_domicile,
    },
    Rule {
        id: "40-names-required",
        severity: Severity::Fatal,
        applies: V40_ONLY,
        check: check_40_names,
    },
    Rule {
        id: "40-export-code",
        severity: Severity::Fatal,
        applies: V40_ONLY,
        check: check_40_export,
    },
    // -- warnings ------------------------------------------------------
    Rule {
        id: "place-of-issue-missing",
        severity: Severity::Warning,
        applies: ALL_VERSIONS,
        check: check_place_of_issue,
    },
    Rule {
        id: "payment-method-missing",
        severity: Severity::Warning,
        applies: ALL_VERSIONS,
        check: check_payment_method,
    },
];

/// Validate a parsed document against the version-applicable rule set.
pub fn validate(tree: &DocumentTree, ctx: &RuleContext) -> ValidationReport {
    let mut violations = Vec::new();
    let mut warnings = Vec::new();

    for rule in RULES {
        if !rule.applies.contains(&tree.version) {
            continue;
        }
        for message in (rule.check)(tree, ctx) {
            let violation = Violation {
                rule: rule.id,
                severity: rule.severity,
                message,
            };
            match rule.severity {
                Severity::Fatal => violations.push(violation),
                Severity::Warning => warnings.push(violation),
            }
        }
    }

    ValidationReport {
        violations,
        warnings,
    }
}

/// RFC lexical pattern: 3 letters (moral person) or 4 (physical person),
/// a six-digit date, and a three-character homoclave.
fn rfc_regex() -> &'static Regex {
    static RFC_REGEX: OnceLock<Regex> = OnceLock::new();
    RFC_REGEX.get_or_init(|| {
        Regex::new(r"^[A-ZÑ&]{3,4}[0-9]{6}[A-Z0-9]{2}[0-9A]$").expect("RFC regex must compile")
    })
}

/// Fraction digits permitted for a currency (ISO 4217 minor units for the
/// currencies CFDI documents actually use; default 2).
fn currency_fraction_digits(currency: &str) -> u8 {
    match currency {
        "JPY" | "KRW" | "CLP" => 0,
        _ => 2,
    }
}

fn check_money(
    field: &crate::document::AmountField,
    name: &str,
    currency: &str,
    out: &mut Vec<String>,
) {
    match field.value() {
        None => {
            if field.raw.is_empty() {
                out.push(format!("{} is missing", name));
            } else {
                out.push(format!("{} is not a decimal amount: {:?}", name, field.raw));
            }
        }
        Some(amount) => {
            if amount.is_negative() {
                out.push(format!("{} is negative: {}", name, amount));
            }
            let allowed = currency_fraction_digits(currency);
            if amount.scale() > allowed {
                out.push(format!(
                    "{} has {} fraction digits; {} allows {}",
                    name,
                    amount.scale(),
                    currency,
                    allowed
                ));
            }
        }
    }
}

fn check_subtotal_decimal(tree: &DocumentTree, _ctx: &RuleContext) -> Vec<String> {
    let mut out = Vec::new();
    check_money(&tree.subtotal, "SubTotal", &tree.currency, &mut out);
    out
}

fn check_total_decimal(tree: &DocumentTree, _ctx: &RuleContext) -> Vec<String> {
    let mut out = Vec::new();
    check_money(&tree.total, "Total", &tree.currency, &mut out);
    if let Some(discount) = &tree.discount {
        check_money(discount, "Descuento", &tree.currency, &mut out);
    }
    out
}

fn check_issuer_rfc(tree: &DocumentTree, _ctx: &RuleContext) -> Vec<String> {
    if rfc_regex().is_match(&tree.issuer.rfc) {
        Vec::new()
    } else {
        vec![format!("issuer RFC {:?} is not well-formed", tree.issuer.rfc)]
    }
}

fn check_receiver_rfc(tree: &DocumentTree, _ctx: &RuleContext) -> Vec<String> {
    if rfc_regex().is_match(&tree.receiver.rfc) {
        Vec::new()
    } else {
        vec![format!(
            "receiver RFC {:?} is not well-formed",
            tree.receiver.rfc
        )]
    }
}

fn check_issue_date(tree: &DocumentTree, ctx: &RuleContext) -> Vec<String> {
    match tree.issue_date.value {
        None => vec![format!(
            "Fecha {:?} is not a valid date-time",
            tree.issue_date.raw
        )],
        Some(date) => {
            if date > ctx.now + ctx.clock_skew {
                vec![format!(
                    "Fecha {} is in the future (allowed skew {}s)",
                    date,
                    ctx.clock_skew.num_seconds()
                )]
            } else {
                Vec::new()
            }
        }
    }
}

fn check_concept_fields(tree: &DocumentTree, _ctx: &RuleContext) -> Vec<String> {
    let mut out = Vec::new();
    for (i, concept) in tree.concepts.iter().enumerate() {
        if concept.description.is_empty() {
            out.push(format!("concept {}: Descripcion is missing", i + 1));
        }
        check_money(
            &concept.quantity,
            &format!("concept {}: Cantidad", i + 1),
            &tree.currency,
            &mut out,
        );
        check_money(
            &concept.unit_value,
            &format!("concept {}: ValorUnitario", i + 1),
            &tree.currency,
            &mut out,
        );
        check_money(
            &concept.amount,
            &format!("concept {}: Importe", i + 1),
            &tree.currency,
            &mut out,
        );
    }
    // Quantities and unit values may carry up to six fraction digits; drop
    // the currency-digit findings for those two fields.
    out.retain(|m| {
        !(m.contains("Cantidad") || m.contains("ValorUnitario")) || !m.contains("fraction digits")
    });
    out
}

fn check_concept_amounts(tree: &DocumentTree, _ctx: &RuleContext) -> Vec<String> {
    let mut out = Vec::new();
    for (i, concept) in tree.concepts.iter().enumerate() {
        let (Some(quantity), Some(unit), Some(amount)) = (
            concept.quantity.value(),
            concept.unit_value.value(),
            concept.amount.value(),
        ) else {
            // Extraction failure already reported by concept-fields.
            continue;
        };
        let expected = quantity.mul_rate(unit);
        if !expected.within_tolerance(amount) {
            out.push(format!(
                "concept {}: Cantidad x ValorUnitario = {} but Importe = {}",
                i + 1,
                expected,
                amount
            ));
        }
    }
    out
}

fn check_concept_taxes(tree: &DocumentTree, _ctx: &RuleContext) -> Vec<String> {
    let mut out = Vec::new();
    for (i, concept) in tree.concepts.iter().enumerate() {
        let lines = concept
            .transferred_taxes
            .iter()
            .chain(concept.withheld_taxes.iter());
        for tax in lines {
            let (Some(base), Some(rate), Some(amount)) = (
                tax.base.value(),
                tax.rate.as_ref().and_then(|r| r.value()),
                tax.amount.as_ref().and_then(|a| a.value()),
            ) else {
                // Exempt lines carry no rate/amount; nothing to cross-check.
                continue;
            };
            let expected = base.mul_rate(rate);
            if !expected.within_tolerance(amount) {
                out.push(format!(
                    "concept {}: tax {} declares {} but Base x TasaOCuota = {}",
                    i + 1,
                    tax.tax_code,
                    amount,
                    expected
                ));
            }
        }
    }
    out
}

fn concept_amount_sum(tree: &DocumentTree) -> Option<Amount> {
    let mut sum = Amount::ZERO;
    for concept in &tree.concepts {
        sum = sum.add(concept.amount.value()?);
    }
    Some(sum)
}

fn check_subtotal_sum(tree: &DocumentTree, _ctx: &RuleContext) -> Vec<String> {
    let (Some(subtotal), Some(sum)) = (tree.subtotal.value(), concept_amount_sum(tree)) else {
        return Vec::new();
    };
    if subtotal.within_tolerance(&sum) {
        Vec::new()
    } else {
        vec![format!(
            "SubTotal {} does not match concept sum {}",
            subtotal, sum
        )]
    }
}

/// Sum of declared tax amounts across concepts; `None` when a non-exempt
/// line failed extraction (that failure is reported elsewhere).
fn tax_sum<'a, I>(lines: I) -> Option<Amount>
where
    I: Iterator<Item = &'a crate::document::ConceptTax>,
{
    let mut sum = Amount::ZERO;
    for tax in lines {
        match (&tax.rate, &tax.amount) {
            // Exempt line: contributes nothing.
            (None, None) => {}
            (_, Some(amount)) => sum = sum.add(amount.value()?),
            (Some(_), None) => return None,
        }
    }
    Some(sum)
}

fn check_total_consistency(tree: &DocumentTree, _ctx: &RuleContext) -> Vec<String> {
    let (Some(total), Some(subtotal)) = (tree.total.value(), tree.subtotal.value()) else {
        return Vec::new();
    };
    let discount = match &tree.discount {
        Some(field) => match field.value() {
            Some(amount) => *amount,
            None => return Vec::new(),
        },
        None => Amount::ZERO,
    };
    let Some(transferred) = tax_sum(
        tree.concepts
            .iter()
            .flat_map(|c| c.transferred_taxes.iter()),
    ) else {
        return Vec::new();
    };
    let Some(withheld) = tax_sum(tree.concepts.iter().flat_map(|c| c.withheld_taxes.iter()))
    else {
        return Vec::new();
    };

    let expected = subtotal.sub(&discount).add(&transferred).sub(&withheld);
    if total.within_tolerance(&expected) {
        Vec::new()
    } else {
        vec![format!(
            "Total {} does not match SubTotal - Descuento + traslados - retenciones = {}",
            total, expected
        )]
    }
}

fn check_33_receiver_use(tree: &DocumentTree, _ctx: &RuleContext) -> Vec<String> {
    if tree.receiver.cfdi_use.is_none() {
        vec!["Receptor@UsoCFDI is required in CFDI 3.3".to_string()]
    } else {
        Vec::new()
    }
}

fn check_40_receiver_regime(tree: &DocumentTree, _ctx: &RuleContext) -> Vec<String> {
    if tree.receiver.tax_regime.is_none() {
        vec!["Receptor@RegimenFiscalReceptor is required in CFDI 4.0".to_string()]
    } else {
        Vec::new()
    }
}

fn check_40_receiver_domicile(tree: &DocumentTree, _ctx: &RuleContext) -> Vec<String> {
    if tree.receiver.fiscal_domicile.is_none() {
        vec!["Receptor@DomicilioFiscalReceptor is required in CFDI 4.0".to_string()]
    } else {
        Vec::new()
    }
}

fn check_40_names(tree: &DocumentTree, _ctx: &RuleContext) -> Vec<String> {
    let mut out = Vec::new();
    if tree.issuer.name.is_none() {
        out.push("Emisor@Nombre is required in CFDI 4.0".to_string());
    }
    if tree.receiver.name.is_none() {
        out.push("Receptor@Nombre is required in CFDI 4.0".to_string());
    }
    out
}

fn check_40_export(tree: &DocumentTree, _ctx: &RuleContext) -> Vec<String> {
    if tree.export_code.is_none() {
        vec!["Comprobante@Exportacion is required in CFDI 4.0".to_string()]
    } else {
        Vec::new()
    }
}

fn check_place_of_issue(tree: &DocumentTree, _ctx: &RuleContext) -> Vec<String> {
    if tree.place_of_issue.is_none() {
        vec!["Comprobante@LugarExpedicion is missing".to_string()]
    } else {
        Vec::new()
    }
}

fn check_payment_method(tree: &DocumentTree, _ctx: &RuleContext) -> Vec<String> {
    if tree.document_type == "I" && tree.payment_method.is_none() {
        vec!["Comprobante@MetodoPago is missing on an income document".to_string()]
    } else {
        Vec::new()
    }
}
