//! CFDI XML Parser
//!
//! Event-driven parse of raw XML text into the typed [`DocumentTree`] model.
//! The parser knows how to *locate* CFDI elements and attributes; all
//! business semantics (amount consistency, RFC patterns, version-specific
//! field sets) live in the rule engine. Unknown elements, attributes and
//! namespaces are skipped so that future optional complements do not break
//! ingestion.

use std::collections::BTreeMap;

use quick_xml::Reader;
use quick_xml::events::Event;
use uuid::Uuid;

use crate::document::{
    AmountField, CancellationFolio, CancellationNotice, CfdiVersion, Concept, ConceptTax,
    DateField, DocumentTree, Issuer, Receiver, Relation, SealBlock, StampInfo,
};
use crate::error::ParseError;

/// Result of parsing one submitted document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// A stamped invoice.
    Comprobante(Box<DocumentTree>),
    /// A SAT cancellation notice acting on previously issued folios.
    Cancellation(CancellationNotice),
}

/// Parse raw XML text (UTF-8, BOM tolerated) into a [`Parsed`] document.
pub fn parse(raw: &str) -> Result<Parsed, ParseError> {
    let text = raw.strip_prefix('\u{feff}').unwrap_or(raw);
    let root = read_tree(text)?;

    match root.name.as_str() {
        "Comprobante" => parse_comprobante(&root).map(|t| Parsed::Comprobante(Box::new(t))),
        "Cancelacion" => parse_cancellation(&root).map(Parsed::Cancellation),
        other => Err(ParseError::Malformed {
            detail: format!("unexpected root element: {}", other),
        }),
    }
}

/// A namespace-stripped XML element. Attribute keys are local names; the
/// map is ordered so extraction is deterministic.
#[derive(Debug, Clone)]
struct XmlNode {
    name: String,
    attrs: BTreeMap<String, String>,
    children: Vec<XmlNode>,
}

impl XmlNode {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    fn attr_owned(&self, name: &str) -> Option<String> {
        self.attrs.get(name).cloned()
    }

    fn child(&self, local: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == local)
    }

    fn children_named<'a>(&'a self, local: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children.iter().filter(move |c| c.name == local)
    }
}

fn malformed(detail: impl ToString) -> ParseError {
    ParseError::Malformed {
        detail: detail.to_string(),
    }
}

fn missing(path: &str) -> ParseError {
    ParseError::MissingRequiredElement {
        path: path.to_string(),
    }
}

/// Build the element tree, dropping text content (CFDI is attribute-based)
/// and namespace prefixes.
fn read_tree(text: &str) -> Result<XmlNode, ParseError> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(start) => {
                let node = node_from_start(&start)?;
                stack.push(node);
            }
            Event::Empty(start) => {
                let node = node_from_start(&start)?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::End(_) => {
                let node = stack.pop().ok_or_else(|| malformed("unbalanced end tag"))?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::Eof => break,
            // Text, CDATA, comments, PIs and the XML declaration carry no
            // CFDI data.
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(malformed("unclosed element"));
    }
    root.ok_or_else(|| malformed("empty document"))
}

fn attach(
    stack: &mut [XmlNode],
    root: &mut Option<XmlNode>,
    node: XmlNode,
) -> Result<(), ParseError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            Ok(())
        }
        None => {
            if root.is_some() {
                return Err(malformed("multiple root elements"));
            }
            *root = Some(node);
            Ok(())
        }
    }
}

fn node_from_start(start: &quick_xml::events::BytesStart<'_>) -> Result<XmlNode, ParseError> {
    let name = local_name(start.name().as_ref());
    let mut attrs = BTreeMap::new();
    for attr in start.attributes() {
        let attr = attr.map_err(malformed)?;
        let key = local_name(attr.key.as_ref());
        let value = attr.unescape_value().map_err(malformed)?.into_owned();
        // First binding wins; duplicate local names across namespaces are
        // not meaningful in CFDI.
        attrs.entry(key).or_insert(value);
    }
    Ok(XmlNode {
        name,
        attrs,
        children: Vec::new(),
    })
}

fn local_name(qname: &[u8]) -> String {
    let local = match qname.iter().rposition(|&b| b == b':') {
        Some(pos) => &qname[pos + 1..],
        None => qname,
    };
    String::from_utf8_lossy(local).into_owned()
}

fn parse_comprobante(root: &XmlNode) -> Result<DocumentTree, ParseError> {
    let version_tag = root.attr("Version").or_else(|| root.attr("version"));
    let version = match version_tag {
        Some(tag) => CfdiVersion::from_tag(tag).ok_or(ParseError::UnsupportedVersion {
            tag: Some(tag.to_string()),
        })?,
        None => return Err(ParseError::UnsupportedVersion { tag: None }),
    };

    let issue_date = DateField::parse(
        root.attr("Fecha")
            .ok_or_else(|| missing("Comprobante@Fecha"))?,
    );
    let document_type = root
        .attr_owned("TipoDeComprobante")
        .ok_or_else(|| missing("Comprobante@TipoDeComprobante"))?;
    let currency = root
        .attr_owned("Moneda")
        .ok_or_else(|| missing("Comprobante@Moneda"))?;
    let subtotal = AmountField::parse(
        root.attr("SubTotal")
            .ok_or_else(|| missing("Comprobante@SubTotal"))?,
    );
    let total = AmountField::parse(
        root.attr("Total")
            .ok_or_else(|| missing("Comprobante@Total"))?,
    );
    let discount = root.attr("Descuento").map(AmountField::parse);

    let seal = SealBlock {
        seal_b64: root
            .attr_owned("Sello")
            .ok_or_else(|| missing("Comprobante@Sello"))?,
        certificate_serial: root
            .attr_owned("NoCertificado")
            .ok_or_else(|| missing("Comprobante@NoCertificado"))?,
        certificate_b64: root
            .attr_owned("Certificado")
            .ok_or_else(|| missing("Comprobante@Certificado"))?,
        algorithm: root.attr_owned("Algoritmo"),
    };

    let issuer_node = root
        .child("Emisor")
        .ok_or_else(|| missing("Comprobante/Emisor"))?;
    let issuer = Issuer {
        rfc: issuer_node
            .attr_owned("Rfc")
            .ok_or_else(|| missing("Comprobante/Emisor@Rfc"))?,
        name: issuer_node.attr_owned("Nombre"),
        tax_regime: issuer_node.attr_owned("RegimenFiscal"),
    };

    let receiver_node = root
        .child("Receptor")
        .ok_or_else(|| missing("Comprobante/Receptor"))?;
    let receiver = Receiver {
        rfc: receiver_node
            .attr_owned("Rfc")
            .ok_or_else(|| missing("Comprobante/Receptor@Rfc"))?,
        name: receiver_node.attr_owned("Nombre"),
        cfdi_use: receiver_node.attr_owned("UsoCFDI"),
        fiscal_domicile: receiver_node.attr_owned("DomicilioFiscalReceptor"),
        tax_regime: receiver_node.attr_owned("RegimenFiscalReceptor"),
    };

    let concepts_node = root
        .child("Conceptos")
        .ok_or_else(|| missing("Comprobante/Conceptos"))?;
    let concepts: Vec<Concept> = concepts_node
        .children_named("Concepto")
        .map(parse_concept)
        .collect();
    if concepts.is_empty() {
        return Err(missing("Comprobante/Conceptos/Concepto"));
    }

    let relations = root
        .children_named("CfdiRelacionados")
        .filter_map(parse_relation)
        .collect();

    let (stamp, complements) = parse_complemento(root)?;

    Ok(DocumentTree {
        version,
        stamp,
        issue_date,
        document_type,
        payment_method: root.attr_owned("MetodoPago"),
        currency,
        subtotal,
        discount,
        total,
        place_of_issue: root.attr_owned("LugarExpedicion"),
        export_code: root.attr_owned("Exportacion"),
        issuer,
        receiver,
        concepts,
        complements,
        relations,
        seal,
    })
}

fn parse_concept(node: &XmlNode) -> Concept {
    // Missing attributes surface as empty lexemes; the field-presence rules
    // report them, not the parser.
    let money = |name: &str| AmountField::parse(node.attr(name).unwrap_or(""));

    let mut transferred = Vec::new();
    let mut withheld = Vec::new();
    if let Some(taxes) = node.child("Impuestos") {
        if let Some(group) = taxes.child("Traslados") {
            transferred.extend(group.children_named("Traslado").map(parse_concept_tax));
        }
        if let Some(group) = taxes.child("Retenciones") {
            withheld.extend(group.children_named("Retencion").map(parse_concept_tax));
        }
    }

    Concept {
        description: node.attr("Descripcion").unwrap_or("").to_string(),
        quantity: money("Cantidad"),
        unit_value: money("ValorUnitario"),
        amount: money("Importe"),
        discount: node.attr("Descuento").map(AmountField::parse),
        transferred_taxes: transferred,
        withheld_taxes: withheld,
    }
}

fn parse_concept_tax(node: &XmlNode) -> ConceptTax {
    ConceptTax {
        tax_code: node.attr("Impuesto").unwrap_or("").to_string(),
        base: AmountField::parse(node.attr("Base").unwrap_or("")),
        rate: node.attr("TasaOCuota").map(AmountField::parse),
        amount: node.attr("Importe").map(AmountField::parse),
    }
}

fn parse_relation(node: &XmlNode) -> Option<Relation> {
    let relation_type = node.attr_owned("TipoRelacion")?;
    let related: Vec<Uuid> = node
        .children_named("CfdiRelacionado")
        .filter_map(|c| c.attr("UUID"))
        .filter_map(|u| Uuid::parse_str(u.trim()).ok())
        .collect();
    Some(Relation {
        relation_type,
        related,
    })
}

fn parse_complemento(root: &XmlNode) -> Result<(StampInfo, Vec<String>), ParseError> {
    let complemento = root
        .child("Complemento")
        .ok_or_else(|| missing("Comprobante/Complemento"))?;

    let mut stamp = None;
    let mut others = Vec::new();
    for child in &complemento.children {
        if child.name == "TimbreFiscalDigital" {
            let uuid_text = child
                .attr("UUID")
                .ok_or_else(|| missing("Comprobante/Complemento/TimbreFiscalDigital@UUID"))?;
            let uuid = Uuid::parse_str(uuid_text.trim())
                .map_err(|e| malformed(format!("invalid folio fiscal UUID: {}", e)))?;
            stamp = Some(StampInfo {
                uuid,
                stamped_at: child
                    .attr("FechaTimbrado")
                    .and_then(|f| DateField::parse(f).value),
                sat_certificate_serial: child.attr_owned("NoCertificadoSAT"),
            });
        } else {
            others.push(child.name.clone());
        }
    }

    let stamp =
        stamp.ok_or_else(|| missing("Comprobante/Complemento/TimbreFiscalDigital@UUID"))?;
    Ok((stamp, others))
}

fn parse_cancellation(root: &XmlNode) -> Result<CancellationNotice, ParseError> {
    let fecha = root
        .attr("Fecha")
        .ok_or_else(|| missing("Cancelacion@Fecha"))?;
    let effective_at = DateField::parse(fecha)
        .value
        .ok_or_else(|| malformed(format!("invalid cancellation date: {}", fecha)))?;

    let folios_node = root
        .child("Folios")
        .ok_or_else(|| missing("Cancelacion/Folios"))?;
    let mut folios = Vec::new();
    for folio in folios_node.children_named("Folio") {
        let uuid_text = folio
            .attr("UUID")
            .ok_or_else(|| missing("Cancelacion/Folios/Folio@UUID"))?;
        let uuid = Uuid::parse_str(uuid_text.trim())
            .map_err(|e| malformed(format!("invalid folio UUID: {}", e)))?;
        let substitution = folio
            .attr("FolioSustitucion")
            .filter(|s| !s.trim().is_empty())
            .and_then(|s| Uuid::parse_str(s.trim()).ok());
        folios.push(CancellationFolio { uuid, substitution });
    }
    if folios.is_empty() {
        return Err(missing("Cancelacion/Folios/Folio"));
    }

    Ok(CancellationNotice {
        issuer_rfc: root.attr_owned("RfcEmisor"),
        effective_at,
        folios,
    })
}
