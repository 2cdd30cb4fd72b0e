use chrono::NaiveDateTime;
use roxmltree::{Document, Node};

use crate::error::ParseError;
use crate::invoice::{Amount, DerivedAmounts, InvoicePayload, NaturalKey, ParsedInvoice};
use crate::parser::DocumentParser;
use crate::request::{Direction, SubjectId};

const SUPPORTED_VERSIONS: [&str; 2] = ["3.3", "4.0"];

/// Parser for CFDI 3.3 and 4.0 invoice documents.
///
/// Only the attributes the pipeline stores are read. Elements are matched
/// by local name, so both the 3.3 and 4.0 namespaces are accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct CfdiParser;

impl DocumentParser for CfdiParser {
    fn parse(&self, raw: &[u8], subject: &SubjectId) -> Result<ParsedInvoice, ParseError> {
        let xml = std::str::from_utf8(raw).map_err(|_| ParseError::Encoding)?;
        let xml = xml.strip_prefix('\u{feff}').unwrap_or(xml);
        parse_document(xml, subject)
    }
}

fn parse_document(xml: &str, subject: &SubjectId) -> Result<ParsedInvoice, ParseError> {
    let document = Document::parse(xml).map_err(|e| ParseError::Malformed(e.to_string()))?;

    let comprobante = document.root_element();
    if comprobante.tag_name().name() != "Comprobante" {
        return Err(ParseError::MissingElement("Comprobante".into()));
    }

    let version = comprobante
        .attribute("Version")
        .or_else(|| comprobante.attribute("version"))
        .unwrap_or_default();
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(ParseError::Unsupported(format!("CFDI version {version:?}")));
    }

    let issuer = require_child(comprobante, "Emisor")?;
    let receiver = require_child(comprobante, "Receptor")?;
    let stamp = comprobante
        .descendants()
        .find(|n| is_element(n, "TimbreFiscalDigital"))
        .ok_or_else(|| ParseError::MissingElement("TimbreFiscalDigital".into()))?;
    // Document-level totals only; concept-level taxes are nested deeper.
    let taxes = child(comprobante, "Impuestos");

    let issuer_rfc = require(issuer, "Rfc")?.trim().to_owned();
    let receiver_rfc = require(receiver, "Rfc")?.trim().to_owned();

    let direction = if subject.matches(&issuer_rfc) {
        Direction::Issued
    } else if subject.matches(&receiver_rfc) {
        Direction::Received
    } else {
        return Err(ParseError::SubjectMismatch(subject.to_string()));
    };

    let issued_raw = require(comprobante, "Fecha")?;
    let issued_at = NaiveDateTime::parse_from_str(issued_raw.trim(), "%Y-%m-%dT%H:%M:%S")
        .map_err(|_| ParseError::InvalidDate(issued_raw.to_owned()))?;

    let derived = match taxes {
        Some(node) => DerivedAmounts {
            transferred_taxes: optional_amount(node, "TotalImpuestosTrasladados")?,
            withheld_taxes: optional_amount(node, "TotalImpuestosRetenidos")?,
        },
        None => DerivedAmounts::default(),
    };

    Ok(ParsedInvoice {
        natural_key: NaturalKey::new(require(stamp, "UUID")?),
        subject_id: subject.clone(),
        direction,
        payload: InvoicePayload {
            issuer_rfc,
            issuer_name: issuer.attribute("Nombre").map(str::to_owned),
            receiver_rfc,
            receiver_name: receiver.attribute("Nombre").map(str::to_owned),
            issued_at,
            document_type: comprobante
                .attribute("TipoDeComprobante")
                .unwrap_or("I")
                .to_owned(),
            currency: comprobante.attribute("Moneda").unwrap_or("MXN").to_owned(),
            subtotal: required_amount(comprobante, "SubTotal")?,
            total: required_amount(comprobante, "Total")?,
        },
        derived,
        manually_modified: false,
    })
}

/// Local-name match, so `cfdi:Emisor` and `Emisor` are the same element.
fn is_element(node: &Node<'_, '_>, name: &str) -> bool {
    node.is_element() && node.tag_name().name() == name
}

fn child<'a, 'input>(parent: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    parent.children().find(|n| is_element(n, name))
}

fn require_child<'a, 'input>(
    parent: Node<'a, 'input>,
    name: &str,
) -> Result<Node<'a, 'input>, ParseError> {
    child(parent, name).ok_or_else(|| ParseError::MissingElement(name.to_owned()))
}

fn require<'a>(node: Node<'a, '_>, attribute: &str) -> Result<&'a str, ParseError> {
    node.attribute(attribute)
        .ok_or_else(|| ParseError::MissingAttribute {
            element: node.tag_name().name().to_owned(),
            attribute: attribute.to_owned(),
        })
}

fn required_amount(node: Node<'_, '_>, attribute: &str) -> Result<Amount, ParseError> {
    let raw = require(node, attribute)?;
    Amount::parse(raw).ok_or_else(|| ParseError::InvalidAmount {
        field: attribute.to_owned(),
        value: raw.to_owned(),
    })
}

fn optional_amount(node: Node<'_, '_>, attribute: &str) -> Result<Amount, ParseError> {
    match node.attribute(attribute) {
        Some(_) => required_amount(node, attribute),
        None => Ok(Amount::ZERO),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{cfdi_document, CfdiFixture};

    fn subject() -> SubjectId {
        SubjectId::new("AAA010101AAA")
    }

    #[test]
    fn parses_issued_invoice() {
        let xml = cfdi_document(&CfdiFixture::issued("ad662d33-6934-459c-a128-bdf0393e0f44"));
        let invoice = CfdiParser.parse(xml.as_bytes(), &subject()).unwrap();

        assert_eq!(invoice.natural_key.as_str(), "AD662D33-6934-459C-A128-BDF0393E0F44");
        assert_eq!(invoice.direction, Direction::Issued);
        assert_eq!(invoice.payload.issuer_rfc, "AAA010101AAA");
        assert_eq!(invoice.payload.receiver_rfc, "XEXX010101000");
        assert_eq!(invoice.payload.issuer_name.as_deref(), Some("Acme & Hijos"));
        assert_eq!(invoice.payload.total, Amount::from_cents(116_000));
        assert_eq!(invoice.payload.subtotal, Amount::from_cents(100_000));
        assert_eq!(invoice.derived.transferred_taxes, Amount::from_cents(16_000));
        assert_eq!(invoice.derived.withheld_taxes, Amount::ZERO);
        assert!(!invoice.manually_modified);
    }

    #[test]
    fn received_direction_follows_receiver_rfc() {
        let mut fixture = CfdiFixture::issued("B0B0");
        std::mem::swap(&mut fixture.issuer_rfc, &mut fixture.receiver_rfc);
        let xml = cfdi_document(&fixture);

        let invoice = CfdiParser.parse(xml.as_bytes(), &subject()).unwrap();
        assert_eq!(invoice.direction, Direction::Received);
    }

    #[test]
    fn concept_level_taxes_are_ignored() {
        let xml = cfdi_document(&CfdiFixture::issued("C0C0"));
        assert!(xml.contains("<cfdi:Impuestos>"));
        let invoice = CfdiParser.parse(xml.as_bytes(), &subject()).unwrap();
        assert_eq!(invoice.derived.transferred_taxes, Amount::from_cents(16_000));
    }

    #[test]
    fn foreign_documents_are_rejected() {
        let xml = cfdi_document(&CfdiFixture::issued("D0D0"));
        let result = CfdiParser.parse(xml.as_bytes(), &SubjectId::new("ZZZ010101ZZZ"));
        assert!(matches!(result, Err(ParseError::SubjectMismatch(_))));
    }

    #[test]
    fn missing_stamp_is_an_error() {
        let xml = cfdi_document(&CfdiFixture::issued("E0E0")).replace("TimbreFiscalDigital", "Other");
        let result = CfdiParser.parse(xml.as_bytes(), &subject());
        assert_eq!(
            result,
            Err(ParseError::MissingElement("TimbreFiscalDigital".into()))
        );
    }

    #[test]
    fn malformed_total_is_an_error() {
        let mut fixture = CfdiFixture::issued("F0F0");
        fixture.total = "12x".into();
        let result = CfdiParser.parse(cfdi_document(&fixture).as_bytes(), &subject());
        assert!(matches!(result, Err(ParseError::InvalidAmount { .. })));
    }

    #[test]
    fn old_versions_are_unsupported() {
        let xml = cfdi_document(&CfdiFixture::issued("A1A1")).replace("Version=\"4.0\"", "Version=\"3.2\"");
        let result = CfdiParser.parse(xml.as_bytes(), &subject());
        assert!(matches!(result, Err(ParseError::Unsupported(_))));
    }

    #[test]
    fn non_utf8_is_an_encoding_error() {
        let result = CfdiParser.parse(&[0xff, 0xfe, 0x00], &subject());
        assert_eq!(result, Err(ParseError::Encoding));
    }

    #[test]
    fn character_references_are_decoded() {
        let mut fixture = CfdiFixture::issued("A2A2");
        fixture.issuer_rfc = "&#209;AA010101AAA".into();
        fixture.issuer_name = "Acme &#x26; Hijos".into();
        let xml = cfdi_document(&fixture);

        let invoice = CfdiParser
            .parse(xml.as_bytes(), &SubjectId::new("ÑAA010101AAA"))
            .unwrap();
        assert_eq!(invoice.direction, Direction::Issued);
        assert_eq!(invoice.payload.issuer_rfc, "ÑAA010101AAA");
        assert_eq!(invoice.payload.issuer_name.as_deref(), Some("Acme & Hijos"));
    }

    #[test]
    fn comments_and_cdata_do_not_leak_elements() {
        let xml = cfdi_document(&CfdiFixture::issued("A3A3"))
            .replace(
                "  <cfdi:Emisor",
                "  <!-- <cfdi:Emisor Rfc=\"ZZZ010101ZZZ\"/> a > b -->\n  <cfdi:Emisor",
            )
            .replace(
                "  <cfdi:Complemento>",
                "  <cfdi:Addenda><![CDATA[<cfdi:Emisor Rfc=\"ZZZ010101ZZZ\"/>]]></cfdi:Addenda>\n  <cfdi:Complemento>",
            );

        let invoice = CfdiParser.parse(xml.as_bytes(), &subject()).unwrap();
        assert_eq!(invoice.payload.issuer_rfc, "AAA010101AAA");
        assert_eq!(invoice.direction, Direction::Issued);
    }

    #[test]
    fn truncated_document_is_malformed() {
        let result = CfdiParser.parse(b"<cfdi:Comprobante", &subject());
        assert!(matches!(result, Err(ParseError::Malformed(_))));
    }

    #[test]
    fn other_root_elements_are_rejected() {
        let result = CfdiParser.parse(b"<Retenciones Version=\"2.0\"/>", &subject());
        assert_eq!(result, Err(ParseError::MissingElement("Comprobante".into())));
    }
}
