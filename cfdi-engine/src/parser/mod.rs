//! CFDI document parser.
//!
//! Pure function from raw XML bytes to a structured record. Accepts both
//! the 3.3 and 4.0 schema generations; required fields missing or
//! unparsable yield a `MalformedDocument` error, optional fields are
//! tolerated.

use chrono::NaiveDateTime;
use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use rust_decimal::Decimal;
use std::str::FromStr;
use sync_core::SyncError;
use uuid::Uuid;

use crate::models::TypeCode;

/// Structured fields extracted from one CFDI document.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedInvoice {
    /// Fiscal folio from the TimbreFiscalDigital complement.
    pub cfdi_uuid: Uuid,
    pub version: Option<String>,
    pub type_code: TypeCode,
    pub issue_date: NaiveDateTime,
    pub subtotal: Decimal,
    pub total: Decimal,
    pub issuer_rfc: String,
    pub issuer_name: Option<String>,
    pub receiver_rfc: String,
    pub receiver_name: Option<String>,
    pub payment_method: Option<String>,
    pub payment_form: Option<String>,
    pub currency: Option<String>,
    /// Description of the first concept.
    pub description: Option<String>,
}

#[derive(Default)]
struct RawFields {
    version: Option<String>,
    fecha: Option<String>,
    tipo: Option<String>,
    subtotal: Option<String>,
    total: Option<String>,
    metodo_pago: Option<String>,
    forma_pago: Option<String>,
    moneda: Option<String>,
    issuer_rfc: Option<String>,
    issuer_name: Option<String>,
    receiver_rfc: Option<String>,
    receiver_name: Option<String>,
    description: Option<String>,
    uuid: Option<String>,
}

/// Parse a raw CFDI document into its structured fields.
pub fn parse_cfdi(bytes: &[u8]) -> Result<ParsedInvoice, SyncError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut raw = RawFields::default();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                match e.local_name().as_ref() {
                    b"Comprobante" => read_comprobante(&e, &mut raw)?,
                    b"Emisor" => {
                        raw.issuer_rfc = attr(&e, b"Rfc")?.or(attr(&e, b"rfc")?);
                        raw.issuer_name = attr(&e, b"Nombre")?.or(attr(&e, b"nombre")?);
                    }
                    b"Receptor" => {
                        raw.receiver_rfc = attr(&e, b"Rfc")?.or(attr(&e, b"rfc")?);
                        raw.receiver_name = attr(&e, b"Nombre")?.or(attr(&e, b"nombre")?);
                    }
                    b"Concepto" => {
                        // Only the first concept's description is kept.
                        if raw.description.is_none() {
                            raw.description = attr(&e, b"Descripcion")?;
                        }
                    }
                    b"TimbreFiscalDigital" => {
                        raw.uuid = attr(&e, b"UUID")?;
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(SyncError::MalformedDocument(anyhow::anyhow!(
                    "XML error at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        }
        buf.clear();
    }

    build(raw)
}

fn read_comprobante(e: &BytesStart<'_>, raw: &mut RawFields) -> Result<(), SyncError> {
    raw.version = attr(e, b"Version")?.or(attr(e, b"version")?);
    raw.fecha = attr(e, b"Fecha")?.or(attr(e, b"fecha")?);
    raw.tipo = attr(e, b"TipoDeComprobante")?.or(attr(e, b"tipoDeComprobante")?);
    raw.subtotal = attr(e, b"SubTotal")?.or(attr(e, b"subTotal")?);
    raw.total = attr(e, b"Total")?.or(attr(e, b"total")?);
    raw.metodo_pago = attr(e, b"MetodoPago")?.or(attr(e, b"metodoPago")?);
    raw.forma_pago = attr(e, b"FormaPago")?.or(attr(e, b"formaPago")?);
    raw.moneda = attr(e, b"Moneda")?.or(attr(e, b"moneda")?);
    Ok(())
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>, SyncError> {
    for a in e.attributes().with_checks(false) {
        let a: Attribute<'_> = a.map_err(|err| {
            SyncError::MalformedDocument(anyhow::anyhow!("bad attribute: {}", err))
        })?;
        if a.key.local_name().as_ref() == name {
            let value = a.unescape_value().map_err(|err| {
                SyncError::MalformedDocument(anyhow::anyhow!("bad attribute value: {}", err))
            })?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn build(raw: RawFields) -> Result<ParsedInvoice, SyncError> {
    let uuid_str = raw
        .uuid
        .ok_or_else(|| SyncError::malformed("missing fiscal folio (TimbreFiscalDigital UUID)"))?;
    let cfdi_uuid = Uuid::parse_str(uuid_str.trim())
        .map_err(|e| SyncError::MalformedDocument(anyhow::anyhow!("invalid UUID: {}", e)))?;

    let tipo = raw
        .tipo
        .ok_or_else(|| SyncError::malformed("missing TipoDeComprobante"))?;
    let type_code = TypeCode::from_code(tipo.trim()).ok_or_else(|| {
        SyncError::MalformedDocument(anyhow::anyhow!("unsupported voucher type '{}'", tipo))
    })?;

    let fecha = raw.fecha.ok_or_else(|| SyncError::malformed("missing Fecha"))?;
    let issue_date = parse_date(&fecha)?;

    let total = raw.total.ok_or_else(|| SyncError::malformed("missing Total"))?;
    let total = parse_amount("Total", &total)?;
    let subtotal = match raw.subtotal {
        Some(s) => parse_amount("SubTotal", &s)?,
        None => Decimal::ZERO,
    };

    let issuer_rfc = raw
        .issuer_rfc
        .ok_or_else(|| SyncError::malformed("missing issuer RFC"))?;
    let receiver_rfc = raw
        .receiver_rfc
        .ok_or_else(|| SyncError::malformed("missing receiver RFC"))?;

    Ok(ParsedInvoice {
        cfdi_uuid,
        version: raw.version,
        type_code,
        issue_date,
        subtotal,
        total,
        issuer_rfc: issuer_rfc.trim().to_uppercase(),
        issuer_name: raw.issuer_name,
        receiver_rfc: receiver_rfc.trim().to_uppercase(),
        receiver_name: raw.receiver_name,
        payment_method: raw.metodo_pago,
        payment_form: raw.forma_pago,
        currency: raw.moneda,
        description: raw.description,
    })
}

fn parse_amount(field: &str, value: &str) -> Result<Decimal, SyncError> {
    Decimal::from_str(value.trim()).map_err(|e| {
        SyncError::MalformedDocument(anyhow::anyhow!("invalid {}: '{}' ({})", field, value, e))
    })
}

/// Issue dates arrive as ISO datetimes; a bare date is tolerated and read
/// as midnight.
fn parse_date(value: &str) -> Result<NaiveDateTime, SyncError> {
    let v = value.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(v, "%Y-%m-%dT%H:%M:%S") {
        return Ok(dt);
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(v, "%Y-%m-%d") {
        return Ok(d.and_hms_opt(0, 0, 0).unwrap());
    }
    Err(SyncError::MalformedDocument(anyhow::anyhow!(
        "invalid Fecha: '{}'",
        v
    )))
}
