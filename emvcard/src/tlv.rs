//! BER-TLV walking and the mapping of EMV data objects into [`CardData`].
//!
//! Parsing never fails: a malformed length ends the walk of the current
//! buffer, fields extracted so far stay in place and a
//! [`CardEvent::ParseStopped`] is emitted.

use crate::event::{CardEvent, EventSink, ParseStop};
use crate::records::AflEntry;
use crate::spaced_hex;
use iso7816_tlv::ber::{Tlv, Value};
use log::{debug, trace};
use regex::Regex;
use serde::Serialize;
use std::fmt;

/// Sanity bound for a single value, no EMV data object comes close.
pub const MAX_VALUE_LENGTH: usize = 4096;

const MAX_TAG_BYTES: usize = 3;
const MAX_LENGTH_BYTES: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmvTag {
    ApplicationTemplate,
    RecordTemplate,
    ResponseMessageTemplateFormat1,
    ResponseMessageTemplateFormat2,
    ApplicationPrimaryAccountNumber,
    ApplicationExpirationDate,
    CardholderName,
    Track2EquivalentData,
    Track2Data,
    IccPublicKeyCertificate,
    IccPublicKeyExponent,
    IccPublicKeyRemainder,
    DynamicDataAuthenticationDol,
    StaticDataAuthenticationTagList,
    Other(u32),
}

impl From<u32> for EmvTag {
    fn from(tag: u32) -> Self {
        match tag {
            0x61 => EmvTag::ApplicationTemplate,
            0x70 => EmvTag::RecordTemplate,
            0x80 => EmvTag::ResponseMessageTemplateFormat1,
            0x77 => EmvTag::ResponseMessageTemplateFormat2,
            0x5A => EmvTag::ApplicationPrimaryAccountNumber,
            0x5F24 => EmvTag::ApplicationExpirationDate,
            0x5F20 => EmvTag::CardholderName,
            // EMV names 57 the equivalent data and 9F6B the contactless track 2
            0x57 => EmvTag::Track2EquivalentData,
            0x9F6B => EmvTag::Track2Data,
            0x9F46 => EmvTag::IccPublicKeyCertificate,
            0x9F47 => EmvTag::IccPublicKeyExponent,
            0x9F48 => EmvTag::IccPublicKeyRemainder,
            0x9F49 => EmvTag::DynamicDataAuthenticationDol,
            0x9F4A => EmvTag::StaticDataAuthenticationTagList,
            other => EmvTag::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CardField {
    Pan,
    Expiry,
    CardholderName,
    Track2,
    IccCertificate,
    IccExponent,
    IccRemainder,
}

impl fmt::Display for CardField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CardField::Pan => "Card Number (PAN)",
            CardField::Expiry => "Expiry Date",
            CardField::CardholderName => "Cardholder Name",
            CardField::Track2 => "Track2 Data",
            CardField::IccCertificate => "ICC Public Key Certificate",
            CardField::IccExponent => "ICC Public Key Exponent",
            CardField::IccRemainder => "ICC Public Key Remainder",
        };

        write!(f, "{}", name)
    }
}

/// Payment data gathered over one card read.
///
/// PAN, expiry and cardholder name keep the first value unless a later write
/// comes with priority above zero. The ICC key components are appended to
/// `icc_certificate_text` as `Cert:`/`Exp:`/`Rem:` lines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CardData {
    pub pan: Option<String>,
    pub expiry: Option<String>,
    pub cardholder_name: Option<String>,
    pub track2: Option<String>,
    pub icc_certificate_text: Option<String>,
    #[serde(skip)]
    pub track2_tag: Option<u32>,
    #[serde(skip)]
    pub icc_certificate: Vec<u8>,
    #[serde(skip)]
    pub icc_exponent: Vec<u8>,
    #[serde(skip)]
    pub icc_remainder: Vec<u8>,
}

fn is_unset(slot: &Option<String>) -> bool {
    slot.as_deref().map_or(true, str::is_empty)
}

impl CardData {
    pub fn clear(&mut self) {
        *self = CardData::default();
    }

    pub fn get(&self, field: CardField) -> Option<&str> {
        match field {
            CardField::Pan => self.pan.as_deref(),
            CardField::Expiry => self.expiry.as_deref(),
            CardField::CardholderName => self.cardholder_name.as_deref(),
            CardField::Track2 => self.track2.as_deref(),
            CardField::IccCertificate | CardField::IccExponent | CardField::IccRemainder => {
                self.icc_certificate_text.as_deref()
            }
        }
    }

    pub fn is_missing(&self, field: CardField) -> bool {
        self.get(field).map_or(true, str::is_empty)
    }

    fn store(&mut self, field: CardField, value: String, priority: u8, events: &dyn EventSink) {
        let slot = match field {
            CardField::Pan => &mut self.pan,
            CardField::Expiry => &mut self.expiry,
            CardField::CardholderName => &mut self.cardholder_name,
            _ => return,
        };

        if priority > 0 || is_unset(slot) {
            *slot = Some(value.clone());
            events.emit(CardEvent::FieldStored {
                field,
                value,
                priority,
            });
        }
    }

    fn store_track2(&mut self, tag: u32, value: String, priority: u8, events: &dyn EventSink) {
        self.track2 = Some(value.clone());
        self.track2_tag = Some(tag);
        events.emit(CardEvent::FieldStored {
            field: CardField::Track2,
            value,
            priority,
        });
    }

    fn append_key_component(
        &mut self,
        field: CardField,
        raw: &[u8],
        priority: u8,
        events: &dyn EventSink,
    ) {
        let (prefix, component) = match field {
            CardField::IccCertificate => ("Cert: ", &mut self.icc_certificate),
            CardField::IccExponent => ("Exp: ", &mut self.icc_exponent),
            CardField::IccRemainder => ("Rem: ", &mut self.icc_remainder),
            _ => return,
        };
        *component = raw.to_vec();

        let text = spaced_hex(raw);
        let line = format!("{}{}", prefix, text);
        match self.icc_certificate_text.as_mut() {
            Some(combined) if !combined.is_empty() => {
                combined.push('\n');
                combined.push_str(&line);
            }
            _ => self.icc_certificate_text = Some(line),
        }

        events.emit(CardEvent::FieldStored {
            field,
            value: text,
            priority,
        });
    }
}

/// One decoded data object. The length is the length of `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvNode {
    pub tag: u32,
    pub value: Vec<u8>,
}

/// Reads the tag starting at `pos`. Bits 0-4 all set in the first byte mean a
/// multi byte tag; following bytes continue while bit 7 is set.
pub fn read_tag(buf: &[u8], pos: usize, end: usize) -> Result<(u32, usize), ParseStop> {
    let end = end.min(buf.len());
    if pos >= end {
        return Err(ParseStop::TruncatedTag { offset: pos });
    }

    let mut tag = buf[pos] as u32;
    let mut next = pos + 1;

    if buf[pos] & 0x1F == 0x1F {
        loop {
            if next >= end {
                return Err(ParseStop::TruncatedTag { offset: pos });
            }

            let byte = buf[next];
            tag = (tag << 8) | byte as u32;
            next += 1;

            if byte & 0x80 == 0 || next - pos >= MAX_TAG_BYTES {
                break;
            }
        }
    }

    Ok((tag, next))
}

/// Reads one tag-length-value triple from `buf[pos..end]`, returning it with
/// the offset just past the value.
pub fn read_node(buf: &[u8], pos: usize, end: usize) -> Result<(TlvNode, usize), ParseStop> {
    let end = end.min(buf.len());
    let (tag, mut index) = read_tag(buf, pos, end)?;

    if index >= end {
        return Err(ParseStop::MissingLength { offset: index });
    }

    let mut length = buf[index] as usize;
    index += 1;

    if length >= 0x80 {
        let length_of_length = (length & 0x7F) as u8;
        if length_of_length == 0
            || length_of_length > MAX_LENGTH_BYTES
            || index + length_of_length as usize > end
        {
            return Err(ParseStop::UnsupportedLengthOfLength {
                offset: index - 1,
                length_of_length,
            });
        }

        length = buf[index..index + length_of_length as usize]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        index += length_of_length as usize;
    }

    if length > MAX_VALUE_LENGTH {
        return Err(ParseStop::ImplausibleLength {
            offset: index,
            length,
        });
    }

    if index + length > end {
        return Err(ParseStop::ValueOverrun {
            offset: index,
            length,
            remaining: end - index,
        });
    }

    let node = TlvNode {
        tag,
        value: buf[index..index + length].to_vec(),
    };

    Ok((node, index + length))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseReport {
    pub tags: usize,
    pub stopped: Option<ParseStop>,
}

impl ParseReport {
    fn merge(&mut self, nested: ParseReport) {
        self.tags += nested.tags;
        if self.stopped.is_none() {
            self.stopped = nested.stopped;
        }
    }
}

fn format_expiry(value: &[u8]) -> Option<String> {
    let raw_date = hex::encode_upper(value);

    if raw_date.len() >= 6 {
        Some(format!(
            "20{}-{}-{}",
            &raw_date[0..2],
            &raw_date[2..4],
            &raw_date[4..6]
        ))
    } else if raw_date.len() >= 4 {
        Some(format!("20{}-{}", &raw_date[0..2], &raw_date[2..4]))
    } else {
        None
    }
}

fn ascii_text(value: &[u8]) -> String {
    value
        .iter()
        .map(|b| if b.is_ascii() { *b as char } else { '?' })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Walks `buffer[start..end]` and maps the known EMV tags into `card_data`.
pub fn parse(
    buffer: &[u8],
    start: usize,
    end: usize,
    card_data: &mut CardData,
    priority: u8,
    events: &dyn EventSink,
) -> ParseReport {
    let end = end.min(buffer.len());
    let mut report = ParseReport::default();
    let mut index = start;

    trace!("Parsing {} TLV bytes, priority={}", end.saturating_sub(start), priority);

    while index < end {
        let (node, next) = match read_node(buffer, index, end) {
            Ok(result) => result,
            Err(reason) => {
                events.emit(CardEvent::ParseStopped(reason.clone()));
                report.stopped = Some(reason);
                break;
            }
        };
        index = next;
        report.tags += 1;

        let nested = process_node(&node, card_data, priority, events);
        report.merge(nested);
    }

    report
}

fn process_node(
    node: &TlvNode,
    card_data: &mut CardData,
    priority: u8,
    events: &dyn EventSink,
) -> ParseReport {
    let value = &node.value[..];

    match EmvTag::from(node.tag) {
        EmvTag::ApplicationPrimaryAccountNumber => {
            let pan = hex::encode_upper(value).trim_end_matches('F').to_string();
            card_data.store(CardField::Pan, pan, priority, events);
        }
        EmvTag::ApplicationExpirationDate => {
            if let Some(expiry) = format_expiry(value) {
                card_data.store(CardField::Expiry, expiry, priority, events);
            }
        }
        EmvTag::CardholderName => {
            card_data.store(CardField::CardholderName, ascii_text(value), priority, events);
        }
        EmvTag::Track2EquivalentData => {
            card_data.store_track2(node.tag, hex::encode_upper(value), priority, events);
        }
        EmvTag::Track2Data => {
            if is_unset(&card_data.track2) {
                card_data.store_track2(node.tag, hex::encode_upper(value), priority, events);
            }
        }
        EmvTag::IccPublicKeyCertificate => {
            card_data.append_key_component(CardField::IccCertificate, value, priority, events)
        }
        EmvTag::IccPublicKeyExponent => {
            card_data.append_key_component(CardField::IccExponent, value, priority, events)
        }
        EmvTag::IccPublicKeyRemainder => {
            card_data.append_key_component(CardField::IccRemainder, value, priority, events)
        }
        EmvTag::DynamicDataAuthenticationDol | EmvTag::StaticDataAuthenticationTagList => {
            events.emit(CardEvent::TagNoted {
                tag: node.tag,
                value: value.to_vec(),
            });
        }
        EmvTag::ApplicationTemplate
        | EmvTag::RecordTemplate
        | EmvTag::ResponseMessageTemplateFormat2 => {
            return parse(value, 0, value.len(), card_data, priority, events);
        }
        EmvTag::ResponseMessageTemplateFormat1 => {
            if value.len() > 2 {
                return parse(value, 2, value.len(), card_data, priority, events);
            }
        }
        EmvTag::Other(tag) => trace!("Skipping tag {:X}", tag),
    }

    ParseReport::default()
}

const TAG_APPLICATION_FILE_LOCATOR: u32 = 0x94;

fn afl_group(buffer: &[u8], pos: usize) -> Option<AflEntry> {
    let group = buffer.get(pos..pos + 4)?;

    Some(AflEntry {
        sfi: group[0] >> 3,
        first_record: group[1],
        last_record: group[2],
    })
}

/// Value of tag 94 among the children of a format 2 template.
fn find_afl_value(gpo_response: &[u8]) -> Result<Option<Vec<u8>>, ParseStop> {
    let (template, _) = read_node(gpo_response, 0, gpo_response.len())?;
    let body = &template.value[..];
    let mut index = 0;

    while index < body.len() {
        let (node, next) = read_node(body, index, body.len())?;
        if node.tag == TAG_APPLICATION_FILE_LOCATOR {
            return Ok(Some(node.value));
        }
        index = next;
    }

    Ok(None)
}

// first 94 byte followed by a short form length
fn scan_afl_value(gpo_response: &[u8]) -> Option<Vec<u8>> {
    let i = gpo_response
        .iter()
        .position(|b| *b as u32 == TAG_APPLICATION_FILE_LOCATOR)?;
    let length = gpo_response.get(i + 1).copied().unwrap_or(0) as usize;
    let limit = (i + 2 + length).min(gpo_response.len());

    gpo_response.get(i + 2..limit).map(|value| value.to_vec())
}

/// Application File Locator from a GET PROCESSING OPTIONS response body.
pub fn parse_afl(gpo_response: &[u8]) -> Vec<AflEntry> {
    let mut entries: Vec<AflEntry> = Vec::new();

    match gpo_response.first() {
        // format 2: tag 94 inside the template, read in 4 byte groups
        Some(0x77) => {
            let afl = match find_afl_value(gpo_response) {
                Ok(afl) => afl,
                Err(reason) => {
                    debug!("GPO response is not valid TLV ({}), scanning for tag 94", reason);
                    scan_afl_value(gpo_response)
                }
            };

            if let Some(afl) = afl {
                let mut pos = 0;
                while pos + 3 < afl.len() {
                    if let Some(entry) = afl_group(&afl, pos) {
                        entries.push(entry);
                    }
                    pos += 4;
                }
            }
        }
        // format 1: 80 len AIP(2) AFL
        Some(0x80) => {
            let total_length = gpo_response.get(1).copied().unwrap_or(0) as usize;
            if total_length + 2 > gpo_response.len() {
                return entries;
            }

            let mut pos = 4;
            while pos + 3 < 2 + total_length {
                if let Some(entry) = afl_group(gpo_response, pos) {
                    if entry.is_valid() {
                        entries.push(entry);
                    }
                }
                pos += 4;
            }
        }
        _ => {}
    }

    trace!("Found {} AFL entries", entries.len());

    entries
}

/// Fills PAN and expiry from Track-2 when the records did not carry them.
pub fn extract_from_track2(card_data: &mut CardData, events: &dyn EventSink) {
    let track2 = match card_data.track2.as_deref() {
        Some(track2) if !track2.is_empty() => track2.to_string(),
        _ => return,
    };

    let separator = match track2.find('D') {
        Some(i) if i > 0 => Some(i),
        _ => track2.find('='),
    };

    let separator = match separator {
        Some(i) if i > 0 && track2.len() >= i + 5 => i,
        _ => return,
    };

    if is_unset(&card_data.pan) {
        let pan = track2[..separator].trim_end_matches('F').to_string();
        card_data.store(CardField::Pan, pan, 0, events);
    }

    if is_unset(&card_data.expiry) {
        let expiry_yymm = track2.get(separator + 1..separator + 5).unwrap_or("");
        let numeric = Regex::new(r"^\d{4}$")
            .map(|re| re.is_match(expiry_yymm))
            .unwrap_or(false);

        if numeric {
            let expiry = format!("20{}-{}", &expiry_yymm[0..2], &expiry_yymm[2..4]);
            card_data.store(CardField::Expiry, expiry, 0, events);
        }
    }
}

/// Depth first search for `tag` (upper case hex, e.g. "9F38").
pub fn find_tlv_tag(buf: &[u8], tag: &str) -> Option<Tlv> {
    let mut read_buffer = buf;

    loop {
        let (tlv_data, leftover_buffer) = Tlv::parse(read_buffer);

        let tlv_data: Tlv = match tlv_data {
            Ok(tlv) => tlv,
            Err(err) => {
                if !leftover_buffer.is_empty() {
                    trace!(
                        "Could not parse as TLV! error:{:?}, data: {:02X?}",
                        err,
                        read_buffer
                    );
                }

                break;
            }
        };

        read_buffer = leftover_buffer;

        let tag_name = hex::encode_upper(tlv_data.tag().to_bytes());

        if tag_name == tag {
            return Some(tlv_data);
        }

        if let Value::Constructed(v) = tlv_data.value() {
            for tlv_tag in v {
                let child_tlv: Option<Tlv> = find_tlv_tag(&tlv_tag.to_vec(), tag);
                if child_tlv.is_some() {
                    return child_tlv;
                }
            }
        }

        if leftover_buffer.is_empty() {
            break;
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::recording::RecordingSink;
    use crate::event::NullSink;

    fn parse_all(buffer: &[u8], card_data: &mut CardData, priority: u8) -> ParseReport {
        parse(buffer, 0, buffer.len(), card_data, priority, &NullSink)
    }

    #[test]
    fn test_short_and_long_form_lengths() {
        let (node, next) = read_node(&[0x5A, 0x02, 0x12, 0x34, 0xFF], 0, 5).unwrap();
        assert_eq!(node.tag, 0x5A);
        assert_eq!(node.value, vec![0x12, 0x34]);
        assert_eq!(next, 4);

        let mut long_form = vec![0x9F, 0x46, 0x81, 0x90];
        long_form.extend_from_slice(&[0xAB; 0x90]);
        let (node, next) = read_node(&long_form, 0, long_form.len()).unwrap();
        assert_eq!(node.tag, 0x9F46);
        assert_eq!(node.value.len(), 0x90);
        assert_eq!(next, long_form.len());

        let mut three_bytes = vec![0x70, 0x83, 0x00, 0x01, 0x00];
        three_bytes.extend_from_slice(&[0x00; 0x100]);
        let (node, _) = read_node(&three_bytes, 0, three_bytes.len()).unwrap();
        assert_eq!(node.value.len(), 0x100);
    }

    #[test]
    fn test_multi_byte_tags() {
        let (tag, next) = read_tag(&[0x5F, 0x24, 0x03], 0, 3).unwrap();
        assert_eq!((tag, next), (0x5F24, 2));

        let (node, _) = read_node(&[0xDF, 0x81, 0x01, 0x01, 0xAA], 0, 5).unwrap();
        assert_eq!(node.tag, 0xDF8101);
        assert_eq!(node.value, vec![0xAA]);

        assert_eq!(
            read_tag(&[0x9F], 0, 1),
            Err(ParseStop::TruncatedTag { offset: 0 })
        );
    }

    #[test]
    fn test_malformed_lengths_stop_parsing() {
        assert_eq!(
            read_node(&[0x5A, 0x84, 0x00, 0x00, 0x00, 0x01, 0x00], 0, 7),
            Err(ParseStop::UnsupportedLengthOfLength {
                offset: 1,
                length_of_length: 4
            })
        );
        assert_eq!(
            read_node(&[0x5A, 0x80, 0x00], 0, 3),
            Err(ParseStop::UnsupportedLengthOfLength {
                offset: 1,
                length_of_length: 0
            })
        );
        assert_eq!(
            read_node(&[0x5A, 0x82, 0x10, 0x01, 0x00], 0, 5),
            Err(ParseStop::ImplausibleLength {
                offset: 4,
                length: 0x1001
            })
        );
        assert_eq!(
            read_node(&[0x5A, 0x05, 0x41, 0x11], 0, 4),
            Err(ParseStop::ValueOverrun {
                offset: 2,
                length: 5,
                remaining: 2
            })
        );
    }

    #[test]
    fn test_extracted_fields_survive_a_stop() {
        let sink = RecordingSink::default();
        let mut card_data = CardData::default();
        let buffer = [
            0x5A, 0x08, 0x41, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, // PAN
            0x5F, 0x20, 0x7F, 0x41, // length runs past the end
        ];

        let report = parse(&buffer, 0, buffer.len(), &mut card_data, 0, &sink);

        assert_eq!(card_data.pan.as_deref(), Some("4111111111111111"));
        assert_eq!(card_data.cardholder_name, None);
        assert_eq!(report.tags, 1);
        assert!(matches!(report.stopped, Some(ParseStop::ValueOverrun { .. })));
        assert_eq!(sink.parse_stops(), 1);
    }

    #[test]
    fn test_pan_extraction() {
        let mut card_data = CardData::default();
        parse_all(
            &[0x5A, 0x09, 0x41, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0xFF],
            &mut card_data,
            0,
        );
        assert_eq!(card_data.pan.as_deref(), Some("4111111111111111"));

        let mut card_data = CardData::default();
        parse_all(
            &[0x5A, 0x08, 0x54, 0x13, 0x33, 0x00, 0x89, 0x02, 0x00, 0x1F],
            &mut card_data,
            0,
        );
        assert_eq!(card_data.pan.as_deref(), Some("541333008902001"));
    }

    #[test]
    fn test_expiry_decoding() {
        let mut card_data = CardData::default();
        parse_all(&[0x5F, 0x24, 0x03, 0x25, 0x12, 0x31], &mut card_data, 0);
        assert_eq!(card_data.expiry.as_deref(), Some("2025-12-31"));

        let mut card_data = CardData::default();
        parse_all(&[0x5F, 0x24, 0x02, 0x25, 0x12], &mut card_data, 0);
        assert_eq!(card_data.expiry.as_deref(), Some("2025-12"));

        let mut card_data = CardData::default();
        parse_all(&[0x5F, 0x24, 0x01, 0x25], &mut card_data, 0);
        assert_eq!(card_data.expiry, None);
    }

    #[test]
    fn test_cardholder_name_is_trimmed() {
        let mut card_data = CardData::default();
        let mut buffer = vec![0x5F, 0x20, 0x0A];
        buffer.extend_from_slice(b"DOE/JOHN  ");
        parse_all(&buffer, &mut card_data, 0);

        assert_eq!(card_data.cardholder_name.as_deref(), Some("DOE/JOHN"));
    }

    #[test]
    fn test_priority_overwrite() {
        let first = [0x5A, 0x02, 0x12, 0x34];
        let second = [0x5A, 0x02, 0x56, 0x78];
        let mut card_data = CardData::default();

        parse_all(&first, &mut card_data, 0);
        parse_all(&second, &mut card_data, 0);
        assert_eq!(card_data.pan.as_deref(), Some("1234"));

        parse_all(&second, &mut card_data, 1);
        assert_eq!(card_data.pan.as_deref(), Some("5678"));
    }

    #[test]
    fn test_track2_equivalent_never_overwrites() {
        let mut card_data = CardData::default();
        parse_all(
            &[0x57, 0x05, 0x41, 0x11, 0xD2, 0x51, 0x2F],
            &mut card_data,
            0,
        );
        parse_all(
            &[0x9F, 0x6B, 0x04, 0x55, 0x55, 0xD2, 0x60],
            &mut card_data,
            1,
        );

        assert_eq!(card_data.track2.as_deref(), Some("4111D2512F"));
        assert_eq!(card_data.track2_tag, Some(0x57));

        let mut card_data = CardData::default();
        parse_all(&[0x9F, 0x6B, 0x02, 0x55, 0xD2], &mut card_data, 0);
        parse_all(&[0x57, 0x02, 0x41, 0xD2], &mut card_data, 0);
        assert_eq!(card_data.track2.as_deref(), Some("41D2"));
    }

    #[test]
    fn test_key_components_are_appended() {
        let mut card_data = CardData::default();
        parse_all(
            &[
                0x70, 0x0C, // record template
                0x9F, 0x46, 0x02, 0xAB, 0xCD, // certificate
                0x9F, 0x47, 0x01, 0x03, // exponent
                0x9F, 0x49, 0x00, // DDOL, noted only
            ],
            &mut card_data,
            1,
        );
        parse_all(&[0x9F, 0x48, 0x02, 0x01, 0x02], &mut card_data, 1);

        assert_eq!(
            card_data.icc_certificate_text.as_deref(),
            Some("Cert: AB CD\nExp: 03\nRem: 01 02")
        );
        assert_eq!(card_data.icc_certificate, vec![0xAB, 0xCD]);
        assert_eq!(card_data.icc_exponent, vec![0x03]);
        assert_eq!(card_data.icc_remainder, vec![0x01, 0x02]);
    }

    #[test]
    fn test_templates_are_recursed() {
        let mut card_data = CardData::default();
        parse_all(
            &[
                0x77, 0x0B, // format 2
                0x61, 0x09, 0x70, 0x07, 0x5F, 0x24, 0x03, 0x29, 0x02, 0x28, 0x00,
            ],
            &mut card_data,
            0,
        );
        assert_eq!(card_data.expiry.as_deref(), Some("2029-02-28"));

        let mut card_data = CardData::default();
        parse_all(
            &[0x80, 0x06, 0x19, 0x80, 0x5A, 0x02, 0x12, 0x34],
            &mut card_data,
            0,
        );
        assert_eq!(card_data.pan.as_deref(), Some("1234"));
    }

    #[test]
    fn test_afl_format_2() {
        let response = [
            0x77, 0x0E, 0x82, 0x02, 0x19, 0x80, 0x94, 0x08, 0x0C, 0x01, 0x01, 0x00, 0x14, 0x01,
            0x02, 0x00,
        ];

        assert_eq!(
            parse_afl(&response),
            vec![
                AflEntry {
                    sfi: 1,
                    first_record: 1,
                    last_record: 1
                },
                AflEntry {
                    sfi: 2,
                    first_record: 1,
                    last_record: 2
                },
            ]
        );
    }

    #[test]
    fn test_afl_format_2_long_form_length() {
        // template length 0x94 must not be taken for the AFL tag
        let mut response = vec![
            0x77, 0x81, 0x94, // format 2, 148 bytes
            0x82, 0x02, 0x20, 0x00, // AIP
            0x94, 0x04, 0x10, 0x01, 0x01, 0x00, // AFL, SFI 2
            0x9F, 0x4B, 0x81, 0x86, // signed dynamic application data
        ];
        response.extend_from_slice(&[0x5A; 0x86]);
        assert_eq!(response.len(), 3 + 0x94);

        assert_eq!(
            parse_afl(&response),
            vec![AflEntry {
                sfi: 2,
                first_record: 1,
                last_record: 1
            }]
        );
    }

    #[test]
    fn test_afl_format_2_aip_holding_94() {
        let response = [
            0x77, 0x0A, 0x82, 0x02, 0x94, 0x00, 0x94, 0x04, 0x08, 0x01, 0x02, 0x00,
        ];

        assert_eq!(
            parse_afl(&response),
            vec![AflEntry {
                sfi: 1,
                first_record: 1,
                last_record: 2
            }]
        );

        assert!(parse_afl(&[0x77, 0x04, 0x82, 0x02, 0x19, 0x80]).is_empty());
    }

    #[test]
    fn test_afl_format_2_scan_when_not_tlv() {
        // template length runs past the end of the response
        let response = [
            0x77, 0x20, 0x82, 0x02, 0x19, 0x80, 0x94, 0x04, 0x18, 0x01, 0x01, 0x00,
        ];

        assert_eq!(
            parse_afl(&response),
            vec![AflEntry {
                sfi: 3,
                first_record: 1,
                last_record: 1
            }]
        );
    }

    #[test]
    fn test_afl_format_1_skips_invalid_groups() {
        let response = [
            0x80, 0x0E, 0x19, 0x80, // AIP
            0x08, 0x01, 0x01, 0x00, // SFI 1
            0x10, 0x02, 0x01, 0x00, // end before start
            0x18, 0x01, 0x03, 0x01, // SFI 3
        ];

        assert_eq!(
            parse_afl(&response),
            vec![
                AflEntry {
                    sfi: 1,
                    first_record: 1,
                    last_record: 1
                },
                AflEntry {
                    sfi: 3,
                    first_record: 1,
                    last_record: 3
                },
            ]
        );

        assert!(parse_afl(&[0x80, 0x20, 0x19, 0x80]).is_empty());
        assert!(parse_afl(&[0x6F, 0x00]).is_empty());
        assert!(parse_afl(&[]).is_empty());
    }

    #[test]
    fn test_track2_fallback() {
        let mut card_data = CardData {
            track2: Some("4111111111111111D25122011234567890F".to_string()),
            ..CardData::default()
        };
        extract_from_track2(&mut card_data, &NullSink);
        assert_eq!(card_data.pan.as_deref(), Some("4111111111111111"));
        assert_eq!(card_data.expiry.as_deref(), Some("2025-12"));

        let mut card_data = CardData {
            pan: Some("5555".to_string()),
            track2: Some("4111111111111111=2612".to_string()),
            ..CardData::default()
        };
        extract_from_track2(&mut card_data, &NullSink);
        assert_eq!(card_data.pan.as_deref(), Some("5555"));
        assert_eq!(card_data.expiry.as_deref(), Some("2026-12"));

        let mut card_data = CardData {
            track2: Some("41111111D25".to_string()),
            ..CardData::default()
        };
        extract_from_track2(&mut card_data, &NullSink);
        assert_eq!(card_data.pan, None);

        let mut card_data = CardData {
            track2: Some("41111111D25AB".to_string()),
            ..CardData::default()
        };
        extract_from_track2(&mut card_data, &NullSink);
        assert_eq!(card_data.pan.as_deref(), Some("41111111"));
        assert_eq!(card_data.expiry, None);
    }

    #[test]
    fn test_find_tlv_tag() {
        let fci =
            hex::decode("6F1D8407A0000000031010A512500A564953412044454249549F38039F1A02")
                .unwrap();

        assert!(find_tlv_tag(&fci, "50").is_some());
        assert_eq!(
            find_tlv_tag(&fci, "9F38").map(|tlv| tlv.to_vec()),
            Some(vec![0x9F, 0x38, 0x03, 0x9F, 0x1A, 0x02])
        );
        assert!(find_tlv_tag(&fci, "9F66").is_none());
    }
}
