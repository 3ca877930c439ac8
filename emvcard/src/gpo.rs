//! GET PROCESSING OPTIONS: PDOL answer synthesis and the command exchange.

use crate::apdu::Apdu;
use crate::bcdutil;
use crate::error::EmvError;
use crate::event::CardEvent;
use crate::tlv::{self, find_tlv_tag};
use crate::EmvConnection;
use chrono::Utc;
use iso7816_tlv::ber::Value;
use log::{debug, trace, warn};
use rand::RngCore;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::fmt;

const TAG_PDOL: &str = "9F38";

// 83 tag and length byte share the one byte Lc with the data
const MAX_PDOL_DATA_LENGTH: usize = 0xFF - 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataObject {
    pub tag: u32,
    pub length: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataObjectList {
    data_objects: Vec<DataObject>,
}

impl fmt::Display for DataObjectList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for data_object in &self.data_objects {
            write!(f, "{:X} ({}b); ", data_object.tag, data_object.length)?;
        }

        Ok(())
    }
}

// EMV Book 3, 5.4 Rules for Using a Data Object List (DOL)
impl DataObjectList {
    /// Tag and length pairs; a truncated tail is dropped.
    pub fn parse(tag_list: &[u8]) -> DataObjectList {
        let mut dol = DataObjectList::default();
        let mut i = 0;

        while i < tag_list.len() {
            let (tag, next) = match tlv::read_tag(tag_list, i, tag_list.len()) {
                Ok(result) => result,
                Err(reason) => {
                    warn!("Incorrect data object list: {}", reason);
                    break;
                }
            };

            let length = match tag_list.get(next) {
                Some(length) => *length as usize,
                None => {
                    warn!("Data object list ends without length for tag {:X}", tag);
                    break;
                }
            };

            dol.data_objects.push(DataObject { tag, length });
            i = next + 1;
        }

        dol
    }

    pub fn data_objects(&self) -> &[DataObject] {
        &self.data_objects
    }

    pub fn has_tag(&self, tag: u32) -> bool {
        self.data_objects.iter().any(|data_object| data_object.tag == tag)
    }
}

/// Declared length wins over the configured value: longer values are cut,
/// shorter ones padded with zeros.
fn fit_to_length(data_object: &DataObject, mut value: Vec<u8>) -> Vec<u8> {
    if data_object.length > 0 && value.len() != data_object.length {
        warn!(
            "tag {:X} value length {:02X} does not match tag list value length {:02X}",
            data_object.tag,
            value.len(),
            data_object.length
        );
        value.resize(data_object.length, 0x00);
    }

    value
}

impl EmvConnection<'_> {
    fn fill_random(&self, data: &mut [u8]) {
        if self.settings.terminal.use_random {
            let mut rng = ChaCha20Rng::from_entropy();
            rng.fill_bytes(data);
        }
    }

    fn transaction_date(&self) -> Vec<u8> {
        let today = Utc::now().format("%y%m%d").to_string();

        match bcdutil::ascii_to_bcd_n(&today, 3) {
            Ok(date) => date,
            Err(err) => {
                warn!("Could not encode transaction date {}: {}", today, err);
                vec![0x00; 3]
            }
        }
    }

    fn terminal_value(&self, data_object: &DataObject) -> Vec<u8> {
        let terminal = &self.settings.terminal;

        let value = match data_object.tag {
            0x9F66 => terminal.terminal_transaction_qualifiers.clone(),
            0x9F02 => terminal.amount_authorised.clone(),
            0x9F1A => terminal.terminal_country_code.clone(),
            0x5F2A => terminal.transaction_currency_code.clone(),
            0x9A => self.transaction_date(),
            0x9C => terminal.transaction_type.clone(),
            0x9F37 => {
                let mut unpredictable_number = vec![0x00; data_object.length];
                self.fill_random(&mut unpredictable_number);
                unpredictable_number
            }
            // 9F03 amount other and everything unknown
            _ => {
                trace!("tag {:X} has no value, filling with zeros", data_object.tag);
                vec![0x00; data_object.length]
            }
        };

        fit_to_length(data_object, value)
    }

    /// Terminal data for every object the PDOL requests, concatenated in order.
    pub fn pdol_data(&self, dol: &DataObjectList) -> Vec<u8> {
        let mut output: Vec<u8> = Vec::new();

        for data_object in dol.data_objects() {
            output.extend_from_slice(&self.terminal_value(data_object));
        }

        output
    }

    fn find_pdol(&self, fci: &[u8]) -> Option<Vec<u8>> {
        if let Some(tag_9f38) = find_tlv_tag(fci, TAG_PDOL) {
            if let Value::Primitive(value) = tag_9f38.value() {
                return Some(value.clone());
            }
        }

        // FCI that does not parse as BER-TLV, scan for the tag bytes instead
        let index = fci.windows(2).position(|tag| tag == [0x9F, 0x38])?;
        let length = *fci.get(index + 2)? as usize;
        fci.get(index + 3..index + 3 + length).map(<[u8]>::to_vec)
    }

    /// Sends GET PROCESSING OPTIONS for the selected application. The body of
    /// a response in template 80 or 77 is returned.
    pub fn send_gpo(&mut self, fci: &[u8]) -> Result<Vec<u8>, EmvError> {
        debug!("GET PROCESSING OPTIONS:");

        let pdol_data = match self.find_pdol(fci) {
            Some(pdol) => {
                let dol = DataObjectList::parse(&pdol);
                debug!("PDOL: {}", dol);
                self.pdol_data(&dol)
            }
            None => {
                self.emit(CardEvent::Info(
                    "No PDOL found, sending simplified GPO".to_string(),
                ));
                Vec::new()
            }
        };

        if pdol_data.len() > MAX_PDOL_DATA_LENGTH {
            return Err(EmvError::UnexpectedResponse(format!(
                "PDOL requests {} bytes",
                pdol_data.len()
            )));
        }

        let response = self
            .exchange_with_autofix(&Apdu::get_processing_options(&pdol_data))?
            .into_success_data()?;

        match response.first() {
            Some(0x80) | Some(0x77) => Ok(response),
            other => Err(EmvError::UnexpectedResponse(format!(
                "GPO response template {:02X?}",
                other
            ))),
        }
    }
}
