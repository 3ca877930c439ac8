//! ISO 7816-4 command/response units and the exchange loop with length
//! correction on top of the raw transport.

use crate::error::{EmvError, TransportError};
use crate::event::CardEvent;
use crate::EmvConnection;
use hexplay::HexViewBuilder;
use log::{debug, trace};
use std::fmt;

/// Raw byte exchange with an already open card session.
pub trait ApduInterface {
    fn send_apdu(&mut self, apdu: &[u8]) -> Result<Vec<u8>, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub const SUCCESS: StatusWord = StatusWord(0x9000);
    pub const WRONG_LENGTH: StatusWord = StatusWord(0x6700);
    pub const FILE_NOT_FOUND: StatusWord = StatusWord(0x6A82);
    pub const RECORD_NOT_FOUND: StatusWord = StatusWord(0x6A83);

    pub fn new(sw1: u8, sw2: u8) -> StatusWord {
        StatusWord(u16::from_be_bytes([sw1, sw2]))
    }

    pub fn sw1(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn sw2(&self) -> u8 {
        self.0 as u8
    }

    pub fn to_bytes(&self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub fn is_success(&self) -> bool {
        *self == StatusWord::SUCCESS
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// Command APDU. Case 1-4 encoding is chosen from the presence of data and Le.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    pub le: Option<u8>,
}

impl Apdu {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Apdu {
        Apdu {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
        }
    }

    pub fn with_data(mut self, data: &[u8]) -> Apdu {
        self.data = data.to_vec();
        self
    }

    pub fn with_le(mut self, le: u8) -> Apdu {
        self.le = Some(le);
        self
    }

    /// ref. EMV Book 1, 11.3.2 Command message
    pub fn select(aid: &[u8]) -> Apdu {
        let p1_reference_control_parameter: u8 = 0b0000_0100; // "Select by name"
        let p2_selection_options: u8 = 0b0000_0000; // "First or only occurrence"

        Apdu::new(0x00, 0xA4, p1_reference_control_parameter, p2_selection_options).with_data(aid)
    }

    pub fn read_record(short_file_identifier: u8, record_index: u8) -> Apdu {
        const RECORD_LENGTH_DEFAULT: u8 = 0x00;

        Apdu::new(0x00, 0xB2, record_index, (short_file_identifier << 3) | 0x04)
            .with_le(RECORD_LENGTH_DEFAULT)
    }

    /// ref. EMV Book 3, 6.5.8 GET PROCESSING OPTIONS Command-Response APDUs
    pub fn get_processing_options(pdol_data: &[u8]) -> Apdu {
        let mut command_template = vec![0x83, pdol_data.len() as u8];
        command_template.extend_from_slice(pdol_data);

        Apdu::new(0x80, 0xA8, 0x00, 0x00)
            .with_data(&command_template)
            .with_le(0x00)
    }

    pub fn get_response(available_data_length: u8) -> Apdu {
        Apdu::new(0x00, 0xC0, 0x00, 0x00).with_le(available_data_length)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut command = vec![self.cla, self.ins, self.p1, self.p2];

        if !self.data.is_empty() {
            command.push(self.data.len() as u8); // lc
            command.extend_from_slice(&self.data);
        }

        if let Some(le) = self.le {
            command.push(le);
        }

        command
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    pub data: Vec<u8>,
    pub status: StatusWord,
}

impl ApduResponse {
    pub fn from_raw(raw: &[u8]) -> Result<ApduResponse, TransportError> {
        if raw.len() < 2 {
            return Err(TransportError::ShortResponse(raw.len()));
        }

        let (data, trailer) = raw.split_at(raw.len() - 2);

        Ok(ApduResponse {
            data: data.to_vec(),
            status: StatusWord::new(trailer[0], trailer[1]),
        })
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Success status with a body, the usual requirement for data carrying commands.
    pub fn into_success_data(self) -> Result<Vec<u8>, EmvError> {
        if self.is_success() {
            Ok(self.data)
        } else {
            Err(EmvError::Status(self.status))
        }
    }
}

const SW1_BYTES_AVAILABLE: u8 = 0x61;
const SW1_WRONG_LENGTH: u8 = 0x6C;

impl EmvConnection<'_> {
    /// Single exchange without any status interpretation.
    pub fn exchange(&mut self, apdu: &Apdu) -> Result<ApduResponse, EmvError> {
        let command = apdu.to_bytes();

        if self.settings.censor_sensitive_fields {
            debug!(
                "Sending APDU: {:02X?}... ({} bytes)",
                &command[..command.len().min(5)],
                command.len()
            );
        } else {
            debug!("Sending APDU:\n{}", HexViewBuilder::new(&command).finish());
        }

        let raw_response = self.interface.send_apdu(&command)?;
        let response = ApduResponse::from_raw(&raw_response)?;

        debug!(
            "APDU response status: {}",
            self.constants.describe_status(&response.status.to_bytes())
        );

        if self.settings.censor_sensitive_fields {
            debug!("APDU response({} bytes)", response.data.len());
        } else {
            debug!(
                "APDU response({} bytes):\n{}",
                response.data.len(),
                HexViewBuilder::new(&response.data).finish()
            );
        }

        self.emit(CardEvent::ApduExchanged {
            command: apdu.ins,
            status: response.status,
            length: response.data.len(),
        });

        Ok(response)
    }

    /// Resolves the ISO 7816-4 length mismatch statuses with at most one
    /// follow-up command. Only a bare status word (no body) is corrected.
    pub fn exchange_with_autofix(&mut self, apdu: &Apdu) -> Result<ApduResponse, EmvError> {
        let response = self.exchange(apdu)?;

        if !response.data.is_empty() {
            return Ok(response);
        }

        let status = response.status;
        let follow_up = match status.sw1() {
            SW1_WRONG_LENGTH => {
                let mut retry = apdu.clone();
                retry.le = Some(status.sw2());
                retry
            }
            _ if status == StatusWord::WRONG_LENGTH => {
                let mut retry = apdu.clone();
                retry.le = Some(0xFF);
                retry
            }
            SW1_BYTES_AVAILABLE => Apdu::get_response(status.sw2()),
            _ => return Ok(response),
        };

        trace!(
            "Status {} corrected with {:02X?}",
            status,
            follow_up.to_bytes()
        );
        self.emit(CardEvent::LengthCorrected {
            status,
            le: follow_up.le.unwrap_or(0x00),
        });

        self.exchange(&follow_up)
    }
}
