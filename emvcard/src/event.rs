//! Structured notifications raised while a card is read. Components never log
//! card data themselves, they hand events to the sink given to the connection.

use crate::apdu::StatusWord;
use crate::get_truncated_pan;
use crate::tlv::CardField;
use log::{debug, info, warn};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStop {
    TruncatedTag { offset: usize },
    MissingLength { offset: usize },
    UnsupportedLengthOfLength { offset: usize, length_of_length: u8 },
    ImplausibleLength { offset: usize, length: usize },
    ValueOverrun { offset: usize, length: usize, remaining: usize },
}

impl fmt::Display for ParseStop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseStop::TruncatedTag { offset } => write!(f, "tag truncated at {}", offset),
            ParseStop::MissingLength { offset } => write!(f, "length missing at {}", offset),
            ParseStop::UnsupportedLengthOfLength {
                offset,
                length_of_length,
            } => write!(
                f,
                "length field abnormal at {}: {} length bytes",
                offset, length_of_length
            ),
            ParseStop::ImplausibleLength { offset, length } => {
                write!(f, "length {} at {} exceeds sanity bound", length, offset)
            }
            ParseStop::ValueOverrun {
                offset,
                length,
                remaining,
            } => write!(
                f,
                "length {} at {} exceeds remaining {} bytes",
                length, offset, remaining
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardEvent {
    ApduExchanged {
        command: u8,
        status: StatusWord,
        length: usize,
    },
    LengthCorrected {
        status: StatusWord,
        le: u8,
    },
    FieldStored {
        field: CardField,
        value: String,
        priority: u8,
    },
    /// Tag noted but not mapped into the card data (DDOL, SDA tag list).
    TagNoted {
        tag: u32,
        value: Vec<u8>,
    },
    ParseStopped(ParseStop),
    ApplicationFound {
        aid: Vec<u8>,
        label: String,
    },
    RecordRead {
        sfi: u8,
        record: u8,
        status: StatusWord,
    },
    Info(String),
    Warning(String),
}

pub trait EventSink {
    fn emit(&self, event: CardEvent);
}

pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: CardEvent) {}
}

/// Forwards events to the `log` facade.
pub struct LogSink {
    pub censor_sensitive_fields: bool,
}

impl LogSink {
    pub fn new(censor_sensitive_fields: bool) -> LogSink {
        LogSink {
            censor_sensitive_fields,
        }
    }

    fn censored_value(&self, field: CardField, value: &str) -> String {
        if !self.censor_sensitive_fields {
            return value.to_string();
        }

        match field {
            CardField::Pan => get_truncated_pan(value),
            CardField::Expiry => value.to_string(),
            _ => format!("<{} chars>", value.len()),
        }
    }
}

impl EventSink for LogSink {
    fn emit(&self, event: CardEvent) {
        match event {
            CardEvent::ApduExchanged {
                command,
                status,
                length,
            } => debug!("INS {:02X} answered {} ({} bytes)", command, status, length),
            CardEvent::LengthCorrected { status, le } => {
                debug!("Status {} resolved with Le {:02X}", status, le)
            }
            CardEvent::FieldStored {
                field,
                value,
                priority,
            } => info!(
                "{}: {} (priority {})",
                field,
                self.censored_value(field, &value),
                priority
            ),
            CardEvent::TagNoted { tag, value } => {
                debug!("Tag {:X} ({} bytes): {:02X?}", tag, value.len(), value)
            }
            CardEvent::ParseStopped(reason) => info!("TLV parsing stopped: {}", reason),
            CardEvent::ApplicationFound { aid, label } => {
                info!("Application {} - {:?}", hex::encode_upper(&aid), label)
            }
            CardEvent::RecordRead {
                sfi,
                record,
                status,
            } => debug!("READ RECORD SFI {} record {}: {}", sfi, record, status),
            CardEvent::Info(message) => info!("{}", message),
            CardEvent::Warning(message) => warn!("{}", message),
        }
    }
}
