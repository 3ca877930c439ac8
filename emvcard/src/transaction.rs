//! One complete card read: directory, selection, processing options and
//! records, and the record handed to storage or display.

use crate::error::EmvError;
use crate::event::CardEvent;
use crate::icc::{derive_token, EmvPublicKey};
use crate::selector::preferred_application;
use crate::tlv::{self, CardData};
use crate::EmvConnection;
use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use std::time::{Duration, Instant};
use uuid::Uuid;

// GPO response data only fills fields the records leave empty
const GPO_RESPONSE_PRIORITY: u8 = 0;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub contactless: bool,
    /// Skips the directory and selects this AID directly.
    pub aid: Option<Vec<u8>>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Success,
    Failed,
}

#[derive(Serialize, Debug, Clone)]
pub struct CardRecord {
    pub transaction_id: String,
    pub timestamp: String,
    pub reader_name: String,
    pub pan: String,
    pub expiry_date: String,
    pub cardholder_name: String,
    pub icc_certificate: String,
    pub track2_data: String,
    pub status: TransactionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub processing_time_ms: u64,
    pub token: Option<String>,
    pub icc_public_key: Option<EmvPublicKey>,
}

fn text(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

impl CardRecord {
    fn new(reader_name: &str, status: TransactionStatus) -> CardRecord {
        CardRecord {
            transaction_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            reader_name: reader_name.to_string(),
            pan: String::new(),
            expiry_date: String::new(),
            cardholder_name: String::new(),
            icc_certificate: String::new(),
            track2_data: String::new(),
            status,
            error_message: None,
            processing_time_ms: 0,
            token: None,
            icc_public_key: None,
        }
    }

    pub fn from_card_data(card_data: &CardData, reader_name: &str) -> CardRecord {
        CardRecord {
            pan: text(&card_data.pan),
            expiry_date: text(&card_data.expiry),
            cardholder_name: text(&card_data.cardholder_name),
            icc_certificate: text(&card_data.icc_certificate_text),
            track2_data: text(&card_data.track2),
            ..CardRecord::new(reader_name, TransactionStatus::Success)
        }
    }

    pub fn failed(reader_name: &str, error_message: &str) -> CardRecord {
        CardRecord {
            error_message: Some(error_message.to_string()),
            ..CardRecord::new(reader_name, TransactionStatus::Failed)
        }
    }

    pub fn with_processing_time(mut self, processing_time: Duration) -> CardRecord {
        self.processing_time_ms = processing_time.as_millis() as u64;
        self
    }

    /// One line overview. The PAN is shown in full.
    pub fn summary(&self) -> String {
        format!("{} - {:?} - PAN: {}", self.timestamp, self.status, self.pan)
    }
}

impl EmvConnection<'_> {
    fn choose_application(&mut self, options: &ReadOptions) -> Result<Vec<u8>, EmvError> {
        if let Some(aid) = &options.aid {
            return Ok(aid.clone());
        }

        let applications = if options.contactless {
            self.load_contactless_directory()?
        } else {
            self.load_contact_directory()?
        };

        let application =
            preferred_application(&applications).ok_or(EmvError::NoApplication)?;
        info!("Preferred application: {}", application.display_name());

        Ok(application.aid.clone())
    }

    /// Reads the payment data of one card. GPO failures and missing AFL fall
    /// back to probing the common record locations; PAN and expiry missing
    /// from the records are taken from Track-2.
    pub fn read_card(&mut self, options: &ReadOptions) -> Result<CardData, EmvError> {
        let aid = self.choose_application(options)?;
        let fci = self.select_application(&aid)?;

        let mut card_data = CardData::default();

        let records_read = match self.send_gpo(&fci) {
            Ok(response) => {
                tlv::parse(
                    &response,
                    0,
                    response.len(),
                    &mut card_data,
                    GPO_RESPONSE_PRIORITY,
                    self.events(),
                );

                let afl = tlv::parse_afl(&response);
                if afl.is_empty() {
                    self.emit(CardEvent::Info(
                        "No AFL in GPO response, trying common records".to_string(),
                    ));
                    false
                } else {
                    self.read_afl_records(&afl, &mut card_data)?
                }
            }
            Err(err) if err.is_transport() => return Err(err),
            Err(err) => {
                self.emit(CardEvent::Warning(format!(
                    "GPO failed: {}, trying common records",
                    err
                )));
                false
            }
        };

        if !records_read {
            self.try_read_common_records(&mut card_data)?;
        }

        tlv::extract_from_track2(&mut card_data, self.events());

        Ok(card_data)
    }

    /// [`read_card`](Self::read_card) turned into a [`CardRecord`], with the
    /// certificate token and, given the issuer key, the recovered ICC key.
    /// Failures end up in the record instead of an error.
    pub fn read_card_record(
        &mut self,
        options: &ReadOptions,
        reader_name: &str,
        issuer_key: Option<&EmvPublicKey>,
    ) -> CardRecord {
        let started = Instant::now();

        let record = match self.read_card(options) {
            Ok(card_data) => self.card_record(&card_data, reader_name, issuer_key),
            Err(err) => {
                warn!("Card read failed: {}", err);
                CardRecord::failed(reader_name, &err.to_string())
            }
        };

        let record = record.with_processing_time(started.elapsed());
        debug!("{}", record.summary());

        record
    }

    fn card_record(
        &self,
        card_data: &CardData,
        reader_name: &str,
        issuer_key: Option<&EmvPublicKey>,
    ) -> CardRecord {
        let mut record = CardRecord::from_card_data(card_data, reader_name);

        if !card_data.icc_certificate.is_empty() {
            match derive_token(&card_data.icc_certificate) {
                Ok(token) => record.token = Some(token),
                Err(err) => self.emit(CardEvent::Warning(format!(
                    "Could not derive token: {}",
                    err
                ))),
            }
        }

        if let Some(issuer_key) = issuer_key {
            match self.recover_icc_public_key(issuer_key, card_data, &[]) {
                Ok(recovery) => record.icc_public_key = recovery.map(|recovery| recovery.key),
                Err(err) => {
                    record.status = TransactionStatus::Failed;
                    record.error_message = Some(err.to_string());
                }
            }
        }

        record
    }
}
