//! ICC public key retrieval, EMV Book 2, 6.4 Retrieval of ICC Public Key.
//!
//! The certificate is recovered with textbook RSA using the issuer public key
//! and read with the Table 14 layout:
//!
//! | offset        | field                                  |
//! |---------------|----------------------------------------|
//! | 0             | recovered data header `6A`             |
//! | 1             | certificate format `04`                |
//! | 2..12         | application PAN, BCD padded with `F`   |
//! | 12..14        | certificate expiration date MMYY       |
//! | 14..17        | certificate serial number              |
//! | 17            | hash algorithm indicator               |
//! | 18            | ICC public key algorithm indicator     |
//! | 19            | ICC public key length                  |
//! | 20            | ICC public key exponent length         |
//! | 21..N-21      | ICC public key, leftmost N-42 bytes    |
//! | N-21..N-1     | hash result                            |
//! | N-1           | recovered data trailer `BC`            |

use crate::bcdutil;
use crate::error::EmvError;
use crate::event::{CardEvent, EventSink};
use crate::get_truncated_pan;
use crate::settings::CertificatePolicy;
use crate::spaced_hex;
use crate::tlv::CardData;
use crate::EmvConnection;
use chrono::{Months, NaiveDate, Utc};
use hexplay::HexViewBuilder;
use log::{debug, trace};
use openssl::bn::{BigNum, BigNumContext};
use openssl::hash::{hash, MessageDigest};
use serde::{Deserialize, Serialize};

const RECOVERED_DATA_HEADER: u8 = 0x6A;
const RECOVERED_DATA_TRAILER: u8 = 0xBC;
const ICC_CERTIFICATE_FORMAT: u8 = 0x04;

const HASH_LENGTH: usize = 20;
// header, format, PAN .. exponent length, hash and trailer
const CERTIFICATE_OVERHEAD: usize = 42;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EmvPublicKey {
    #[serde(with = "hex::serde")]
    pub modulus: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub exponent: Vec<u8>,
}

impl EmvPublicKey {
    pub fn new(modulus: &[u8], exponent: &[u8]) -> EmvPublicKey {
        EmvPublicKey {
            modulus: modulus.to_vec(),
            exponent: exponent.to_vec(),
        }
    }

    pub fn get_key_byte_size(&self) -> usize {
        self.modulus.len()
    }

    /// `data ^ exponent mod modulus` without any padding scheme, left padded
    /// with zeros to the modulus length.
    pub fn raw_decrypt(&self, data: &[u8]) -> Result<Vec<u8>, EmvError> {
        let modulus = BigNum::from_slice(&self.modulus)?;
        let exponent = BigNum::from_slice(&self.exponent)?;
        let cipher = BigNum::from_slice(data)?;

        let mut context = BigNumContext::new()?;
        let mut plain = BigNum::new()?;
        plain.mod_exp(&cipher, &exponent, &modulus, &mut context)?;

        Ok(plain.to_vec_padded(self.modulus.len() as i32)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    /// Unknown indicators fall back to SHA-1, `false` in the second slot
    /// signals the fallback.
    pub fn from_indicator(indicator: u8) -> (HashAlgorithm, bool) {
        match indicator {
            0x01 => (HashAlgorithm::Sha1, true),
            0x02 => (HashAlgorithm::Sha256, true),
            _ => (HashAlgorithm::Sha1, false),
        }
    }

    fn digest(&self, data: &[u8]) -> Result<Vec<u8>, EmvError> {
        let message_digest = match self {
            HashAlgorithm::Sha1 => MessageDigest::sha1(),
            HashAlgorithm::Sha256 => MessageDigest::sha256(),
        };

        Ok(hash(message_digest, data)?.to_vec())
    }
}

/// Decrypted ICC certificate split into its fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredCertificate {
    pub format: u8,
    pub pan: Vec<u8>,
    pub expiry: Vec<u8>,
    pub serial: Vec<u8>,
    pub hash_algorithm: u8,
    pub key_algorithm: u8,
    pub icc_key_length: usize,
    pub icc_exponent_length: usize,
    pub modulus_field: Vec<u8>,
    pub hash: Vec<u8>,
    pub trailer: u8,
    signed_data: Vec<u8>,
}

impl RecoveredCertificate {
    /// `None` when the data is shorter than the fixed fields or the header
    /// byte is wrong, meaning the wrong issuer key was used.
    pub fn parse(data: &[u8]) -> Option<RecoveredCertificate> {
        let length = data.len();

        if length < CERTIFICATE_OVERHEAD || data[0] != RECOVERED_DATA_HEADER {
            return None;
        }

        let hash_position = length - HASH_LENGTH - 1;

        Some(RecoveredCertificate {
            format: data[1],
            pan: data[2..12].to_vec(),
            expiry: data[12..14].to_vec(),
            serial: data[14..17].to_vec(),
            hash_algorithm: data[17],
            key_algorithm: data[18],
            icc_key_length: data[19] as usize,
            icc_exponent_length: data[20] as usize,
            modulus_field: data[21..hash_position].to_vec(),
            hash: data[hash_position..length - 1].to_vec(),
            trailer: data[length - 1],
            signed_data: data[1..hash_position].to_vec(),
        })
    }

    /// Full ICC modulus from the certificate field and the remainder, `None`
    /// when the remainder is too short.
    pub fn assemble_modulus(&self, remainder: &[u8]) -> Option<Vec<u8>> {
        let available = self.modulus_field.len();

        if self.icc_key_length <= available {
            return Some(self.modulus_field[..self.icc_key_length].to_vec());
        }

        let missing = self.icc_key_length - available;
        if remainder.len() < missing {
            return None;
        }

        let mut modulus = self.modulus_field.clone();
        modulus.extend_from_slice(&remainder[..missing]);
        Some(modulus)
    }

    /// Certificate PAN digits without the `F` padding.
    pub fn pan_digits(&self) -> Option<String> {
        bcdutil::bcd_to_ascii(&self.pan).ok()
    }
}

/// Expired once `today` reaches the first day of the month after MMYY.
/// `None` for dates that are not valid BCD months.
pub fn is_certificate_expired(date_bcd: &[u8], today: NaiveDate) -> Option<bool> {
    let date = bcdutil::bcd_to_ascii(date_bcd).ok()?;
    if date.len() != 4 {
        return None;
    }

    let month: u32 = date[0..2].parse().ok()?;
    let year: i32 = date[2..4].parse().ok()?;

    let end_of_validity = NaiveDate::from_ymd_opt(2000 + year, month, 1)?
        .checked_add_months(Months::new(1))?;

    Some(today >= end_of_validity)
}

/// The card's key certificate components, raw bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IccKeyMaterial {
    pub certificate: Vec<u8>,
    pub exponent: Vec<u8>,
    pub remainder: Vec<u8>,
}

impl IccKeyMaterial {
    /// `None` unless both certificate and exponent were read from the card.
    pub fn from_card_data(card_data: &CardData) -> Option<IccKeyMaterial> {
        if card_data.icc_certificate.is_empty() || card_data.icc_exponent.is_empty() {
            return None;
        }

        Some(IccKeyMaterial {
            certificate: card_data.icc_certificate.clone(),
            exponent: card_data.icc_exponent.clone(),
            remainder: card_data.icc_remainder.clone(),
        })
    }

    /// Splits the combined `Cert:`/`Exp:`/`Rem:` text back into components.
    /// A line without a prefix is taken as the certificate.
    pub fn from_certificate_text(text: &str) -> Result<IccKeyMaterial, EmvError> {
        let mut material = IccKeyMaterial::default();

        for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let (slot, value) = if let Some(value) = line.strip_prefix("Cert:") {
                (&mut material.certificate, value)
            } else if let Some(value) = line.strip_prefix("Exp:") {
                (&mut material.exponent, value)
            } else if let Some(value) = line.strip_prefix("Rem:") {
                (&mut material.remainder, value)
            } else {
                (&mut material.certificate, line)
            };

            let value: String = value.chars().filter(|c| !c.is_whitespace()).collect();
            *slot = hex::decode(value)?;
        }

        Ok(material)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct IccKeyRecovery {
    pub key: EmvPublicKey,
    pub hash_verified: bool,
    pub trailer_valid: bool,
    /// `None` when no card PAN was given to compare with.
    pub pan_matches: Option<bool>,
    pub expired: Option<bool>,
}

fn policy_violation(
    events: &dyn EventSink,
    strict: bool,
    message: String,
) -> Result<(), EmvError> {
    if strict {
        return Err(EmvError::Certificate(message));
    }

    events.emit(CardEvent::Warning(message));
    Ok(())
}

/// Recovers the ICC public key from the certificate material.
///
/// `Ok(None)` is returned when the certificate cannot belong to the issuer
/// key or the remainder is too short to complete the modulus. Hash, trailer
/// and expiry anomalies are reported as warnings unless `policy` makes them
/// fatal.
pub fn recover_icc_public_key(
    issuer_key: &EmvPublicKey,
    material: &IccKeyMaterial,
    static_data: &[u8],
    card_pan: Option<&str>,
    policy: CertificatePolicy,
    events: &dyn EventSink,
) -> Result<Option<IccKeyRecovery>, EmvError> {
    if issuer_key.modulus.is_empty() || issuer_key.exponent.is_empty() {
        return Err(EmvError::InvalidArgument("issuer public key"));
    }
    if material.certificate.is_empty() {
        return Err(EmvError::InvalidArgument("ICC public key certificate"));
    }
    if material.exponent.is_empty() {
        return Err(EmvError::InvalidArgument("ICC public key exponent"));
    }

    debug!(
        "Retrieving ICC public key {:02X?}",
        &material.certificate[..material.certificate.len().min(2)]
    );

    if material.certificate.len() != issuer_key.get_key_byte_size() {
        events.emit(CardEvent::Warning(format!(
            "ICC certificate length {} differs from issuer key length {}",
            material.certificate.len(),
            issuer_key.get_key_byte_size()
        )));
    }

    let recovered = issuer_key.raw_decrypt(&material.certificate)?;
    trace!(
        "Recovered ICC certificate ({} bytes):\n{}",
        recovered.len(),
        HexViewBuilder::new(&recovered).finish()
    );

    let certificate = match RecoveredCertificate::parse(&recovered) {
        Some(certificate) => certificate,
        None => {
            events.emit(CardEvent::Warning(format!(
                "Recovered data header incorrect {:02X?}",
                recovered.first()
            )));
            return Ok(None);
        }
    };

    if certificate.format != ICC_CERTIFICATE_FORMAT {
        events.emit(CardEvent::Warning(format!(
            "Incorrect ICC certificate type {:02X}",
            certificate.format
        )));
    }

    debug!("ICC expiry:{:02X?}", certificate.expiry);
    debug!("ICC serial:{:02X?}", certificate.serial);
    debug!("ICC hash algo:{:02X}", certificate.hash_algorithm);
    debug!("ICC pk algo:{:02X}", certificate.key_algorithm);
    debug!("ICC pk length:{}", certificate.icc_key_length);
    debug!("ICC pk exp length:{}", certificate.icc_exponent_length);

    let (hash_algorithm, known) = HashAlgorithm::from_indicator(certificate.hash_algorithm);
    if !known {
        events.emit(CardEvent::Warning(format!(
            "Unknown hash algorithm {:02X}, using SHA-1",
            certificate.hash_algorithm
        )));
    }

    let modulus = match certificate.assemble_modulus(&material.remainder) {
        Some(modulus) => modulus,
        None => {
            events.emit(CardEvent::Warning(format!(
                "ICC public key remainder too short: {} bytes for key length {}",
                material.remainder.len(),
                certificate.icc_key_length
            )));
            return Ok(None);
        }
    };

    if certificate.icc_exponent_length != material.exponent.len() {
        events.emit(CardEvent::Warning(format!(
            "ICC exponent length {} differs from certificate {}",
            material.exponent.len(),
            certificate.icc_exponent_length
        )));
    }

    let mut checksum_data: Vec<u8> = Vec::new();
    checksum_data.extend_from_slice(&certificate.signed_data);
    checksum_data.extend_from_slice(&material.remainder);
    checksum_data.extend_from_slice(&material.exponent);
    checksum_data.extend_from_slice(static_data);

    let checksum = hash_algorithm.digest(&checksum_data)?;
    trace!("Calculated checksum: {:02X?}", checksum);
    trace!("Stored ICC checksum: {:02X?}", certificate.hash);

    let hash_verified = checksum[..HASH_LENGTH] == certificate.hash[..];
    if !hash_verified {
        policy_violation(
            events,
            policy.require_valid_hash,
            "ICC certificate hash mismatch".to_string(),
        )?;
    }

    let trailer_valid = certificate.trailer == RECOVERED_DATA_TRAILER;
    if !trailer_valid {
        policy_violation(
            events,
            policy.require_valid_trailer,
            format!("Data trailer incorrect {:02X}", certificate.trailer),
        )?;
    }

    let pan_matches = card_pan.map(|pan| match certificate.pan_digits() {
        Some(certificate_pan) => !certificate_pan.is_empty() && pan.starts_with(&certificate_pan),
        None => false,
    });
    if pan_matches == Some(false) {
        events.emit(CardEvent::Warning(format!(
            "PAN mismatch! Cert PAN: {}",
            certificate
                .pan_digits()
                .map(|pan| get_truncated_pan(&pan))
                .unwrap_or_else(|| spaced_hex(&certificate.pan))
        )));
    }

    let expired = is_certificate_expired(&certificate.expiry, Utc::now().date_naive());
    match expired {
        Some(true) => policy_violation(
            events,
            policy.reject_expired,
            format!(
                "ICC certificate expired (MMYY {:02X?})",
                certificate.expiry
            ),
        )?,
        None => events.emit(CardEvent::Warning(format!(
            "ICC certificate expiry unreadable {:02X?}",
            certificate.expiry
        ))),
        Some(false) => (),
    }

    trace!(
        "ICC PK modulus ({} bytes):\n{}",
        modulus.len(),
        HexViewBuilder::new(&modulus).finish()
    );

    Ok(Some(IccKeyRecovery {
        key: EmvPublicKey::new(&modulus, &material.exponent),
        hash_verified,
        trailer_valid,
        pan_matches,
        expired,
    }))
}

/// Stable per card identifier: SHA-256 of the raw certificate bytes.
pub fn derive_token(certificate: &[u8]) -> Result<String, EmvError> {
    let digest = hash(MessageDigest::sha256(), certificate)?;
    Ok(spaced_hex(&digest))
}

/// Token from the combined certificate text, `None` when it holds no
/// certificate.
pub fn derive_token_from_text(text: &str) -> Result<Option<String>, EmvError> {
    let material = IccKeyMaterial::from_certificate_text(text)?;

    if material.certificate.is_empty() {
        return Ok(None);
    }

    derive_token(&material.certificate).map(Some)
}

impl EmvConnection<'_> {
    /// Recovers the ICC key from what was read into `card_data`, using the
    /// certificate policy of the connection settings.
    pub fn recover_icc_public_key(
        &self,
        issuer_key: &EmvPublicKey,
        card_data: &CardData,
        static_data: &[u8],
    ) -> Result<Option<IccKeyRecovery>, EmvError> {
        let material = match IccKeyMaterial::from_card_data(card_data) {
            Some(material) => material,
            None => {
                self.emit(CardEvent::Info(
                    "No ICC public key certificate read".to_string(),
                ));
                return Ok(None);
            }
        };

        recover_icc_public_key(
            issuer_key,
            &material,
            static_data,
            card_data.pan.as_deref(),
            self.settings.certificate_policy,
            self.events(),
        )
    }
}
