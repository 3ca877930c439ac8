use crate::error::EmvError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;

static DEFAULT_SETTINGS: &str = include_str!("../config/settings.yaml");
static DEFAULT_CONSTANTS: &str = include_str!("../config/constants.yaml");

// Configuration files are optional on disk, the compiled-in copy is used when missing.
macro_rules! serialize_yaml {
    ($file:expr, $static_resource:expr) => {
        serde_yaml::from_str(
            &fs::read_to_string($file).unwrap_or_else(|_| String::from($static_resource)),
        )
    };
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConfigurationFiles {
    pub constants: String,
}

/// Values written into the PDOL answer of GET PROCESSING OPTIONS.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Terminal {
    pub use_random: bool,
    #[serde(with = "hex::serde")]
    pub terminal_transaction_qualifiers: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub amount_authorised: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub terminal_country_code: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub transaction_currency_code: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub transaction_type: Vec<u8>,
}

/// How strictly the recovered ICC certificate is judged. All off keeps the
/// lenient behaviour: anomalies are reported but the key is still returned.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CertificatePolicy {
    #[serde(default)]
    pub require_valid_hash: bool,
    #[serde(default)]
    pub require_valid_trailer: bool,
    #[serde(default)]
    pub reject_expired: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Settings {
    pub censor_sensitive_fields: bool,
    pub configuration_files: ConfigurationFiles,
    pub terminal: Terminal,
    #[serde(default)]
    pub certificate_policy: CertificatePolicy,
}

impl Settings {
    pub fn load(settings_file: &str) -> Result<Settings, EmvError> {
        Ok(serialize_yaml!(settings_file, DEFAULT_SETTINGS)?)
    }

    pub fn load_constants(&self) -> Result<Constants, EmvError> {
        Ok(serialize_yaml!(
            &self.configuration_files.constants,
            DEFAULT_CONSTANTS
        )?)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            censor_sensitive_fields: false,
            configuration_files: ConfigurationFiles {
                constants: "config/constants.yaml".to_string(),
            },
            terminal: Terminal {
                use_random: true,
                terminal_transaction_qualifiers: vec![0x37, 0x00, 0x00, 0x00],
                amount_authorised: vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x01],
                terminal_country_code: vec![0x01, 0x56],
                transaction_currency_code: vec![0x01, 0x56],
                transaction_type: vec![0x00],
            },
            certificate_policy: CertificatePolicy::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Constants {
    pub apdu_status_codes: HashMap<String, String>,
}

impl Constants {
    /// Falls back to the SW1 family entry (e.g. "61") when the exact word is unknown.
    pub fn describe_status(&self, status: &[u8; 2]) -> String {
        let response_status_code = hex::encode_upper(status);

        if let Some(description) = self
            .apdu_status_codes
            .get(&response_status_code)
            .or_else(|| self.apdu_status_codes.get(&response_status_code[0..2]))
        {
            format!("{} - {}", response_status_code, description)
        } else {
            response_status_code
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compiled_in_settings() {
        let settings = Settings::load("does/not/exist.yaml").unwrap();
        let defaults = Settings::default();

        assert_eq!(settings.terminal, defaults.terminal);
        assert_eq!(settings.certificate_policy, CertificatePolicy::default());
        assert!(!settings.censor_sensitive_fields);
    }

    #[test]
    fn test_status_description() {
        let constants = Settings::default().load_constants().unwrap();

        assert_eq!(
            constants.describe_status(&[0x6A, 0x83]),
            "6A83 - Record not found"
        );
        assert_eq!(
            constants.describe_status(&[0x61, 0x10]),
            "6110 - Response bytes still available"
        );
        assert_eq!(constants.describe_status(&[0x12, 0x34]), "1234");
    }
}
