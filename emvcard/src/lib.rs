//! Card-side EMV reading: application selection, GET PROCESSING OPTIONS,
//! record reading with fail-safe BER-TLV decoding and ICC public key recovery.

pub mod apdu;
pub mod bcdutil;
pub mod error;
pub mod event;
pub mod gpo;
pub mod icc;
pub mod records;
pub mod selector;
pub mod settings;
pub mod tlv;
pub mod transaction;

#[cfg(test)]
mod test_util;

pub use apdu::{Apdu, ApduInterface, ApduResponse, StatusWord};
pub use error::{EmvError, TransportError};
pub use event::{CardEvent, EventSink, LogSink, NullSink};
pub use settings::{CertificatePolicy, Settings};
pub use tlv::{CardData, CardField};
pub use transaction::{CardRecord, ReadOptions, TransactionStatus};

use settings::Constants;

// PCI SSC PAN truncation rules ref. https://d30000001huxdea4.my.salesforce-sites.com/faq/articles/Frequently_Asked_Question/What-are-acceptable-formats-for-truncation-of-primary-account-numbers
pub fn get_truncated_pan(pan: &str) -> String {
    let uncensored_bin_prefix_length = if pan.len() > 15 { 8 } else { 6 };
    let uncensored_suffix_start = pan.len().saturating_sub(4);

    pan.chars()
        .enumerate()
        .map(|(i, c)| {
            if i >= uncensored_bin_prefix_length && i < uncensored_suffix_start {
                '*'
            } else {
                c
            }
        })
        .collect()
}

/// Uppercase hex pairs separated by single spaces, e.g. `9F 46 01`.
pub(crate) fn spaced_hex(data: &[u8]) -> String {
    data.iter()
        .map(|byte| format!("{:02X}", byte))
        .collect::<Vec<String>>()
        .join(" ")
}

/// One reading session over an open card channel. The connection borrows the
/// transport and the event sink for its lifetime and is not shared between
/// threads.
pub struct EmvConnection<'a> {
    interface: &'a mut dyn ApduInterface,
    events: &'a dyn EventSink,
    constants: Constants,
    pub settings: Settings,
}

impl<'a> EmvConnection<'a> {
    pub fn new(
        interface: &'a mut dyn ApduInterface,
        events: &'a dyn EventSink,
        settings: Settings,
    ) -> Result<EmvConnection<'a>, EmvError> {
        let constants = settings.load_constants()?;

        Ok(EmvConnection {
            interface,
            events,
            constants,
            settings,
        })
    }

    pub fn emit(&self, event: CardEvent) {
        self.events.emit(event);
    }

    pub fn events(&self) -> &'a dyn EventSink {
        self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pan_truncation() {
        assert_eq!(get_truncated_pan("0000000000000000"), "00000000****0000");
        assert_eq!(get_truncated_pan("000000000000000"), "000000*****0000");
        assert_eq!(get_truncated_pan("00000000000000"), "000000****0000");
        assert_eq!(get_truncated_pan("123"), "123");
    }

    #[test]
    fn test_spaced_hex() {
        assert_eq!(spaced_hex(&[0x9F, 0x46, 0x01]), "9F 46 01");
        assert_eq!(spaced_hex(&[]), "");
    }
}
