use crate::apdu::Apdu;
use crate::error::EmvError;
use crate::event::CardEvent;
use crate::tlv::{self, CardData};
use crate::EmvConnection;
use log::{debug, trace};

/// One Application File Locator group: records `first_record..=last_record`
/// of the file identified by `sfi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AflEntry {
    pub sfi: u8,
    pub first_record: u8,
    pub last_record: u8,
}

impl AflEntry {
    pub fn is_valid(&self) -> bool {
        (1..=31).contains(&self.sfi)
            && self.first_record >= 1
            && self.last_record >= self.first_record
    }
}

/// Files and records tried when the card gives no usable AFL.
pub const COMMON_RECORD_LOCATIONS: [(u8, u8); 6] = [(1, 1), (2, 1), (3, 1), (4, 1), (1, 2), (2, 2)];

// AFL sourced records win over data parsed from the GPO response
const RECORD_PRIORITY: u8 = 1;

impl EmvConnection<'_> {
    fn read_record(
        &mut self,
        short_file_identifier: u8,
        record_index: u8,
    ) -> Result<Option<Vec<u8>>, EmvError> {
        let response =
            self.exchange_with_autofix(&Apdu::read_record(short_file_identifier, record_index))?;

        self.emit(CardEvent::RecordRead {
            sfi: short_file_identifier,
            record: record_index,
            status: response.status,
        });

        if response.is_success() {
            Ok(Some(response.data))
        } else {
            Ok(None)
        }
    }

    fn read_record_into(
        &mut self,
        short_file_identifier: u8,
        record_index: u8,
        card_data: &mut CardData,
    ) -> Result<bool, EmvError> {
        match self.read_record(short_file_identifier, record_index)? {
            Some(record) => {
                tlv::parse(
                    &record,
                    0,
                    record.len(),
                    card_data,
                    RECORD_PRIORITY,
                    self.events,
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Reads every record the AFL lists. Returns whether at least one record
    /// was read; individual record failures are not errors.
    pub fn read_afl_records(
        &mut self,
        entries: &[AflEntry],
        card_data: &mut CardData,
    ) -> Result<bool, EmvError> {
        debug!("Reading {} AFL entries", entries.len());

        let mut any_read = false;

        for entry in entries {
            for record_index in entry.first_record..=entry.last_record {
                if self.read_record_into(entry.sfi, record_index, card_data)? {
                    any_read = true;
                }
            }
        }

        Ok(any_read)
    }

    /// Tries [`COMMON_RECORD_LOCATIONS`] one by one.
    pub fn try_read_common_records(&mut self, card_data: &mut CardData) -> Result<bool, EmvError> {
        debug!("Attempting to read common records");

        let mut any_read = false;

        for (short_file_identifier, record_index) in COMMON_RECORD_LOCATIONS.iter().copied() {
            if self.read_record_into(short_file_identifier, record_index, card_data)? {
                any_read = true;
            } else {
                trace!(
                    "No record {} in SFI {}",
                    record_index,
                    short_file_identifier
                );
            }
        }

        Ok(any_read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NullSink;
    use crate::settings::Settings;
    use crate::test_util::ScriptedCard;

    fn record(sfi: u8, index: u8) -> Vec<u8> {
        Apdu::read_record(sfi, index).to_bytes()
    }

    #[test]
    fn test_afl_entry_validity() {
        let valid = AflEntry {
            sfi: 1,
            first_record: 1,
            last_record: 1,
        };
        assert!(valid.is_valid());
        assert!(!AflEntry { sfi: 0, ..valid }.is_valid());
        assert!(!AflEntry { sfi: 32, ..valid }.is_valid());
        assert!(!AflEntry {
            first_record: 2,
            ..valid
        }
        .is_valid());
        assert!(!AflEntry {
            first_record: 0,
            last_record: 0,
            ..valid
        }
        .is_valid());
    }

    #[test]
    fn test_afl_records_have_priority() {
        let mut card = ScriptedCard::new(vec![
            (
                record(1, 1),
                hex::decode("70045A0241119000").unwrap(),
            ),
            (record(2, 1), vec![0x6A, 0x83]),
            (
                record(2, 2),
                hex::decode("70055F2002414290 00".replace(' ', "")).unwrap(),
            ),
        ]);
        let mut card_data = CardData {
            pan: Some("9999".to_string()),
            ..CardData::default()
        };
        let entries = [
            AflEntry {
                sfi: 1,
                first_record: 1,
                last_record: 1,
            },
            AflEntry {
                sfi: 2,
                first_record: 1,
                last_record: 2,
            },
        ];

        {
            let mut connection =
                EmvConnection::new(&mut card, &NullSink, Settings::default()).unwrap();
            assert!(connection.read_afl_records(&entries, &mut card_data).unwrap());
        }

        assert_eq!(card_data.pan.as_deref(), Some("4111"));
        assert_eq!(card_data.cardholder_name.as_deref(), Some("AB"));
        assert_eq!(card.sent.len(), 3);
    }

    #[test]
    fn test_common_records_tries_all_locations() {
        let mut card = ScriptedCard::new(vec![(
            record(3, 1),
            hex::decode("70055F24022512 9000".replace(' ', "")).unwrap(),
        )]);
        let mut card_data = CardData::default();

        {
            let mut connection =
                EmvConnection::new(&mut card, &NullSink, Settings::default()).unwrap();
            assert!(connection.try_read_common_records(&mut card_data).unwrap());
        }

        assert_eq!(card_data.expiry.as_deref(), Some("2025-12"));
        assert_eq!(
            card.sent,
            COMMON_RECORD_LOCATIONS
                .iter()
                .map(|(sfi, index)| record(*sfi, *index))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_nothing_read() {
        let mut card = ScriptedCard::new(vec![]);
        let mut card_data = CardData::default();
        let mut connection = EmvConnection::new(&mut card, &NullSink, Settings::default()).unwrap();

        assert!(!connection.try_read_common_records(&mut card_data).unwrap());
        assert!(!connection.read_afl_records(&[], &mut card_data).unwrap());
        assert_eq!(card_data, CardData::default());
    }
}
