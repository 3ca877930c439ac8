use crate::CardReaderError;
use emvcard::{ApduInterface, TransportError};
use log::debug;
use serde::Deserialize;
use std::fs;

#[derive(Deserialize, Clone)]
struct ApduRequestResponse {
    req: String,
    res: String,
}

fn to_raw_vec(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(s.replace(' ', ""))
}

/// Replays a recorded `req`/`res` APDU trace. Commands missing from the trace
/// are answered with 6A82.
pub struct TraceCard {
    trace: Vec<(Vec<u8>, Vec<u8>)>,
}

impl TraceCard {
    pub fn load(trace_file: &str) -> Result<TraceCard, CardReaderError> {
        let entries: Vec<ApduRequestResponse> =
            serde_yaml::from_str(&fs::read_to_string(trace_file)?)?;

        let mut trace = Vec::with_capacity(entries.len());
        for entry in &entries {
            trace.push((
                to_raw_vec(&entry.req).map_err(|err| CardReaderError::Hex("trace", err))?,
                to_raw_vec(&entry.res).map_err(|err| CardReaderError::Hex("trace", err))?,
            ));
        }

        debug!("Loaded {} APDU pairs from {}", trace.len(), trace_file);

        Ok(TraceCard { trace })
    }
}

impl ApduInterface for TraceCard {
    fn send_apdu(&mut self, apdu: &[u8]) -> Result<Vec<u8>, TransportError> {
        Ok(self
            .trace
            .iter()
            .find(|(request, _)| &request[..] == apdu)
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| b"\x6A\x82".to_vec())) // file not found error
    }
}

#[cfg(feature = "pcsc")]
pub use self::reader::PcscCard;

#[cfg(feature = "pcsc")]
mod reader {
    use crate::CardReaderError;
    use emvcard::{ApduInterface, TransportError};
    use hexplay::HexViewBuilder;
    use log::info;
    use pcsc::{Card, Context, Error, Protocols, Scope, ShareMode, MAX_ATR_SIZE, MAX_BUFFER_SIZE};

    pub struct PcscCard {
        card: Card,
        pub reader_name: String,
    }

    impl PcscCard {
        /// Connects to the card in the first reader PC/SC lists.
        pub fn connect_first_reader() -> Result<PcscCard, CardReaderError> {
            let context = Context::establish(Scope::User)?;

            let readers = context.list_readers_owned()?;
            let reader = readers.first().ok_or(CardReaderError::NoReader)?;

            let card = match context.connect(reader, ShareMode::Shared, Protocols::ANY) {
                Ok(card) => card,
                Err(Error::NoSmartcard) => return Err(CardReaderError::NoCard),
                Err(err) => return Err(err.into()),
            };

            let mut names_buffer = [0; 2048];
            let mut atr_buffer = [0; MAX_ATR_SIZE];
            let card_status = card.status2(&mut names_buffer, &mut atr_buffer)?;

            // https://www.eftlab.com/knowledge-base/171-atr-list-full/
            info!("Card reader: {:?}", reader);
            info!("Card ATR:\n{}", HexViewBuilder::new(card_status.atr()).finish());

            Ok(PcscCard {
                card,
                reader_name: reader.to_string_lossy().into_owned(),
            })
        }
    }

    impl ApduInterface for PcscCard {
        fn send_apdu(&mut self, apdu: &[u8]) -> Result<Vec<u8>, TransportError> {
            let mut apdu_response_buffer = [0; MAX_BUFFER_SIZE];

            match self.card.transmit(apdu, &mut apdu_response_buffer) {
                Ok(response) => Ok(response.to_vec()),
                Err(Error::NoSmartcard) | Err(Error::RemovedCard) => {
                    Err(TransportError::NotConnected)
                }
                Err(err) => Err(TransportError::Io(err.to_string())),
            }
        }
    }
}
