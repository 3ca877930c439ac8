use crate::apdu::ApduInterface;
use crate::error::TransportError;
use log::LevelFilter;
use log4rs::{
    append::console::ConsoleAppender,
    config::{Appender, Root},
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Once;

static LOGGING: Once = Once::new();

pub fn init_logging() {
    LOGGING.call_once(|| {
        let stdout: ConsoleAppender = ConsoleAppender::builder().build();
        let config = log4rs::config::Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .build(Root::builder().appender("stdout").build(LevelFilter::Trace))
            .unwrap();
        log4rs::init_config(config).unwrap();
    });
}

#[derive(Serialize, Deserialize, Clone)]
struct ApduRequestResponse {
    req: String,
    res: String,
}

impl ApduRequestResponse {
    fn to_raw_vec(s: &str) -> Vec<u8> {
        hex::decode(s.replace(' ', "")).unwrap()
    }
}

/// Card double answering from a fixed command to response table. Unknown
/// commands get 6A82 and every command sent is kept for inspection.
pub struct ScriptedCard {
    script: Vec<(Vec<u8>, Vec<u8>)>,
    pub sent: Vec<Vec<u8>>,
    connected: bool,
}

impl ScriptedCard {
    pub fn new(script: Vec<(Vec<u8>, Vec<u8>)>) -> ScriptedCard {
        ScriptedCard {
            script,
            sent: Vec::new(),
            connected: true,
        }
    }

    pub fn disconnected() -> ScriptedCard {
        ScriptedCard {
            connected: false,
            ..ScriptedCard::new(Vec::new())
        }
    }

    /// Loads a `req`/`res` hex trace in the format the card reader records.
    pub fn from_yaml(test_data_file: &str) -> ScriptedCard {
        let test_data: Vec<ApduRequestResponse> =
            serde_yaml::from_str(&fs::read_to_string(test_data_file).unwrap()).unwrap();

        ScriptedCard::new(
            test_data
                .iter()
                .map(|data| {
                    (
                        ApduRequestResponse::to_raw_vec(&data.req),
                        ApduRequestResponse::to_raw_vec(&data.res),
                    )
                })
                .collect(),
        )
    }
}

impl ApduInterface for ScriptedCard {
    fn send_apdu(&mut self, apdu: &[u8]) -> Result<Vec<u8>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        self.sent.push(apdu.to_vec());

        let response = self
            .script
            .iter()
            .find(|(request, _)| &request[..] == apdu)
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| b"\x6A\x82".to_vec()); // file not found error

        Ok(response)
    }
}
