use crate::apdu::StatusWord;
use thiserror::Error;

/// Failures of the raw byte exchange with the card session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("card session is not connected")]
    NotConnected,

    #[error("card I/O failure: {0}")]
    Io(String),

    #[error("response of {0} bytes carries no status word")]
    ShortResponse(usize),
}

#[derive(Debug, Error)]
pub enum EmvError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Card answered with something other than 90 00 after length correction.
    #[error("card returned status {0}")]
    Status(StatusWord),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("no payment application available")]
    NoApplication,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Raised only when the certificate policy is strict.
    #[error("certificate rejected: {0}")]
    Certificate(String),

    #[error(transparent)]
    Crypto(#[from] openssl::error::ErrorStack),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    Bcd(#[from] crate::bcdutil::BcdError),
}

impl EmvError {
    /// Transport failures end the session, everything else is a failed step.
    pub fn is_transport(&self) -> bool {
        matches!(self, EmvError::Transport(_))
    }
}
