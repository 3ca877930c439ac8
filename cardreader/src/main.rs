use clap::Parser;
use emvcard::icc::EmvPublicKey;
use emvcard::{
    ApduInterface, EmvConnection, EmvError, LogSink, ReadOptions, Settings, TransactionStatus,
};
use log::{error, info, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use std::path::{Path, PathBuf};
use thiserror::Error;

mod transport;

use transport::TraceCard;

#[derive(Debug, Error)]
pub enum CardReaderError {
    #[error(transparent)]
    Emv(#[from] EmvError),

    #[error("invalid hex in {0}: {1}")]
    Hex(&'static str, hex::FromHexError),

    #[error("could not initialise logging: {0}")]
    Logging(String),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[cfg(feature = "pcsc")]
    #[error("PC/SC failure: {0}")]
    Pcsc(#[from] pcsc::Error),

    #[cfg(feature = "pcsc")]
    #[error("no readers are connected")]
    NoReader,

    #[cfg(feature = "pcsc")]
    #[error("no card found in the reader")]
    NoCard,

    #[error("no card source, give --trace or build with the pcsc feature")]
    NoCardSource,
}

#[derive(Parser)]
#[command(version, about = "Reads the payment data of an EMV card")]
struct Cli {
    /// Settings file, the built-in defaults are used when missing
    #[arg(long, default_value = "config/settings.yaml")]
    settings: String,

    /// log4rs configuration file, console logging at info level when missing
    #[arg(long, default_value = "config/log4rs.yaml")]
    log_config: PathBuf,

    /// Use the proximity directory (2PAY.SYS.DDF01)
    #[arg(long)]
    contactless: bool,

    /// Select this AID (hex) instead of reading the directory
    #[arg(long)]
    aid: Option<String>,

    /// Replay an APDU trace file instead of talking to a reader
    #[arg(long)]
    trace: Option<String>,

    /// Issuer public key modulus (hex), enables ICC public key recovery
    #[arg(long)]
    issuer_modulus: Option<String>,

    /// Issuer public key exponent (hex)
    #[arg(long, default_value = "03")]
    issuer_exponent: String,
}

fn init_logging(log_config: &Path) -> Result<(), CardReaderError> {
    if log_config.exists() {
        return log4rs::init_file(log_config, Default::default())
            .map_err(|err| CardReaderError::Logging(err.to_string()));
    }

    let stdout: ConsoleAppender = ConsoleAppender::builder().build();
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info))
        .map_err(|err| CardReaderError::Logging(err.to_string()))?;
    log4rs::init_config(config).map_err(|err| CardReaderError::Logging(err.to_string()))?;

    Ok(())
}

fn decode_hex(name: &'static str, value: &str) -> Result<Vec<u8>, CardReaderError> {
    hex::decode(value.replace(' ', "")).map_err(|err| CardReaderError::Hex(name, err))
}

#[cfg(feature = "pcsc")]
fn open_card_reader() -> Result<(Box<dyn ApduInterface>, String), CardReaderError> {
    let card = transport::PcscCard::connect_first_reader()?;
    let reader_name = card.reader_name.clone();
    Ok((Box::new(card), reader_name))
}

#[cfg(not(feature = "pcsc"))]
fn open_card_reader() -> Result<(Box<dyn ApduInterface>, String), CardReaderError> {
    Err(CardReaderError::NoCardSource)
}

fn run() -> Result<TransactionStatus, CardReaderError> {
    let cli = Cli::parse();

    init_logging(&cli.log_config)?;

    let settings = Settings::load(&cli.settings)?;
    let events = LogSink::new(settings.censor_sensitive_fields);

    let options = ReadOptions {
        contactless: cli.contactless,
        aid: match &cli.aid {
            Some(aid) => Some(decode_hex("--aid", aid)?),
            None => None,
        },
    };

    let issuer_key = match &cli.issuer_modulus {
        Some(modulus) => Some(EmvPublicKey::new(
            &decode_hex("--issuer-modulus", modulus)?,
            &decode_hex("--issuer-exponent", &cli.issuer_exponent)?,
        )),
        None => None,
    };

    let (mut card, reader_name): (Box<dyn ApduInterface>, String) = match &cli.trace {
        Some(trace_file) => (Box::new(TraceCard::load(trace_file)?), trace_file.clone()),
        None => open_card_reader()?,
    };

    let mut connection = EmvConnection::new(card.as_mut(), &events, settings)?;
    let record = connection.read_card_record(&options, &reader_name, issuer_key.as_ref());

    info!("{}", record.summary());
    print!("{}", serde_yaml::to_string(&record)?);

    Ok(record.status)
}

fn main() {
    std::process::exit(match run() {
        Ok(TransactionStatus::Success) => 0,
        Ok(TransactionStatus::Failed) => 2,
        Err(err) => {
            error!("{}", err);
            eprintln!("{}", err);
            1
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line() {
        let cli = Cli::try_parse_from([
            "cardreader",
            "--contactless",
            "--aid",
            "A0000000031010",
            "--trace",
            "trace.yaml",
        ])
        .unwrap();

        assert!(cli.contactless);
        assert_eq!(cli.settings, "config/settings.yaml");
        assert_eq!(cli.issuer_exponent, "03");
        assert_eq!(cli.log_config, PathBuf::from("config/log4rs.yaml"));
        assert_eq!(
            decode_hex("--aid", cli.aid.as_deref().unwrap()).unwrap(),
            vec![0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10]
        );
        assert!(matches!(
            decode_hex("--aid", "A0Z"),
            Err(CardReaderError::Hex("--aid", _))
        ));
    }

    #[test]
    fn test_missing_log_config_falls_back_to_console() {
        assert!(init_logging(Path::new("config/no-such-log4rs.yaml")).is_ok());
        info!("console logging");
    }
}
