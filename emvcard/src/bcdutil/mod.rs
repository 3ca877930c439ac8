use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BcdError {
    #[error("invalid BCD nibble {0:X}")]
    InvalidNibble(u8),

    #[error("digit after padding at byte {0}")]
    DigitAfterPadding(usize),

    #[error("non numeric character {0:?}")]
    NonNumeric(char),

    #[error("{digits} digits do not fit in {size} bytes")]
    Overflow { digits: usize, size: usize },
}

const PADDING_NIBBLE: u8 = 0xF;

// cn = 12 34 56 78 90 12 3F FF
pub fn bcd_to_ascii(bcd_data: &[u8]) -> Result<String, BcdError> {
    let mut ascii_output = String::with_capacity(bcd_data.len() * 2);
    let mut padding_seen = false;

    for (i, byte) in bcd_data.iter().enumerate() {
        for nibble in [byte >> 4, byte & 0xF].iter().copied() {
            if nibble == PADDING_NIBBLE {
                padding_seen = true;
                continue;
            }

            if padding_seen {
                return Err(BcdError::DigitAfterPadding(i));
            }

            if nibble > 0x9 {
                return Err(BcdError::InvalidNibble(nibble));
            }

            ascii_output.push(char::from(b'0' + nibble));
        }
    }

    Ok(ascii_output)
}

// n = 00 00 00 01 23 45
pub fn ascii_to_bcd_n(ascii_data: &str, size: usize) -> Result<Vec<u8>, BcdError> {
    if let Some(c) = ascii_data.chars().find(|c| !c.is_ascii_digit()) {
        return Err(BcdError::NonNumeric(c));
    }

    if ascii_data.len() > size * 2 {
        return Err(BcdError::Overflow {
            digits: ascii_data.len(),
            size,
        });
    }

    let mut digits: Vec<u8> = vec![0; size * 2 - ascii_data.len()];
    digits.extend(ascii_data.bytes().map(|b| b - b'0'));

    Ok(digits.chunks(2).map(|pair| (pair[0] << 4) | pair[1]).collect())
}
