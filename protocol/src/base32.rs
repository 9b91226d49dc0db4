//! RFC 4648 base32 codec.
//!
//! TOTP secrets are usually handed out as base32 text.
//! [`decode`] turns such a secret back into the raw key bytes expected by [`otp`](crate::otp).

use alloc::{string::String, vec::Vec};
use core::fmt::{Display, Formatter};

const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
const PADDING: char = '=';

/// Error type for base32 decoding.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(PartialEq, Eq, Debug)]
pub enum Error {
    /// The text contains a character outside of the base32 alphabet.
    InvalidSymbol(char),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::InvalidSymbol(c) => write!(f, "invalid base32 symbol: {c:?}"),
        }
    }
}

impl core::error::Error for Error {}

/// Encodes bytes as base32 text.
///
/// The output is padded with `=` to a multiple of 8 characters.
#[must_use]
pub fn encode(data: &[u8]) -> String {
    let mut text = String::with_capacity(data.len().div_ceil(5) * 8);

    for chunk in data.chunks(5) {
        let mut block = [0x00; 5];

        block[..chunk.len()].copy_from_slice(chunk);

        let bits = block
            .iter()
            .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte));
        let symbols = (chunk.len() * 8).div_ceil(5);

        for i in 0..8 {
            if i < symbols {
                let idx = (bits >> (35 - i * 5)) & 0x1f;

                text.push(char::from(ALPHABET[idx as usize]));
            } else {
                text.push(PADDING);
            }
        }
    }

    text
}

/// Decodes base32 text into bytes.
///
/// Decoding is case-insensitive and ignores `=` padding.
/// Trailing bits that do not fill a whole byte are discarded,
/// so `n` symbols always yield `n * 5 / 8` bytes.
///
/// # Errors
///
/// - [`Error::InvalidSymbol`] if the text contains a character outside the alphabet.
pub fn decode(text: &str) -> Result<Vec<u8>, Error> {
    let mut data = Vec::with_capacity(text.len() * 5 / 8);
    let mut buf = 0u32;
    let mut bits = 0;

    for c in text.chars().filter(|&c| c != PADDING) {
        let val = symbol_value(c).ok_or(Error::InvalidSymbol(c))?;

        // At most 7 pending bits survive a push, so 13 bits are enough
        buf = ((buf << 5) | u32::from(val)) & 0x1fff;
        bits += 5;

        if bits >= 8 {
            bits -= 8;
            data.push((buf >> bits) as u8);
        }
    }

    Ok(data)
}

fn symbol_value(c: char) -> Option<u8> {
    match c {
        'A'..='Z' => Some(c as u8 - b'A'),
        'a'..='z' => Some(c as u8 - b'a'),
        '2'..='7' => Some(c as u8 - b'2' + 26),
        _ => None,
    }
}
