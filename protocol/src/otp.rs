//! One-time passwords for dynamic password verification.
//!
//! Implements HOTP ([RFC 4226](https://www.rfc-editor.org/rfc/rfc4226)) and
//! TOTP ([RFC 6238](https://www.rfc-editor.org/rfc/rfc6238)) using HMAC-SHA1.
//!
//! The lock asks the module to verify an 8-digit code typed on its keypad.
//! The module regenerates the code from the shared secret and the current time
//! and compares both as fixed-width decimal strings, so leading zeros matter.

use alloc::{format, string::String};
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Computes an HOTP code for the given counter.
///
/// The result is reduced modulo `10^digits` and must be left-padded
/// with zeros to `digits` characters for display, see [`format_code`].
///
/// Returns `None` if the MAC rejects the key.
#[must_use]
pub fn hotp(key: &[u8], counter: u64, digits: u32) -> Option<u32> {
    let mut mac = HmacSha1::new_from_slice(key).ok()?;

    mac.update(&counter.to_be_bytes());

    let code = truncate(&mac.finalize().into_bytes());

    Some(match 10u32.checked_pow(digits) {
        Some(modulus) => code % modulus,
        None => code,
    })
}

/// Computes a TOTP code for the given Unix time.
///
/// The counter is the number of whole `step` second windows since the epoch.
#[must_use]
pub fn totp(key: &[u8], unix_time: u64, step: u64, digits: u32) -> Option<u32> {
    hotp(key, unix_time / step.max(1), digits)
}

/// Formats a code as a fixed-width decimal string.
#[must_use]
pub fn format_code(code: u32, digits: u32) -> String {
    format!("{code:0width$}", width = digits as usize)
}

/// Checks an entered code against the TOTP code for the given Unix time.
///
/// The entered code is compared digit for digit with the generated one.
/// Nothing matches if no code can be generated.
#[must_use]
pub fn verify_totp(key: &[u8], unix_time: u64, step: u64, digits: u32, input: &[u8]) -> bool {
    totp(key, unix_time, step, digits)
        .is_some_and(|code| format_code(code, digits).as_bytes() == input)
}

/// Dynamic truncation of an HMAC-SHA1 digest.
fn truncate(digest: &[u8]) -> u32 {
    let offset = usize::from(digest[digest.len() - 1] & 0x0f);
    let bytes = [
        digest[offset],
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ];

    u32::from_be_bytes(bytes) & 0x7fff_ffff
}
