//! RFC 6238 time-based one-time passwords over HMAC-SHA1.

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::AuthError;

type HmacSha1 = Hmac<Sha1>;

/// Window used for the code derived from local wall-clock time.
pub const LOCAL_PERIOD_SECS: u64 = 30;
/// Window used for the code derived from the server-reported time.
pub const SERVER_PERIOD_SECS: u64 = 900;
pub const DIGITS: u32 = 6;

/// Generate a zero-padded TOTP code.
///
/// `secret` is the raw HMAC key, `time_secs` seconds since the Unix epoch.
pub fn generate_totp(
    secret: &[u8],
    time_secs: u64,
    period_secs: u64,
    digits: u32,
) -> Result<String, AuthError> {
    if period_secs == 0 {
        return Err(AuthError::Crypto("TOTP period must be non-zero".to_string()));
    }
    if !(1..=10).contains(&digits) {
        return Err(AuthError::Crypto(format!(
            "TOTP digit count {digits} out of range"
        )));
    }

    let counter = time_secs / period_secs;

    let mut mac = HmacSha1::new_from_slice(secret)
        .map_err(|_| AuthError::Crypto("invalid HMAC key length".to_string()))?;
    mac.update(&counter.to_be_bytes());
    let hash = mac.finalize().into_bytes();

    // Dynamic truncation (RFC 4226 §5.3)
    let offset = (hash[hash.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        hash[offset] & 0x7f,
        hash[offset + 1],
        hash[offset + 2],
        hash[offset + 3],
    ]);

    let code = u64::from(binary) % 10u64.pow(digits);
    Ok(format!("{code:0width$}", width = digits as usize))
}
