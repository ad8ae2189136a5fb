//! Time-windowed HMAC-SHA256 signing (C1).
//!
//! Every control operation — stream envelopes and the HTTP surface alike —
//! is authenticated the same way: a client proves knowledge of the password
//! hash by signing the current Unix timestamp, and the server accepts the
//! signature only within a small clock-skew window. The Signer itself is
//! pure and holds no state; all three operations are safe to call from any
//! number of tasks concurrently.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Maximum allowed clock skew, in seconds, between a claimed `ts` and the
/// server's own clock (§4.1, §8 boundary behavior: ±10 accepted, ±11 rejected).
pub const SIGNATURE_WINDOW_SECS: i64 = 10;

/// Fixed HMAC key used only to derive the password hash from the plaintext
/// password. Not a secret in itself — it exists so the stored `passhash`
/// is not simply the plaintext password's own hash under a well-known
/// algorithm, matching the documented `HMAC_SHA256("XXTouch", password)`.
const PASSWORD_HASH_KEY: &[u8] = b"XXTouch";

#[derive(Debug, Clone, Copy, Default)]
pub struct Signer;

impl Signer {
    /// `passhash = lowercase_hex(HMAC_SHA256(key="XXTouch", msg=plaintext_password))`.
    #[must_use]
    pub fn hash_password(plaintext: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(PASSWORD_HASH_KEY)
            .expect("HMAC accepts keys of any length");
        mac.update(plaintext.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// `sign = lowercase_hex(HMAC_SHA256(key=passhash_ascii_bytes, msg=decimal_ascii(ts)))`.
    #[must_use]
    pub fn sign(passhash: &str, ts: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(passhash.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(ts.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Accept iff `|now - ts| <= SIGNATURE_WINDOW_SECS` and the recomputed
    /// signature matches `sign_hex` in constant time.
    #[must_use]
    pub fn verify(passhash: &str, ts: i64, sign_hex: &str, now: i64) -> bool {
        if (now - ts).abs() > SIGNATURE_WINDOW_SECS {
            return false;
        }
        let expected = Self::sign(passhash, ts);
        constant_time_eq(expected.as_bytes(), sign_hex.as_bytes())
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of
/// `provided` length, so an attacker cannot infer the expected length from
/// response timing.
#[must_use]
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for i in 0..expected.len() {
        let p = if i < provided.len() { provided[i] } else { 0xff };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_password_is_64_lowercase_hex_chars() {
        let h = Signer::hash_password("hunter2");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let passhash = Signer::hash_password("hunter2");
        let ts = 1_700_000_000_i64;
        let sign = Signer::sign(&passhash, ts);
        assert!(Signer::verify(&passhash, ts, &sign, ts));
    }

    #[test]
    fn verify_rejects_wrong_signature() {
        let passhash = Signer::hash_password("hunter2");
        let ts = 1_700_000_000_i64;
        assert!(!Signer::verify(&passhash, ts, "deadbeef", ts));
    }

    #[test]
    fn verify_boundary_window() {
        let passhash = Signer::hash_password("hunter2");
        let ts = 1_700_000_000_i64;
        let sign = Signer::sign(&passhash, ts);
        assert!(Signer::verify(&passhash, ts, &sign, ts + 10));
        assert!(Signer::verify(&passhash, ts, &sign, ts - 10));
        assert!(!Signer::verify(&passhash, ts, &sign, ts + 11));
        assert!(!Signer::verify(&passhash, ts, &sign, ts - 11));
    }

    #[test]
    fn constant_time_eq_matches_standard_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
