//! Sender Rewriting Scheme primitives: base-36 timestamp,
//! truncated HMAC-SHA256 tag, and the `SRS0=<hash>=<ts>=<domain>=<local>`
//! address shape.

use hmac::{Hmac, Mac};
use sha2::Sha256;

const TIMESTAMP_MODULUS: u64 = 1024;
const TIMESTAMP_WIDTH: usize = 2;
const BASE36_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SECONDS_PER_DAY: u64 = 86_400;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SrsError {
    #[error("not an SRS0 address: `{0}`")]
    NotSrs(String),
    #[error("malformed SRS0 address: `{0}`")]
    Malformed(String),
    #[error("SRS hash mismatch")]
    HashMismatch,
    #[error("SRS timestamp expired")]
    Expired,
}

/// An SRS0 address split into its four `=`-delimited fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrsAddress {
    pub hash: String,
    pub timestamp: String,
    pub orig_domain: String,
    pub orig_local: String,
}

fn days_since_epoch(now: std::time::SystemTime) -> u64 {
    now.duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        / SECONDS_PER_DAY
}

/// Encodes `value` as lowercase base-36, zero-padded/truncated to `width`
/// least-significant digits.
#[must_use]
pub fn encode_base36(value: u64, width: usize) -> String {
    let mut digits = vec![b'0'; width];
    let mut remaining = value;
    for slot in digits.iter_mut().rev() {
        *slot = BASE36_ALPHABET[(remaining % 36) as usize];
        remaining /= 36;
    }
    String::from_utf8(digits).expect("base36 alphabet is ASCII")
}

fn decode_base36(s: &str) -> Option<u64> {
    if s.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for byte in s.bytes() {
        let digit = BASE36_ALPHABET.iter().position(|&b| b == byte.to_ascii_lowercase())? as u64;
        value = value * 36 + digit;
    }
    Some(value)
}

/// The current SRS timestamp: days since the Unix epoch, modulo 1024,
/// base-36 encoded to width 2.
#[must_use]
pub fn current_timestamp(now: std::time::SystemTime) -> String {
    encode_base36(days_since_epoch(now) % TIMESTAMP_MODULUS, TIMESTAMP_WIDTH)
}

/// `hex(first 2 bytes of HMAC-SHA256(secret, ts||domain||local))`.
#[must_use]
pub fn compute_hash(secret: &str, timestamp: &str, domain: &str, local: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(domain.as_bytes());
    mac.update(local.as_bytes());
    let tag = mac.finalize().into_bytes();
    hex_encode(&tag[..2])
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Builds `SRS0=<hash>=<ts>=<orig_domain>=<orig_local>@<srs_domain>`.
#[must_use]
pub fn rewrite(
    secret: &str,
    orig_domain: &str,
    orig_local: &str,
    srs_domain: &str,
    now: std::time::SystemTime,
) -> String {
    let ts = current_timestamp(now);
    let hash = compute_hash(secret, &ts, orig_domain, orig_local);
    format!("SRS0={hash}={ts}={orig_domain}={orig_local}@{srs_domain}")
}

/// Parses an address's local part as `SRS0=H=T=D=L`.
pub fn parse(local_part: &str) -> Result<SrsAddress, SrsError> {
    let rest = local_part
        .strip_prefix("SRS0=")
        .ok_or_else(|| SrsError::NotSrs(local_part.to_string()))?;
    let fields: Vec<&str> = rest.splitn(4, '=').collect();
    let [hash, timestamp, orig_domain, orig_local] = fields.as_slice() else {
        return Err(SrsError::Malformed(local_part.to_string()));
    };
    Ok(SrsAddress {
        hash: (*hash).to_string(),
        timestamp: (*timestamp).to_string(),
        orig_domain: (*orig_domain).to_string(),
        orig_local: (*orig_local).to_string(),
    })
}

/// Validates an `SrsAddress` against `secret`: recomputes the hash and
/// checks the timestamp is within `max_age_days`, accounting for the
/// modulo-1024 wraparound.
pub fn validate(
    address: &SrsAddress,
    secret: &str,
    max_age_days: u32,
    now: std::time::SystemTime,
) -> Result<(), SrsError> {
    let expected_hash = compute_hash(secret, &address.timestamp, &address.orig_domain, &address.orig_local);
    if !constant_time_eq(expected_hash.as_bytes(), address.hash.as_bytes()) {
        return Err(SrsError::HashMismatch);
    }

    let sent = decode_base36(&address.timestamp).ok_or_else(|| SrsError::Malformed(address.timestamp.clone()))?;
    let current = days_since_epoch(now) % TIMESTAMP_MODULUS;
    let age = (current + TIMESTAMP_MODULUS - sent) % TIMESTAMP_MODULUS;
    if age > u64::from(max_age_days) {
        return Err(SrsError::Expired);
    }
    Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn base36_roundtrips() {
        for value in [0, 1, 35, 36, 1023] {
            let encoded = encode_base36(value, TIMESTAMP_WIDTH);
            assert_eq!(decode_base36(&encoded), Some(value % 36u64.pow(TIMESTAMP_WIDTH as u32)));
        }
    }

    #[test]
    fn rewrite_then_parse_roundtrips() {
        let now = SystemTime::now();
        let rewritten = rewrite("shh", "example.com", "alice", "srs.relay.test", now);
        let local = rewritten.split('@').next().unwrap();
        let parsed = parse(local).unwrap();
        assert_eq!(parsed.orig_domain, "example.com");
        assert_eq!(parsed.orig_local, "alice");
        validate(&parsed, "shh", 21, now).unwrap();
    }

    #[test]
    fn wrong_secret_fails_validation() {
        let now = SystemTime::now();
        let rewritten = rewrite("shh", "example.com", "alice", "srs.relay.test", now);
        let local = rewritten.split('@').next().unwrap();
        let parsed = parse(local).unwrap();
        assert_eq!(validate(&parsed, "other", 21, now), Err(SrsError::HashMismatch));
    }

    #[test]
    fn expired_timestamp_is_rejected() {
        let now = SystemTime::now();
        let long_ago = now - Duration::from_secs(SECONDS_PER_DAY * 30);
        let rewritten = rewrite("shh", "example.com", "alice", "srs.relay.test", long_ago);
        let local = rewritten.split('@').next().unwrap();
        let parsed = parse(local).unwrap();
        assert_eq!(validate(&parsed, "shh", 21, now), Err(SrsError::Expired));
    }

    #[test]
    fn non_srs_address_is_rejected() {
        assert_eq!(parse("alice"), Err(SrsError::NotSrs("alice".to_string())));
    }
}
