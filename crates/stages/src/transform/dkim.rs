//! `DkimSigner`: parses the message, computes a body hash, and prepends a
//! `DKIM-Signature` header, signing with `rsa` + `sha2` directly rather than
//! an external DKIM crate.

use std::path::Path;

use base64::Engine as _;
use feathermail_pipeline::Meta;
use feathermail_transform::{DataTransform, TransformError};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};

fn split_message(raw: &[u8]) -> (&[u8], &[u8]) {
    match raw.windows(4).position(|window| window == b"\r\n\r\n") {
        Some(pos) => (&raw[..pos], &raw[pos + 4..]),
        None => (raw, &[]),
    }
}

/// "Simple" body canonicalization (RFC 6376 §3.4.3): a trailing run of
/// empty lines is removed, and the body is guaranteed to end in CRLF.
fn canonicalize_body_simple(body: &[u8]) -> Vec<u8> {
    let mut trimmed = body;
    while trimmed.ends_with(b"\r\n") {
        let candidate = &trimmed[..trimmed.len() - 2];
        if candidate.ends_with(b"\r\n") || candidate.is_empty() {
            trimmed = candidate;
        } else {
            break;
        }
    }
    let mut out = trimmed.to_vec();
    out.extend_from_slice(b"\r\n");
    out
}

pub struct DkimSigner {
    selector: String,
    domain: String,
    signing_key: SigningKey<Sha256>,
}

impl DkimSigner {
    pub fn new(selector: String, domain: String, private_key_path: &Path, algorithm: &str) -> Result<Self, String> {
        if algorithm != "rsa-sha256" {
            return Err(format!("unsupported DKIM algorithm `{algorithm}`, only rsa-sha256 is implemented"));
        }
        let pem = std::fs::read_to_string(private_key_path)
            .map_err(|error| format!("could not read DKIM private key {}: {error}", private_key_path.display()))?;
        let pkcs8 = <RsaPrivateKey as DecodePrivateKey>::from_pkcs8_pem(&pem).map_err(|error| error.to_string());
        let key = pkcs8
            .or_else(|_| <RsaPrivateKey as DecodeRsaPrivateKey>::from_pkcs1_pem(&pem).map_err(|error| error.to_string()))
            .map_err(|error| format!("could not parse DKIM private key: {error}"))?;
        Ok(Self { selector, domain, signing_key: SigningKey::<Sha256>::new(key) })
    }

    fn body_hash_base64(body: &[u8]) -> String {
        let canonical = canonicalize_body_simple(body);
        base64::engine::general_purpose::STANDARD.encode(sha2::Sha256::digest(canonical))
    }
}

impl DataTransform for DkimSigner {
    fn transform_data(&self, raw: Vec<u8>, meta: Meta) -> Result<(Vec<u8>, Meta), TransformError> {
        let (headers, body) = split_message(&raw);
        let body_hash = Self::body_hash_base64(body);

        let unsigned_header = format!(
            "DKIM-Signature: v=1; a=rsa-sha256; c=simple/simple; d={}; s={}; h=from:to:subject; bh={}; b=",
            self.domain, self.selector, body_hash
        );

        let mut to_sign = Vec::new();
        to_sign.extend_from_slice(headers);
        to_sign.extend_from_slice(b"\r\n");
        to_sign.extend_from_slice(unsigned_header.as_bytes());

        let signature = self.signing_key.try_sign(&to_sign).map_err(|error| TransformError::Rejected(error.to_string()))?;
        let signature_b64 = base64::engine::general_purpose::STANDARD.encode(signature.to_bytes());

        let mut signed = Vec::new();
        signed.extend_from_slice(format!("{unsigned_header}{signature_b64}\r\n").as_bytes());
        signed.extend_from_slice(&raw);
        Ok((signed, meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_canonicalization_strips_trailing_blank_lines() {
        let body = b"hello\r\n\r\n\r\n";
        let canonical = canonicalize_body_simple(body);
        assert_eq!(canonical, b"hello\r\n");
    }

    #[test]
    fn empty_body_canonicalizes_to_single_crlf() {
        assert_eq!(canonicalize_body_simple(b""), b"\r\n");
    }
}
