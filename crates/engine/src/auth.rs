//! Hand-decoded SASL PLAIN/LOGIN, narrowed from a full SASL negotiation
//! framework to exactly the two mechanisms this engine advertises.

use base64::Engine as _;
use feathermail_pipeline::Credentials;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthDecodeError {
    #[error("malformed base64")]
    Base64,
    #[error("malformed PLAIN response: expected authzid\\0authcid\\0password")]
    MalformedPlain,
    #[error("not valid UTF-8")]
    Utf8,
}

fn decode_b64(s: &str) -> Result<Vec<u8>, AuthDecodeError> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|_| AuthDecodeError::Base64)
}

/// Decodes a full PLAIN initial response: `authzid\0authcid\0password`.
pub fn decode_plain(response: &str) -> Result<Credentials, AuthDecodeError> {
    let bytes = decode_b64(response)?;
    let text = std::str::from_utf8(&bytes).map_err(|_| AuthDecodeError::Utf8)?;
    let mut parts = text.splitn(3, '\0');
    let authzid = parts.next().ok_or(AuthDecodeError::MalformedPlain)?;
    let authcid = parts.next().ok_or(AuthDecodeError::MalformedPlain)?;
    let password = parts.next().ok_or(AuthDecodeError::MalformedPlain)?;
    Ok(Credentials {
        authzid: (!authzid.is_empty()).then(|| authzid.to_string()),
        authcid: authcid.to_string(),
        password: password.to_string(),
    })
}

/// Decodes one base64 LOGIN continuation line (username, then password).
pub fn decode_login_field(response: &str) -> Result<String, AuthDecodeError> {
    let bytes = decode_b64(response)?;
    String::from_utf8(bytes).map_err(|_| AuthDecodeError::Utf8)
}

#[must_use]
pub fn encode_b64_prompt(prompt: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(prompt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plain_with_empty_authzid() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("\0alice\0secret");
        let creds = decode_plain(&encoded).unwrap();
        assert_eq!(creds.authzid, None);
        assert_eq!(creds.authcid, "alice");
        assert_eq!(creds.password, "secret");
    }

    #[test]
    fn rejects_malformed_plain() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("justalice");
        assert_eq!(decode_plain(&encoded), Err(AuthDecodeError::MalformedPlain));
    }

    #[test]
    fn decodes_login_field() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("alice");
        assert_eq!(decode_login_field(&encoded).unwrap(), "alice");
    }
}
