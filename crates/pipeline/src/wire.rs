//! Minimal SMTP wire types shared by the engine and the stage contracts:
//! reply codes, domain names, and client names. DNS-capable domain parsing
//! is deliberately not pulled in here — resolution is out of scope, and
//! dragging in that dependency only for a name type would be unwarranted.

use std::fmt;
use std::str::FromStr;

/// A reply code, optionally carrying an RFC 3463 enhanced status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyCode {
    Code { code: u16 },
    Enhanced { code: u16, enhanced: String },
}

impl ReplyCode {
    #[must_use]
    pub const fn value(&self) -> u16 {
        match self {
            Self::Code { code } | Self::Enhanced { code, .. } => *code,
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.value() / 100 >= 4
    }
}

/// A complete SMTP reply line, e.g. `"250 2.0.0 OK: message accepted\r\n"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: ReplyCode,
    pub text: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid SMTP reply line: `{0}`")]
pub struct ReplyParseError(String);

impl Reply {
    #[must_use]
    pub fn new(code: u16, enhanced: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            code: match enhanced {
                Some(enhanced) => ReplyCode::Enhanced {
                    code,
                    enhanced: enhanced.to_string(),
                },
                None => ReplyCode::Code { code },
            },
            text: text.into(),
        }
    }

    /// Render as a single (non-multiline) wire line, CRLF-terminated.
    #[must_use]
    pub fn to_wire(&self) -> String {
        match &self.code {
            ReplyCode::Code { code } => format!("{code} {}\r\n", self.text),
            ReplyCode::Enhanced { code, enhanced } => {
                format!("{code} {enhanced} {}\r\n", self.text)
            }
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire().trim_end())
    }
}

impl FromStr for Reply {
    type Err = ReplyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_end_matches(['\r', '\n']);
        let mut parts = s.splitn(2, ' ');
        let code: u16 = parts
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or_else(|| ReplyParseError(s.to_string()))?;
        let rest = parts.next().unwrap_or_default();

        // An enhanced status code looks like `d.d.d` where the first digit
        // mirrors the reply code's class.
        if let Some((enhanced, text)) = rest.split_once(' ') {
            if is_enhanced_status(enhanced) {
                return Ok(Self::new(code, Some(enhanced), text));
            }
        }
        Ok(Self::new(code, None, rest))
    }
}

fn is_enhanced_status(s: &str) -> bool {
    let parts: Vec<_> = s.split('.').collect();
    parts.len() == 3 && parts.iter().all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

/// A domain name, as given in HELO/EHLO or an address's domain part. Kept
/// deliberately dumb (no DNS validation) since resolution is out of scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Domain(pub String);

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Domain {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().to_ascii_lowercase()))
    }
}

/// The client-supplied name in HELO/EHLO — syntactically a `Domain` or an
/// address literal; this type doesn't distinguish them any further than the
/// engine needs to.
pub type ClientName = Domain;

/// Decoded SASL credentials for the `auth` phase.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub authzid: Option<String>,
    pub authcid: String,
    pub password: String,
}

/// The server-wide STARTTLS posture, set once at boot and
/// shared by the config loader and the session engine's EHLO computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    Never,
    IfAvailable,
    Always,
}

impl Default for TlsMode {
    fn default() -> Self {
        Self::IfAvailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_roundtrips_through_wire() {
        let reply = Reply::new(250, Some("2.0.0"), "OK: message accepted");
        assert_eq!(reply.to_wire(), "250 2.0.0 OK: message accepted\r\n");
        let parsed: Reply = reply.to_wire().parse().unwrap();
        assert_eq!(parsed, reply);
    }

    #[test]
    fn reply_without_enhanced_code() {
        let reply: Reply = "252 Not supported\r\n".parse().unwrap();
        assert_eq!(reply.code, ReplyCode::Code { code: 252 });
        assert_eq!(reply.text, "Not supported");
    }

    #[test]
    fn error_classification() {
        assert!(Reply::new(550, None, "no").code.is_error());
        assert!(!Reply::new(250, None, "ok").code.is_error());
    }
}
