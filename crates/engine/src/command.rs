//! SMTP command line parsing: one verb per client line, plus its raw
//! argument string (further decoded by the caller, e.g. base64 AUTH
//! continuations).

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    StartTls,
    Auth { mechanism: String, initial_response: Option<String> },
    MailFrom { address: String, params: Vec<String> },
    RcptTo { address: String, params: Vec<String> },
    Data,
    Rset,
    Vrfy(String),
    Noop,
    Quit,
    /// A syntactically unrecognized verb.
    Unknown(String),
}

/// Parses one client command line (already stripped of its CRLF).
#[must_use]
pub fn parse(line: &str) -> Command {
    let line = line.trim_end();
    let (verb, rest) = match line.split_once(' ') {
        Some((verb, rest)) => (verb, rest.trim_start()),
        None => (line, ""),
    };

    match verb.to_ascii_uppercase().as_str() {
        "HELO" => Command::Helo(rest.to_string()),
        "EHLO" => Command::Ehlo(rest.to_string()),
        "STARTTLS" => Command::StartTls,
        "AUTH" => {
            let mut parts = rest.splitn(2, ' ');
            let mechanism = parts.next().unwrap_or_default().to_ascii_uppercase();
            let initial_response = parts.next().map(str::to_string);
            Command::Auth { mechanism, initial_response }
        }
        "MAIL" => Command::MailFrom { address: strip_kv_prefix(rest, "FROM:"), params: extension_params(rest) },
        "RCPT" => Command::RcptTo { address: strip_kv_prefix(rest, "TO:"), params: extension_params(rest) },
        "DATA" => Command::Data,
        "RSET" => Command::Rset,
        "VRFY" => Command::Vrfy(rest.to_string()),
        "NOOP" => Command::Noop,
        "QUIT" => Command::Quit,
        _ => Command::Unknown(line.to_string()),
    }
}

/// Strips a case-insensitive `FROM:`/`TO:` prefix and the surrounding
/// angle brackets from a MAIL/RCPT argument, e.g.
/// `FROM:<alice@example.com> SIZE=123` -> `alice@example.com`. Trailing
/// parameters are parsed separately via `extension_params`.
fn strip_kv_prefix(rest: &str, prefix: &str) -> String {
    let body = rest
        .to_ascii_uppercase()
        .find(prefix)
        .map_or(rest, |idx| &rest[idx + prefix.len()..]);
    let body = body.split_whitespace().next().unwrap_or_default();
    body.trim_start_matches('<').trim_end_matches('>').to_string()
}

/// Parameters after the address portion of a MAIL/RCPT line, e.g. `SIZE=123
/// BODY=8BITMIME`. Only the extensions this engine actually understands are
/// accepted; anything else is `555 5.5.4`.
pub const KNOWN_MAIL_PARAMS: &[&str] = &["SIZE", "BODY"];
pub const KNOWN_RCPT_PARAMS: &[&str] = &[];

#[must_use]
pub fn extension_params(rest: &str) -> Vec<String> {
    rest.split_whitespace().skip(1).map(str::to_string).collect()
}

#[must_use]
pub fn unknown_param(params: &[String], known: &[&str]) -> bool {
    params.iter().any(|param| {
        let name = param.split('=').next().unwrap_or_default().to_ascii_uppercase();
        !known.contains(&name.as_str())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mail_from_with_angle_brackets() {
        assert_eq!(
            parse("MAIL FROM:<alice@example.com>"),
            Command::MailFrom { address: "alice@example.com".to_string(), params: vec![] }
        );
    }

    #[test]
    fn parses_rcpt_to_with_params() {
        let cmd = parse("RCPT TO:<bob@example.com> NOTIFY=SUCCESS");
        assert_eq!(
            cmd,
            Command::RcptTo { address: "bob@example.com".to_string(), params: vec!["NOTIFY=SUCCESS".to_string()] }
        );
    }

    #[test]
    fn parses_auth_with_initial_response() {
        assert_eq!(
            parse("AUTH PLAIN AGFsaWNlAHNlY3JldA=="),
            Command::Auth {
                mechanism: "PLAIN".to_string(),
                initial_response: Some("AGFsaWNlAHNlY3JldA==".to_string())
            }
        );
    }

    #[test]
    fn unrecognized_verb_is_unknown() {
        assert_eq!(parse("FROB foo"), Command::Unknown("FROB foo".to_string()));
    }

    #[test]
    fn detects_unknown_mail_param() {
        let params = extension_params("alice@example.com FUZZ=1");
        assert!(unknown_param(&params, KNOWN_MAIL_PARAMS));
        let params = extension_params("alice@example.com SIZE=100");
        assert!(!unknown_param(&params, KNOWN_MAIL_PARAMS));
    }
}
