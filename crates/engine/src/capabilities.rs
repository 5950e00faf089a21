//! Deterministic EHLO capability computation.

pub use feathermail_pipeline::TlsMode;

/// Computes the advertised capability lines for an EHLO reply, in a fixed
/// order so output is deterministic across calls.
#[must_use]
pub fn compute(tls_mode: TlsMode, tls_active: bool, max_message_size: u64) -> Vec<String> {
    let mut caps = vec![
        format!("SIZE {max_message_size}"),
        "PIPELINING".to_string(),
        "8BITMIME".to_string(),
        "ENHANCEDSTATUSCODES".to_string(),
    ];

    if tls_active || tls_mode == TlsMode::Always {
        caps.push("AUTH PLAIN LOGIN".to_string());
    }
    if tls_mode == TlsMode::IfAvailable && !tls_active {
        caps.push("STARTTLS".to_string());
    }

    caps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_tls_if_available_without_handshake() {
        let caps = compute(TlsMode::IfAvailable, false, 1024);
        assert!(caps.contains(&"STARTTLS".to_string()));
        assert!(!caps.iter().any(|c| c.starts_with("AUTH")));
    }

    #[test]
    fn auth_advertised_once_tls_active() {
        let caps = compute(TlsMode::IfAvailable, true, 1024);
        assert!(caps.contains(&"AUTH PLAIN LOGIN".to_string()));
        assert!(!caps.contains(&"STARTTLS".to_string()));
    }

    #[test]
    fn always_mode_advertises_auth_without_tls() {
        let caps = compute(TlsMode::Always, false, 1024);
        assert!(caps.contains(&"AUTH PLAIN LOGIN".to_string()));
    }

    #[test]
    fn never_mode_never_advertises_starttls() {
        let caps = compute(TlsMode::Never, false, 1024);
        assert!(!caps.contains(&"STARTTLS".to_string()));
    }
}
