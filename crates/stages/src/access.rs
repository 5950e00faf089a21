//! Access control stages: `SimpleAccess`, `RelayControl`, `IPFilter`,
//! `SenderDomainValidator`, `BackscatterGuard`.

use std::path::PathBuf;

use async_trait::async_trait;
use feathermail_ipmatch::{ip_matches, parse_rule_or_drop, IpRule};
use feathermail_pipeline::{ClientName, HaltReason, Meta, PhaseOutcome, Reply, StageState};
use feathermail_transform::split_address;
use regex::Regex;

fn noop_state() -> StageState {
    Box::new(())
}

fn domain_of(address: &str) -> Option<String> {
    split_address(address).ok().map(|(_, domain)| domain.to_ascii_lowercase())
}

/// `rcpt` — accept only if the recipient matches one of the configured
/// regex patterns.
pub struct SimpleAccess {
    patterns: Vec<Regex>,
}

impl SimpleAccess {
    pub fn new(patterns: &[String]) -> Result<Self, String> {
        let patterns = patterns
            .iter()
            .map(|pattern| Regex::new(pattern).map_err(|error| format!("invalid pattern `{pattern}`: {error}")))
            .collect::<Result<_, _>>()?;
        Ok(Self { patterns })
    }
}

#[async_trait]
impl feathermail_pipeline::Adapter for SimpleAccess {
    async fn rcpt(&self, to: &str, meta: Meta, state: StageState) -> PhaseOutcome {
        if self.patterns.iter().any(|pattern| pattern.is_match(to)) {
            PhaseOutcome::pass(meta, state)
        } else {
            PhaseOutcome::halt(HaltReason::RecipientNotAllowed(to.to_string()), state)
        }
    }

    fn format_reason(&self, reason: &HaltReason) -> Option<Reply> {
        match reason {
            HaltReason::RecipientNotAllowed(to) => {
                Some(Reply::new(550, Some("5.1.1"), format!("Recipient not allowed: {to}")))
            }
            _ => None,
        }
    }
}

/// `rcpt` — allow relaying to a local domain, from a trusted IP, or for any
/// already-authenticated user; otherwise halt.
pub struct RelayControl {
    local_domains: Vec<String>,
    trusted_ips: Vec<IpRule>,
}

impl RelayControl {
    #[must_use]
    pub fn new(local_domains: Vec<String>, trusted_ips: &[String]) -> Self {
        let local_domains = local_domains.into_iter().map(|d| d.to_ascii_lowercase()).collect();
        let trusted_ips = trusted_ips.iter().filter_map(|rule| parse_rule_or_drop(rule)).collect();
        Self { local_domains, trusted_ips }
    }
}

#[async_trait]
impl feathermail_pipeline::Adapter for RelayControl {
    async fn rcpt(&self, to: &str, meta: Meta, state: StageState) -> PhaseOutcome {
        let local = domain_of(to).is_some_and(|domain| self.local_domains.contains(&domain));
        let trusted_peer = meta
            .peer_ip()
            .is_some_and(|peer| self.trusted_ips.iter().any(|rule| ip_matches(&peer, rule)));
        let authorized = local || trusted_peer || meta.user().is_some();

        if authorized {
            PhaseOutcome::pass(meta, state)
        } else {
            PhaseOutcome::halt(HaltReason::RelayingDenied(to.to_string()), state)
        }
    }

    fn format_reason(&self, reason: &HaltReason) -> Option<Reply> {
        match reason {
            HaltReason::RelayingDenied(to) => {
                Some(Reply::new(550, Some("5.7.1"), format!("Relaying denied for {to}")))
            }
            _ => None,
        }
    }
}

/// `helo` — reject the whole session if the peer IP matches a blocked rule.
pub struct IpFilter {
    blocked: Vec<IpRule>,
}

impl IpFilter {
    #[must_use]
    pub fn new(blocked_ips: &[String]) -> Self {
        Self { blocked: blocked_ips.iter().filter_map(|rule| parse_rule_or_drop(rule)).collect() }
    }
}

#[async_trait]
impl feathermail_pipeline::Adapter for IpFilter {
    fn helo(&self, _domain: &ClientName, meta: Meta, state: StageState) -> PhaseOutcome {
        let blocked = meta.peer_ip().is_some_and(|peer| self.blocked.iter().any(|rule| ip_matches(&peer, rule)));
        if blocked {
            PhaseOutcome::halt(HaltReason::IpBlocked, state)
        } else {
            PhaseOutcome::pass(meta, state)
        }
    }

    fn format_reason(&self, reason: &HaltReason) -> Option<Reply> {
        matches!(reason, HaltReason::IpBlocked)
            .then(|| Reply::new(554, Some("5.7.1"), "Access denied from your IP address"))
    }
}

/// `mail` — require the sender's domain to be allowed for relay unless the
/// session is already authenticated (when `require_auth_for_relay` is set).
pub struct SenderDomainValidator {
    require_auth_for_relay: bool,
    allowed_domains: Vec<String>,
}

impl SenderDomainValidator {
    #[must_use]
    pub fn new(require_auth_for_relay: bool, allowed_domains: Vec<String>) -> Self {
        Self {
            require_auth_for_relay,
            allowed_domains: allowed_domains.into_iter().map(|d| d.to_ascii_lowercase()).collect(),
        }
    }
}

#[async_trait]
impl feathermail_pipeline::Adapter for SenderDomainValidator {
    async fn mail(&self, from: &str, meta: Meta, state: StageState) -> PhaseOutcome {
        let authorized_by_auth = self.require_auth_for_relay && meta.authenticated();
        let authorized_by_domain = domain_of(from).is_some_and(|domain| self.allowed_domains.contains(&domain));

        if authorized_by_auth || authorized_by_domain {
            PhaseOutcome::pass(meta, state)
        } else {
            PhaseOutcome::halt(HaltReason::SenderDomainNotAuthorized(from.to_string()), state)
        }
    }

    fn format_reason(&self, reason: &HaltReason) -> Option<Reply> {
        match reason {
            HaltReason::SenderDomainNotAuthorized(from) => {
                Some(Reply::new(550, Some("5.7.1"), format!("Sender domain not authorized for relay: {from}")))
            }
            _ => None,
        }
    }
}

/// One pluggable backscatter guard: answers whether a recipient is a known
/// local mailbox.
pub enum Guard {
    StaticList(Vec<String>),
    Regex(Vec<Regex>),
    Maildir(PathBuf),
    AliasFile(std::collections::HashMap<String, Vec<String>>),
}

impl Guard {
    fn answers_yes(&self, to: &str) -> bool {
        match self {
            Self::StaticList(allowed) => allowed.iter().any(|candidate| candidate.eq_ignore_ascii_case(to)),
            Self::Regex(patterns) => patterns.iter().any(|pattern| pattern.is_match(to)),
            Self::Maildir(root) => {
                let Some((local, _)) = split_address(to).ok() else { return false };
                root.join(local).is_dir()
            }
            Self::AliasFile(aliases) => {
                split_address(to).ok().is_some_and(|(local, _)| aliases.contains_key(local))
            }
        }
    }
}

/// `rcpt` — accept if any configured guard recognizes the recipient,
/// otherwise halt (this is the last line of defense against relaying to
/// unknown local mailboxes, hence "backscatter").
pub struct BackscatterGuard {
    guards: Vec<Guard>,
}

impl BackscatterGuard {
    #[must_use]
    pub fn new(guards: Vec<Guard>) -> Self {
        Self { guards }
    }
}

#[async_trait]
impl feathermail_pipeline::Adapter for BackscatterGuard {
    async fn rcpt(&self, to: &str, meta: Meta, state: StageState) -> PhaseOutcome {
        if self.guards.iter().any(|guard| guard.answers_yes(to)) {
            PhaseOutcome::pass(meta, state)
        } else {
            PhaseOutcome::halt(HaltReason::UserUnknown(to.to_string()), state)
        }
    }

    fn format_reason(&self, reason: &HaltReason) -> Option<Reply> {
        match reason {
            HaltReason::UserUnknown(to) => Some(Reply::new(550, Some("5.1.1"), format!("User unknown: {to}"))),
            _ => None,
        }
    }
}

#[must_use]
pub fn fresh_state() -> StageState {
    noop_state()
}

#[cfg(test)]
mod tests {
    use super::*;
    use feathermail_pipeline::Adapter;

    fn meta() -> Meta {
        Meta::new("203.0.113.9".parse().unwrap())
    }

    #[tokio::test]
    async fn simple_access_matches_pattern() {
        let stage = SimpleAccess::new(&[r"^[\w.]+@example\.com$".to_string()]).unwrap();
        let outcome = stage.rcpt("alice@example.com", meta(), noop_state()).await;
        assert!(matches!(outcome, PhaseOutcome::Continue { .. }));
        let outcome = stage.rcpt("alice@other.com", meta(), noop_state()).await;
        assert!(matches!(outcome, PhaseOutcome::Halt { .. }));
    }

    #[tokio::test]
    async fn relay_control_allows_local_domain() {
        let stage = RelayControl::new(vec!["example.com".to_string()], &[]);
        let outcome = stage.rcpt("bob@example.com", meta(), noop_state()).await;
        assert!(matches!(outcome, PhaseOutcome::Continue { .. }));
    }

    #[tokio::test]
    async fn relay_control_denies_unrelated_anonymous_recipient() {
        let stage = RelayControl::new(vec!["example.com".to_string()], &[]);
        let outcome = stage.rcpt("bob@elsewhere.com", meta(), noop_state()).await;
        assert!(matches!(outcome, PhaseOutcome::Halt { .. }));
    }

    #[test]
    fn ip_filter_blocks_configured_range() {
        let stage = IpFilter::new(&["203.0.113.0/24".to_string()]);
        let domain: ClientName = "client.example".parse().unwrap();
        let outcome = stage.helo(&domain, meta(), noop_state());
        assert!(matches!(outcome, PhaseOutcome::Halt { reason: HaltReason::IpBlocked, .. }));
    }
}
