//! Rate-limiting stages, all keyed into the shared process-wide TTL
//! `Store`: `MessageRateLimit`, `UserRateLimit`, `RecipientLimit`.

use std::time::Duration;

use async_trait::async_trait;
use feathermail_ipmatch::{ip_matches, parse_rule_or_drop, IpRule};
use feathermail_pipeline::{HaltReason, Meta, PhaseOutcome, RateLimitScope, Reply, SessionCtx, StageState};
use feathermail_store::Store;

fn noop_state() -> StageState {
    Box::new(())
}

/// `mail` — exempts peers matching a configured rule, otherwise increments
/// `ratelimit:ip:<peer>` and halts once the window's count exceeds the
/// configured maximum. A store failure fails open.
pub struct MessageRateLimit {
    store: Store,
    max_messages: u64,
    time_window: Duration,
    exempt_ips: Vec<IpRule>,
}

impl MessageRateLimit {
    #[must_use]
    pub fn new(store: Store, max_messages: u64, time_window: Duration, exempt_ips: &[String]) -> Self {
        Self {
            store,
            max_messages,
            time_window,
            exempt_ips: exempt_ips.iter().filter_map(|rule| parse_rule_or_drop(rule)).collect(),
        }
    }
}

#[async_trait]
impl feathermail_pipeline::Adapter for MessageRateLimit {
    async fn mail(&self, _from: &str, meta: Meta, state: StageState) -> PhaseOutcome {
        let Some(peer) = meta.peer_ip() else {
            return PhaseOutcome::pass(meta, state);
        };
        if self.exempt_ips.iter().any(|rule| ip_matches(&peer, rule)) {
            return PhaseOutcome::pass(meta, state);
        }

        let key = format!("ratelimit:ip:{peer}");
        match self.store.increment(&key, 1, Some(self.time_window)) {
            Ok(count) if count as u64 > self.max_messages => PhaseOutcome::halt(
                HaltReason::RateLimitExceeded {
                    scope: RateLimitScope::Ip,
                    identity: peer.to_string(),
                    max: self.max_messages,
                    window: self.time_window,
                },
                state,
            ),
            _ => PhaseOutcome::pass(meta, state),
        }
    }

    fn format_reason(&self, reason: &HaltReason) -> Option<Reply> {
        match reason {
            HaltReason::RateLimitExceeded { scope: RateLimitScope::Ip, max, window, .. } => Some(Reply::new(
                450,
                Some("4.7.1"),
                format!(
                    "Rate limit exceeded: too many messages from your IP (max: {max} per {})",
                    humantime::format_duration(*window)
                ),
            )),
            _ => None,
        }
    }
}

/// `mail` — only applies once `meta.user` is set and not in the exempt set.
pub struct UserRateLimit {
    store: Store,
    max_messages: u64,
    time_window: Duration,
    exempt_users: Vec<String>,
}

impl UserRateLimit {
    #[must_use]
    pub fn new(store: Store, max_messages: u64, time_window: Duration, exempt_users: Vec<String>) -> Self {
        Self { store, max_messages, time_window, exempt_users }
    }
}

#[async_trait]
impl feathermail_pipeline::Adapter for UserRateLimit {
    async fn mail(&self, _from: &str, meta: Meta, state: StageState) -> PhaseOutcome {
        let Some(user) = meta.user() else {
            return PhaseOutcome::pass(meta, state);
        };
        if self.exempt_users.iter().any(|exempt| exempt == user) {
            return PhaseOutcome::pass(meta, state);
        }

        let key = format!("ratelimit:user:{user}");
        match self.store.increment(&key, 1, Some(self.time_window)) {
            Ok(count) if count as u64 > self.max_messages => {
                let identity = user.to_string();
                PhaseOutcome::halt(
                    HaltReason::RateLimitExceeded {
                        scope: RateLimitScope::User,
                        identity,
                        max: self.max_messages,
                        window: self.time_window,
                    },
                    state,
                )
            }
            _ => PhaseOutcome::pass(meta, state),
        }
    }

    fn format_reason(&self, reason: &HaltReason) -> Option<Reply> {
        match reason {
            HaltReason::RateLimitExceeded { scope: RateLimitScope::User, identity, max, window } => Some(Reply::new(
                450,
                Some("4.7.1"),
                format!(
                    "Rate limit exceeded: too many messages from user '{identity}' (max: {max} per {})",
                    humantime::format_duration(*window)
                ),
            )),
            _ => None,
        }
    }
}

struct RecipientCount(u32);

/// `rcpt` — a per-session counter (private stage state, not the shared
/// store) whose ceiling depends on whether the session is authenticated.
pub struct RecipientLimit {
    max_anonymous: u32,
    max_authenticated: u32,
}

impl RecipientLimit {
    #[must_use]
    pub fn new(max_anonymous: u32, max_authenticated: u32) -> Self {
        Self { max_anonymous, max_authenticated }
    }

    #[must_use]
    pub fn fresh_state(_ctx: &SessionCtx) -> StageState {
        Box::new(RecipientCount(0))
    }
}

#[async_trait]
impl feathermail_pipeline::Adapter for RecipientLimit {
    async fn rcpt(&self, _to: &str, meta: Meta, state: StageState) -> PhaseOutcome {
        let mut count = *state.downcast::<RecipientCount>().expect("RecipientLimit state type mismatch");
        count.0 += 1;

        let limit = if meta.authenticated() { self.max_authenticated } else { self.max_anonymous };
        if count.0 > limit {
            PhaseOutcome::halt(HaltReason::TooManyRecipients(limit), Box::new(count))
        } else {
            PhaseOutcome::pass(meta, Box::new(count))
        }
    }

    fn format_reason(&self, reason: &HaltReason) -> Option<Reply> {
        match reason {
            HaltReason::TooManyRecipients(max) => {
                Some(Reply::new(452, Some("4.5.3"), format!("Too many recipients (max: {max})")))
            }
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

    fn ctx() -> SessionCtx {
        SessionCtx {
            peer_ip: "198.51.100.5".parse().unwrap(),
            tls_active: false,
            server_hostname: feathermail_pipeline::Domain("mail.example.com".to_string()),
        }
    }

    #[tokio::test]
    async fn message_rate_limit_halts_after_max() {
        let store = Store::new();
        let stage = MessageRateLimit::new(store, 2, Duration::from_secs(60), &[]);
        let meta = Meta::new("198.51.100.5".parse().unwrap());
        assert!(matches!(stage.mail("a@b", meta.clone(), noop_state()).await, PhaseOutcome::Continue { .. }));
        assert!(matches!(stage.mail("a@b", meta.clone(), noop_state()).await, PhaseOutcome::Continue { .. }));
        assert!(matches!(stage.mail("a@b", meta, noop_state()).await, PhaseOutcome::Halt { .. }));
    }

    #[tokio::test]
    async fn recipient_limit_counts_across_session() {
        let stage = RecipientLimit::new(1, 10);
        let meta = Meta::new("127.0.0.1".parse().unwrap());
        let state = RecipientLimit::fresh_state(&ctx());
        let outcome = stage.rcpt("a@b", meta.clone(), state).await;
        let PhaseOutcome::Continue { state, .. } = outcome else { panic!("first rcpt should pass") };
        let outcome = stage.rcpt("c@d", meta, state).await;
        assert!(matches!(outcome, PhaseOutcome::Halt { reason: HaltReason::TooManyRecipients(1), .. }));
    }
}
