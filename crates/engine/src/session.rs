//! The SMTP session state machine: dispatches each command to its phase
//! across the pipeline, enforcing the transitions and built-in policies
//! this engine guarantees.

use std::net::IpAddr;
use std::sync::Arc;

use feathermail_pipeline::{
    default_halt_reply, Adapter, ClientName, Credentials, Domain, HaltReason, Meta, PhaseOutcome,
    Reply, StageState,
};

use crate::capabilities::{self, TlsMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Greeted,
    Authed,
    InTx,
    DataIn,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Normal,
    ClientDisconnect,
    ProtocolError,
    Fatal,
}

impl From<TerminationReason> for feathermail_pipeline::TerminationReason {
    fn from(value: TerminationReason) -> Self {
        match value {
            TerminationReason::Normal => Self::Normal,
            TerminationReason::ClientDisconnect => Self::ClientDisconnect,
            TerminationReason::ProtocolError => Self::ProtocolError,
            TerminationReason::Fatal => Self::Fatal,
        }
    }
}

/// One adapter instance plus its private per-session state.
type StageEntry = (Arc<dyn Adapter>, StageState);

pub struct Session {
    pub state: SessionState,
    pub tls_mode: TlsMode,
    pub max_message_size: u64,
    pub server_hostname: Domain,
    pub server_name: String,
    meta: Meta,
    stages: Vec<StageEntry>,
}

/// Walks `stages` through one phase hook, threading `meta` across them and
/// short-circuiting on the first `Halt`. Returns the halt reply if one
/// occurred.
macro_rules! walk_phase {
    ($self:expr, |$stage:ident, $meta:ident, $state:ident| $call:expr) => {{
        let stages = std::mem::take(&mut $self.stages);
        let mut current_meta = std::mem::take(&mut $self.meta);
        let mut acc = Vec::with_capacity(stages.len());
        let mut halted = None;
        let mut iter = stages.into_iter();
        for ($stage, $state) in iter.by_ref() {
            let $meta = current_meta;
            match $call {
                PhaseOutcome::Continue { meta, state } => {
                    current_meta = meta;
                    acc.push(($stage, state));
                }
                PhaseOutcome::Halt { reason, state } => {
                    let reply = Session::format_halt(&$stage, &reason);
                    acc.push(($stage, state));
                    halted = Some(reply);
                    break;
                }
            }
        }
        acc.extend(iter);
        $self.stages = acc;
        $self.meta = current_meta;
        halted
    }};
}

impl Session {
    #[must_use]
    pub fn new(
        peer_ip: IpAddr,
        server_hostname: Domain,
        server_name: String,
        tls_mode: TlsMode,
        max_message_size: u64,
        stages: Vec<StageEntry>,
    ) -> Self {
        Self {
            state: SessionState::Connected,
            tls_mode,
            max_message_size,
            server_hostname,
            server_name,
            meta: Meta::new(peer_ip),
            stages,
        }
    }

    #[must_use]
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    fn format_halt(stage: &Arc<dyn Adapter>, reason: &HaltReason) -> Reply {
        stage.format_reason(reason).unwrap_or_else(|| default_halt_reply(reason))
    }

    /// The `220` banner sent immediately on connect.
    #[must_use]
    pub fn greeting(&mut self, session_count: u64) -> String {
        self.state = SessionState::Greeted;
        Reply::new(220, None, format!("{} {} ready {session_count}", self.server_hostname, self.server_name)).to_wire()
    }

    fn ehlo_reply(&self) -> String {
        let caps = capabilities::compute(self.tls_mode, self.meta.tls_active(), self.max_message_size);
        let mut out = String::new();
        out.push_str(&format!("250-{} greets you\r\n", self.server_hostname));
        for (idx, cap) in caps.iter().enumerate() {
            let sep = if idx + 1 == caps.len() { ' ' } else { '-' };
            out.push_str(&format!("250{sep}{cap}\r\n"));
        }
        out
    }

    pub fn dispatch_helo(&mut self, domain: Domain) -> String {
        let client_name: ClientName = domain.clone();
        let halted = walk_phase!(self, |stage, meta, state| stage.helo(&client_name, meta, state));
        if let Some(reply) = halted {
            return reply.to_wire();
        }

        self.meta.set_helo(domain.0);
        if matches!(self.state, SessionState::InTx | SessionState::DataIn) {
            self.meta.reset_envelope();
        }
        self.state = if self.meta.authenticated() { SessionState::Authed } else { SessionState::Greeted };
        self.ehlo_reply()
    }

    pub async fn dispatch_auth(&mut self, credentials: Credentials) -> String {
        let halted = walk_phase!(self, |stage, meta, state| stage.auth(&credentials, meta, state).await);

        if let Some(reply) = halted {
            return reply.to_wire();
        }
        if self.meta.authenticated() {
            self.state = SessionState::Authed;
        }
        Reply::new(235, Some("2.7.0"), "Authentication successful").to_wire()
    }

    pub async fn dispatch_mail(&mut self, from: String) -> String {
        if !self.meta.authenticated() && self.meta.user().is_none() {
            return Reply::new(530, Some("5.7.0"), "Authentication required").to_wire();
        }

        let halted = walk_phase!(self, |stage, meta, state| stage.mail(&from, meta, state).await);

        if let Some(reply) = halted {
            return reply.to_wire();
        }
        self.meta.set_from(from);
        self.state = SessionState::InTx;
        Reply::new(250, None, "OK").to_wire()
    }

    pub async fn dispatch_rcpt(&mut self, to: String) -> String {
        let halted = walk_phase!(self, |stage, meta, state| stage.rcpt(&to, meta, state).await);

        if let Some(reply) = halted {
            return reply.to_wire();
        }
        self.meta.push_rcpt(to);
        Reply::new(250, None, "OK").to_wire()
    }

    /// `354` to enter DATA_IN; the caller is responsible for switching its
    /// reader into raw-line accumulation mode. Returns `None` (no state
    /// change) if no recipient has been accepted yet — the caller should
    /// reply with [`Session::need_rcpt_before_data`] instead.
    pub fn begin_data(&mut self) -> Option<String> {
        if self.meta.to().is_empty() {
            return None;
        }
        self.state = SessionState::DataIn;
        Some(Reply::new(354, None, "Start mail input; end with <CRLF>.<CRLF>").to_wire())
    }

    pub async fn dispatch_data(&mut self, raw: Vec<u8>) -> String {
        let halted = walk_phase!(self, |stage, meta, state| stage.data(&raw, meta, state).await);

        if let Some(reply) = halted {
            return reply.to_wire();
        }
        self.meta.reset_envelope();
        self.state = if self.meta.authenticated() { SessionState::Authed } else { SessionState::Greeted };
        Reply::new(250, Some("2.0.0"), "OK: message accepted").to_wire()
    }

    #[must_use]
    pub fn rset(&mut self) -> String {
        self.meta.reset_envelope();
        self.state = if self.meta.authenticated() { SessionState::Authed } else { SessionState::Greeted };
        Reply::new(250, None, "OK").to_wire()
    }

    #[must_use]
    pub fn vrfy(&self) -> String {
        Reply::new(252, None, "Not supported").to_wire()
    }

    #[must_use]
    pub fn noop(&self) -> String {
        Reply::new(250, None, "OK").to_wire()
    }

    #[must_use]
    pub fn quit(&mut self) -> String {
        self.state = SessionState::Closing;
        Reply::new(221, None, format!("{} closing connection", self.server_hostname)).to_wire()
    }

    #[must_use]
    pub fn unknown_command() -> String {
        Reply::new(500, Some("5.5.2"), "Command unrecognized").to_wire()
    }

    #[must_use]
    pub fn unknown_param() -> String {
        Reply::new(555, Some("5.5.4"), "Unsupported option").to_wire()
    }

    #[must_use]
    pub fn need_rcpt_before_data() -> String {
        Reply::new(503, Some("5.5.1"), "Need RCPT before DATA").to_wire()
    }

    #[must_use]
    pub fn message_too_large() -> String {
        Reply::new(552, Some("5.3.4"), "Message size exceeds fixed limit").to_wire()
    }

    /// Marks TLS active post-handshake; capability state resets implicitly
    /// since `ehlo_reply` recomputes from `tls_active` on the client's
    /// required re-issued EHLO.
    pub fn mark_tls_active(&mut self) {
        self.meta.set_tls_active(true);
    }

    /// Runs every stage's `terminate` hook, in pipeline order, ignoring
    /// return values.
    pub fn terminate(&mut self, reason: TerminationReason) {
        self.state = SessionState::Closing;
        for (stage, state) in &self.stages {
            stage.terminate(reason.into(), &self.meta, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feathermail_pipeline::PhaseOutcome as Outcome;

    struct AllowAll;
    impl Adapter for AllowAll {}

    struct DenyRcpt;
    #[async_trait::async_trait]
    impl Adapter for DenyRcpt {
        async fn rcpt(&self, to: &str, meta: Meta, state: StageState) -> Outcome {
            Outcome::halt(HaltReason::RecipientNotAllowed(to.to_string()), state)
        }
    }

    fn stage(adapter: impl Adapter + 'static) -> StageEntry {
        (Arc::new(adapter), Box::new(()))
    }

    fn new_session(stages: Vec<StageEntry>) -> Session {
        Session::new(
            "127.0.0.1".parse().unwrap(),
            Domain("mail.example.com".to_string()),
            "FeatherMail".to_string(),
            TlsMode::IfAvailable,
            1024,
            stages,
        )
    }

    #[test]
    fn greeting_then_helo_moves_to_greeted() {
        let mut session = new_session(vec![stage(AllowAll)]);
        let greeting = session.greeting(1);
        assert!(greeting.starts_with("220 "));
        let ehlo = session.dispatch_helo(Domain("client.example".to_string()));
        assert!(ehlo.contains("250"));
        assert_eq!(session.state, SessionState::Greeted);
    }

    #[tokio::test]
    async fn mail_without_auth_is_rejected() {
        let mut session = new_session(vec![stage(AllowAll)]);
        session.greeting(1);
        let reply = session.dispatch_mail("alice@example.com".to_string()).await;
        assert!(reply.starts_with("530"));
    }

    #[tokio::test]
    async fn halt_on_rcpt_keeps_remaining_stages_untouched() {
        let mut session = new_session(vec![stage(DenyRcpt), stage(AllowAll)]);
        session.greeting(1);
        session.meta.set_authenticated(true);
        session.dispatch_mail("alice@example.com".to_string()).await;
        let reply = session.dispatch_rcpt("bob@example.com".to_string()).await;
        assert!(reply.starts_with("550"));
        assert!(session.meta.to().is_empty());
        assert_eq!(session.stages.len(), 2);
    }
}
