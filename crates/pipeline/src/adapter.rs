//! The Adapter Contract: the abstract stage interface every pipeline
//! element implements. Each hook is optional — the default body is
//! pass-through, so the engine never has to special-case a stage that
//! doesn't care about a given phase.

use std::any::Any;
use std::net::IpAddr;
use std::time::Duration;

use crate::meta::Meta;
use crate::wire::{ClientName, Credentials, Domain, Reply};

/// Read-only context handed to a stage's `init` at construction time.
#[derive(Debug, Clone)]
pub struct SessionCtx {
    pub peer_ip: IpAddr,
    pub tls_active: bool,
    pub server_hostname: Domain,
}

/// Opaque per-stage state, downcast by the owning stage's own hooks. A
/// downcast failure here is a programming bug (the registry's factory and
/// the stage's hooks must agree on the concrete type), not a runtime
/// condition to branch on.
pub type StageState = Box<dyn Any + Send>;

/// Reasons a rate limiter halted a transaction, used to render the correct
/// scope-specific reply text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    Ip,
    User,
}

/// The canonical set of halt reasons emitted by the reference stages (C9),
/// plus an escape hatch for adapters this registry doesn't anticipate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    InvalidCredentials,
    AuthFailed { output: String, code: i32 },
    RecipientNotAllowed(String),
    RelayingDenied(String),
    IpBlocked,
    SenderDomainNotAuthorized(String),
    UserUnknown(String),
    RateLimitExceeded {
        scope: RateLimitScope,
        identity: String,
        max: u64,
        window: Duration,
    },
    TooManyRecipients(u32),
    TransientFailure(String),
    Custom(String),
}

/// Why a session ended; passed to every stage's `terminate` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Normal,
    ClientDisconnect,
    ProtocolError,
    Fatal,
}

/// What a phase hook returns: either continue with (possibly rewritten)
/// meta and updated private state, or halt with a reason and updated
/// private state.
pub enum PhaseOutcome {
    Continue { meta: Meta, state: StageState },
    Halt { reason: HaltReason, state: StageState },
}

impl PhaseOutcome {
    #[must_use]
    pub fn pass(meta: Meta, state: StageState) -> Self {
        Self::Continue { meta, state }
    }

    #[must_use]
    pub fn halt(reason: HaltReason, state: StageState) -> Self {
        Self::Halt { reason, state }
    }
}

/// The abstract stage interface. Default method bodies are pass-through: an
/// absent hook behaves as if that phase never touched the stage at all.
#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
    fn helo(&self, _domain: &ClientName, meta: Meta, state: StageState) -> PhaseOutcome {
        PhaseOutcome::pass(meta, state)
    }

    async fn auth(&self, _cred: &Credentials, meta: Meta, state: StageState) -> PhaseOutcome {
        PhaseOutcome::pass(meta, state)
    }

    async fn mail(&self, _from: &str, meta: Meta, state: StageState) -> PhaseOutcome {
        PhaseOutcome::pass(meta, state)
    }

    async fn rcpt(&self, _to: &str, meta: Meta, state: StageState) -> PhaseOutcome {
        PhaseOutcome::pass(meta, state)
    }

    async fn data(&self, _raw: &[u8], meta: Meta, state: StageState) -> PhaseOutcome {
        PhaseOutcome::pass(meta, state)
    }

    /// Invoked once at session end, in pipeline order, for every stage that
    /// was configured (regardless of how far the session advanced).
    fn terminate(&self, _reason: TerminationReason, _meta: &Meta, _state: &StageState) {}

    /// Render a halt reason as a full SMTP reply line, or `None` to let the
    /// engine substitute the default `550 <debug-printed reason>`.
    fn format_reason(&self, _reason: &HaltReason) -> Option<Reply> {
        None
    }
}

/// The default reply the engine substitutes when a stage's
/// `format_reason` returns `None`.
#[must_use]
pub fn default_halt_reply(reason: &HaltReason) -> Reply {
    Reply::new(550, None, format!("{reason:?}"))
}
