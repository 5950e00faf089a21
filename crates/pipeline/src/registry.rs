//! The closed registry of adapter kinds (C4), replacing a dynamically
//! scripted dispatch with a tagged union validated at config-load time.
//!
//! Factories are registered by the binary that owns both this crate and
//! `feathermail-stages`, so `AdapterKind`/`AdapterOpts` stay data-only here
//! and never depend on stage implementations.

use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::{Adapter, SessionCtx, StageState};
use crate::opts::{
    BackscatterGuardOpts, ByDomainOpts, EncryptedProvisionedPasswordOpts, IpFilterOpts,
    LocalFileDeliveryOpts, MailLoggerOpts, MessageRateLimitOpts, NoAuthOpts, PamAuthOpts,
    RecipientLimitOpts, RelayControlOpts, SenderDomainValidatorOpts, SimpleAccessOpts,
    SimpleAuthOpts, UserRateLimitOpts,
};

/// Every adapter kind the reference registry knows how to instantiate.
/// Adding a new stage means adding a variant here, a matching `AdapterOpts`
/// arm, and a factory registration in `main.rs` — never a runtime plugin
/// path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum AdapterKind {
    SimpleAuth,
    EncryptedProvisionedPassword,
    PamAuth,
    NoAuth,
    SimpleAccess,
    RelayControl,
    IpFilter,
    SenderDomainValidator,
    BackscatterGuard,
    MessageRateLimit,
    UserRateLimit,
    RecipientLimit,
    ByDomain,
    LocalFileDelivery,
    MailLogger,
}

/// One configured pipeline element: its kind plus the options that kind
/// needs, deserialized directly from the on-disk pipeline spec.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterOpts {
    SimpleAuth(SimpleAuthOpts),
    EncryptedProvisionedPassword(EncryptedProvisionedPasswordOpts),
    PamAuth(PamAuthOpts),
    NoAuth(NoAuthOpts),
    SimpleAccess(SimpleAccessOpts),
    RelayControl(RelayControlOpts),
    IpFilter(IpFilterOpts),
    SenderDomainValidator(SenderDomainValidatorOpts),
    BackscatterGuard(BackscatterGuardOpts),
    MessageRateLimit(MessageRateLimitOpts),
    UserRateLimit(UserRateLimitOpts),
    RecipientLimit(RecipientLimitOpts),
    ByDomain(ByDomainOpts),
    LocalFileDelivery(LocalFileDeliveryOpts),
    MailLogger(MailLoggerOpts),
}

impl AdapterOpts {
    #[must_use]
    pub const fn kind(&self) -> AdapterKind {
        match self {
            Self::SimpleAuth(_) => AdapterKind::SimpleAuth,
            Self::EncryptedProvisionedPassword(_) => AdapterKind::EncryptedProvisionedPassword,
            Self::PamAuth(_) => AdapterKind::PamAuth,
            Self::NoAuth(_) => AdapterKind::NoAuth,
            Self::SimpleAccess(_) => AdapterKind::SimpleAccess,
            Self::RelayControl(_) => AdapterKind::RelayControl,
            Self::IpFilter(_) => AdapterKind::IpFilter,
            Self::SenderDomainValidator(_) => AdapterKind::SenderDomainValidator,
            Self::BackscatterGuard(_) => AdapterKind::BackscatterGuard,
            Self::MessageRateLimit(_) => AdapterKind::MessageRateLimit,
            Self::UserRateLimit(_) => AdapterKind::UserRateLimit,
            Self::RecipientLimit(_) => AdapterKind::RecipientLimit,
            Self::ByDomain(_) => AdapterKind::ByDomain,
            Self::LocalFileDelivery(_) => AdapterKind::LocalFileDelivery,
            Self::MailLogger(_) => AdapterKind::MailLogger,
        }
    }
}

/// The ordered list of adapters a connection is walked through. Deserialized
/// wholesale from the pipeline config file and swapped atomically on reload
/// (see `feathermail-config`).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct PipelineSpec(pub Vec<AdapterOpts>);

impl PipelineSpec {
    #[must_use]
    pub fn iter(&self) -> std::slice::Iter<'_, AdapterOpts> {
        self.0.iter()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no factory registered for adapter kind `{0}`")]
    UnknownKind(AdapterKind),
    #[error("adapter `{kind}` rejected its configuration: {reason}")]
    InvalidOpts { kind: AdapterKind, reason: String },
}

/// Produces one stage's private per-session state from its opts and the
/// connection's `SessionCtx`. Opts are captured by the factory closure that
/// builds this, matching `init(opts, session_ctx) -> state`.
pub type InitFn = Arc<dyn Fn(&SessionCtx) -> StageState + Send + Sync>;

type Factory = Arc<dyn Fn(&AdapterOpts) -> Result<(Arc<dyn Adapter>, InitFn), String> + Send + Sync>;

/// One compiled pipeline entry: the shared, stateless adapter behavior plus
/// the per-session state factory, in configured order.
#[derive(Clone)]
pub struct CompiledStage {
    pub adapter: Arc<dyn Adapter>,
    pub init: InitFn,
}

/// A pipeline spec with every entry already resolved against the registry —
/// what a new connection is actually walked through. Building this is where
/// adapter construction cost (e.g. loading a keystore file) is paid, once
/// per pipeline load/reload rather than once per connection.
#[derive(Clone)]
pub struct CompiledPipeline {
    pub stages: Vec<CompiledStage>,
}

impl CompiledPipeline {
    /// Runs `init` for every stage against a fresh connection's context,
    /// producing the `(adapter, state)` pairs a `Session` is built from.
    #[must_use]
    pub fn init_session(&self, ctx: &SessionCtx) -> Vec<(Arc<dyn Adapter>, StageState)> {
        self.stages.iter().map(|entry| (entry.adapter.clone(), (entry.init)(ctx))).collect()
    }
}

/// Maps each `AdapterKind` to the closure that builds a live `(Adapter,
/// InitFn)` pair from its options. Populated once at startup by the binary
/// that links `feathermail-stages`.
#[derive(Clone, Default)]
pub struct Registry {
    factories: HashMap<AdapterKind, Factory>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: AdapterKind, factory: F)
    where
        F: Fn(&AdapterOpts) -> Result<(Arc<dyn Adapter>, InitFn), String> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Arc::new(factory));
    }

    /// Builds a live `(adapter, init)` pair from one configured entry.
    pub fn instantiate(&self, opts: &AdapterOpts) -> Result<(Arc<dyn Adapter>, InitFn), RegistryError> {
        let kind = opts.kind();
        let factory = self
            .factories
            .get(&kind)
            .ok_or(RegistryError::UnknownKind(kind))?;
        factory(opts).map_err(|reason| RegistryError::InvalidOpts { kind, reason })
    }

    /// Validates every entry in a pipeline spec without keeping the
    /// instantiated adapters around — used by config reload to reject a bad
    /// file before swapping it in.
    pub fn validate(&self, spec: &PipelineSpec) -> Result<(), RegistryError> {
        for opts in spec.iter() {
            self.instantiate(opts)?;
        }
        Ok(())
    }

    /// Builds every adapter in a pipeline spec, in order, producing the
    /// compiled pipeline sessions are initialized from.
    pub fn compile(&self, spec: &PipelineSpec) -> Result<CompiledPipeline, RegistryError> {
        let stages = spec
            .iter()
            .map(|opts| self.instantiate(opts).map(|(adapter, init)| CompiledStage { adapter, init }))
            .collect::<Result<_, _>>()?;
        Ok(CompiledPipeline { stages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opts::NoAuthOpts;
    use std::net::IpAddr;

    struct Noop;
    impl Adapter for Noop {}

    fn noop_factory(_opts: &AdapterOpts) -> Result<(Arc<dyn Adapter>, InitFn), String> {
        Ok((Arc::new(Noop), Arc::new(|_ctx: &SessionCtx| Box::new(()) as StageState)))
    }

    #[test]
    fn unregistered_kind_is_rejected() {
        let registry = Registry::new();
        let opts = AdapterOpts::NoAuth(NoAuthOpts::default());
        let err = registry.instantiate(&opts).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownKind(AdapterKind::NoAuth)));
    }

    #[test]
    fn registered_factory_builds_and_validates() {
        let mut registry = Registry::new();
        registry.register(AdapterKind::NoAuth, noop_factory);
        let spec = PipelineSpec(vec![AdapterOpts::NoAuth(NoAuthOpts::default())]);
        registry.validate(&spec).unwrap();
        let compiled = registry.compile(&spec).unwrap();
        assert_eq!(compiled.stages.len(), 1);

        let ctx = SessionCtx {
            peer_ip: "127.0.0.1".parse::<IpAddr>().unwrap(),
            tls_active: false,
            server_hostname: crate::wire::Domain("mail.example.com".to_string()),
        };
        assert_eq!(compiled.init_session(&ctx).len(), 1);
    }
}
