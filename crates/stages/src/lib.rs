//! The reference stage library: every `Adapter` the shipped binary knows
//! about, plus the registry wiring (`build_registry`) that turns a `Store`
//! into a fully populated `feathermail_pipeline::Registry`.

pub mod access;
pub mod auth;
pub mod logging;
pub mod ratelimit;
pub mod routing;
pub mod transform;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use feathermail_pipeline::opts::{BackscatterGuardKind, LogBackendOpts};
use feathermail_pipeline::{Adapter, AdapterKind, AdapterOpts, InitFn, Registry, SessionCtx, StageState};
use regex::Regex;

/// Wraps a plain `() -> StageState` fresh-state constructor as an `InitFn`
/// for stages whose per-session state doesn't depend on `SessionCtx`.
fn ignore_ctx<F>(f: F) -> InitFn
where
    F: Fn() -> StageState + Send + Sync + 'static,
{
    Arc::new(move |_ctx: &SessionCtx| f())
}

fn build_guard(kind: &BackscatterGuardKind) -> Result<access::Guard, String> {
    match kind {
        BackscatterGuardKind::StaticList { allowed } => Ok(access::Guard::StaticList(allowed.clone())),
        BackscatterGuardKind::Regex { patterns } => {
            let compiled = patterns
                .iter()
                .map(|pattern| Regex::new(pattern).map_err(|error| format!("invalid pattern `{pattern}`: {error}")))
                .collect::<Result<_, _>>()?;
            Ok(access::Guard::Regex(compiled))
        }
        BackscatterGuardKind::Maildir { root } => Ok(access::Guard::Maildir(root.clone())),
        BackscatterGuardKind::AliasFile { path } => {
            let aliases = feathermail_config::alias::load(path).map_err(|error| error.to_string())?;
            Ok(access::Guard::AliasFile(aliases))
        }
    }
}

fn build_log_backend(opts: &LogBackendOpts) -> Box<dyn logging::LogBackend> {
    match opts {
        LogBackendOpts::Console => Box::new(logging::Console),
        LogBackendOpts::File { path } => Box::new(logging::File::new(path.clone())),
        LogBackendOpts::Syslog { address } => Box::new(logging::Syslog::new(address.clone())),
    }
}

/// Builds the registry the shipped binary registers every `AdapterKind`
/// factory against. `ByDomain` is the one adapter whose factory needs the
/// registry itself (to recursively instantiate its routed sub-adapters); it
/// is wired through a `OnceLock` set right after the registry is built, so
/// its closure can reach back into an `Arc<Registry>` that, at the moment
/// the closure runs, is guaranteed to already be published.
#[must_use]
pub fn build_registry(store: feathermail_store::Store) -> Arc<Registry> {
    let mut registry = Registry::new();

    registry.register(AdapterKind::SimpleAuth, |opts| {
        let AdapterOpts::SimpleAuth(inner) = opts else { return Err("expected SimpleAuth opts".to_string()) };
        let adapter: Arc<dyn Adapter> = Arc::new(auth::SimpleAuth::new(inner.users.clone()));
        Ok((adapter, ignore_ctx(auth::fresh_state)))
    });

    registry.register(AdapterKind::EncryptedProvisionedPassword, |opts| {
        let AdapterOpts::EncryptedProvisionedPassword(inner) = opts else {
            return Err("expected EncryptedProvisionedPassword opts".to_string());
        };
        let secret_key = inner
            .secret_key
            .clone()
            .or_else(|| std::env::var("FEATHER_SECRET_KEY").ok())
            .ok_or_else(|| "EncryptedProvisionedPassword needs secret_key or FEATHER_SECRET_KEY".to_string())?;
        let keystore = feathermail_config::Keystore::load(&inner.keystore_path).map_err(|error| error.to_string())?;
        let adapter: Arc<dyn Adapter> = Arc::new(auth::EncryptedProvisionedPassword::new(keystore, &secret_key));
        Ok((adapter, ignore_ctx(auth::fresh_state)))
    });

    registry.register(AdapterKind::PamAuth, |opts| {
        let AdapterOpts::PamAuth(inner) = opts else { return Err("expected PamAuth opts".to_string()) };
        let adapter: Arc<dyn Adapter> = Arc::new(auth::PamAuth::new(inner.binary.clone()));
        Ok((adapter, ignore_ctx(auth::fresh_state)))
    });

    registry.register(AdapterKind::NoAuth, |opts| {
        let AdapterOpts::NoAuth(inner) = opts else { return Err("expected NoAuth opts".to_string()) };
        let adapter: Arc<dyn Adapter> = Arc::new(auth::NoAuth::new(inner.user.clone()));
        Ok((adapter, ignore_ctx(auth::fresh_state)))
    });

    registry.register(AdapterKind::SimpleAccess, |opts| {
        let AdapterOpts::SimpleAccess(inner) = opts else { return Err("expected SimpleAccess opts".to_string()) };
        let adapter: Arc<dyn Adapter> = Arc::new(access::SimpleAccess::new(&inner.patterns)?);
        Ok((adapter, ignore_ctx(access::fresh_state)))
    });

    registry.register(AdapterKind::RelayControl, |opts| {
        let AdapterOpts::RelayControl(inner) = opts else { return Err("expected RelayControl opts".to_string()) };
        let adapter: Arc<dyn Adapter> = Arc::new(access::RelayControl::new(inner.local_domains.clone(), &inner.trusted_ips));
        Ok((adapter, ignore_ctx(access::fresh_state)))
    });

    registry.register(AdapterKind::IpFilter, |opts| {
        let AdapterOpts::IpFilter(inner) = opts else { return Err("expected IpFilter opts".to_string()) };
        let adapter: Arc<dyn Adapter> = Arc::new(access::IpFilter::new(&inner.blocked_ips));
        Ok((adapter, ignore_ctx(access::fresh_state)))
    });

    registry.register(AdapterKind::SenderDomainValidator, |opts| {
        let AdapterOpts::SenderDomainValidator(inner) = opts else {
            return Err("expected SenderDomainValidator opts".to_string());
        };
        let adapter: Arc<dyn Adapter> =
            Arc::new(access::SenderDomainValidator::new(inner.require_auth_for_relay, inner.allowed_domains.clone()));
        Ok((adapter, ignore_ctx(access::fresh_state)))
    });

    registry.register(AdapterKind::BackscatterGuard, |opts| {
        let AdapterOpts::BackscatterGuard(inner) = opts else { return Err("expected BackscatterGuard opts".to_string()) };
        let guards = inner.guards.iter().map(build_guard).collect::<Result<_, _>>()?;
        let adapter: Arc<dyn Adapter> = Arc::new(access::BackscatterGuard::new(guards));
        Ok((adapter, ignore_ctx(access::fresh_state)))
    });

    {
        let store = store.clone();
        registry.register(AdapterKind::MessageRateLimit, move |opts| {
            let AdapterOpts::MessageRateLimit(inner) = opts else {
                return Err("expected MessageRateLimit opts".to_string());
            };
            let adapter: Arc<dyn Adapter> =
                Arc::new(ratelimit::MessageRateLimit::new(store.clone(), inner.max_messages, inner.time_window, &inner.exempt_ips));
            Ok((adapter, ignore_ctx(ratelimit::fresh_state)))
        });
    }

    {
        let store = store.clone();
        registry.register(AdapterKind::UserRateLimit, move |opts| {
            let AdapterOpts::UserRateLimit(inner) = opts else { return Err("expected UserRateLimit opts".to_string()) };
            let adapter: Arc<dyn Adapter> = Arc::new(ratelimit::UserRateLimit::new(
                store.clone(),
                inner.max_messages,
                inner.time_window,
                inner.exempt_users.clone(),
            ));
            Ok((adapter, ignore_ctx(ratelimit::fresh_state)))
        });
    }

    registry.register(AdapterKind::RecipientLimit, |opts| {
        let AdapterOpts::RecipientLimit(inner) = opts else { return Err("expected RecipientLimit opts".to_string()) };
        let adapter: Arc<dyn Adapter> =
            Arc::new(ratelimit::RecipientLimit::new(inner.max_recipients_anonymous, inner.max_recipients_authenticated));
        let init: InitFn = Arc::new(ratelimit::RecipientLimit::fresh_state);
        Ok((adapter, init))
    });

    registry.register(AdapterKind::LocalFileDelivery, |opts| {
        let AdapterOpts::LocalFileDelivery(inner) = opts else { return Err("expected LocalFileDelivery opts".to_string()) };
        let meta_transforms = transform::build_meta_chain(&inner.meta_transforms)?;
        let data_transforms = transform::build_data_chain(&inner.data_transforms)?;
        let adapter: Arc<dyn Adapter> =
            Arc::new(routing::LocalFileDelivery::new(inner.directory.clone(), meta_transforms, data_transforms));
        Ok((adapter, ignore_ctx(routing::fresh_state)))
    });

    registry.register(AdapterKind::MailLogger, |opts| {
        let AdapterOpts::MailLogger(inner) = opts else { return Err("expected MailLogger opts".to_string()) };
        let backends = inner.backends.iter().map(build_log_backend).collect();
        let adapter: Arc<dyn Adapter> = Arc::new(logging::MailLogger::new(backends, inner.sanitize));
        Ok((adapter, ignore_ctx(logging::MailLogger::fresh_state)))
    });

    let published: Arc<OnceLock<Arc<Registry>>> = Arc::new(OnceLock::new());
    {
        let published = published.clone();
        registry.register(AdapterKind::ByDomain, move |opts| {
            let AdapterOpts::ByDomain(inner) = opts else { return Err("expected ByDomain opts".to_string()) };
            let registry = published.get().expect("registry published before ByDomain is ever instantiated").clone();

            let mut routes = HashMap::new();
            for (domain, route_opts) in &inner.routes {
                let pair = registry.instantiate(route_opts).map_err(|error| error.to_string())?;
                routes.insert(domain.clone(), pair);
            }
            let default = registry.instantiate(&inner.default).map_err(|error| error.to_string())?;

            let adapter: Arc<dyn Adapter> = Arc::new(routing::ByDomain::new(routes, default));
            let init: InitFn = Arc::new(routing::ByDomain::fresh_state);
            Ok((adapter, init))
        });
    }

    let registry = Arc::new(registry);
    let _ = published.set(registry.clone());
    registry
}
