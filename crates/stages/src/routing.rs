//! Delivery stages: `ByDomain` fans a transaction out to per-domain delivery
//! adapters; `LocalFileDelivery` writes one file per
//! recipient under a maildir-ish directory tree after running its
//! configured transformer chain.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use feathermail_pipeline::{Adapter, HaltReason, InitFn, Meta, PhaseOutcome, Reply, SessionCtx, StageState};
use feathermail_transform::{DataTransform, MetaTransform};

fn noop_state() -> StageState {
    Box::new(())
}

fn group_by_domain(recipients: &[String]) -> HashMap<String, Vec<String>> {
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    for rcpt in recipients {
        let domain = rcpt.rsplit_once('@').map_or_else(String::new, |(_, domain)| domain.to_ascii_lowercase());
        groups.entry(domain).or_default().push(rcpt.clone());
    }
    groups
}

/// `data` — groups `meta.to` by recipient domain, hands each group's subset
/// to `routes[domain]` (falling back to `routes.default`), and propagates
/// the first halt encountered.
pub struct ByDomain {
    routes: HashMap<String, (Arc<dyn Adapter>, InitFn)>,
    default: (Arc<dyn Adapter>, InitFn),
}

impl ByDomain {
    #[must_use]
    pub fn new(routes: HashMap<String, (Arc<dyn Adapter>, InitFn)>, default: (Arc<dyn Adapter>, InitFn)) -> Self {
        Self { routes, default }
    }

    #[must_use]
    pub fn fresh_state(ctx: &SessionCtx) -> StageState {
        Box::new(ctx.clone())
    }

    fn route_for(&self, domain: &str) -> &(Arc<dyn Adapter>, InitFn) {
        self.routes.get(domain).unwrap_or(&self.default)
    }
}

#[async_trait]
impl Adapter for ByDomain {
    async fn data(&self, raw: &[u8], meta: Meta, state: StageState) -> PhaseOutcome {
        let ctx = state.downcast::<SessionCtx>().expect("ByDomain state type mismatch");
        let groups = group_by_domain(&meta.to());

        let mut current = meta;
        for (domain, subset) in groups {
            let (adapter, init) = self.route_for(&domain);
            let mut group_meta = current.clone();
            group_meta.set_to(subset);
            let sub_state = init(&ctx);

            match adapter.data(raw, group_meta, sub_state).await {
                PhaseOutcome::Continue { meta: group_meta, .. } => {
                    current = group_meta;
                }
                PhaseOutcome::Halt { reason, .. } => {
                    return PhaseOutcome::halt(reason, ctx);
                }
            }
        }

        PhaseOutcome::pass(current, ctx)
    }

    fn format_reason(&self, reason: &HaltReason) -> Option<Reply> {
        self.routes
            .values()
            .chain(std::iter::once(&self.default))
            .find_map(|(adapter, _)| adapter.format_reason(reason))
    }
}

/// `data` — runs the configured transformer chain, then writes one file per
/// recipient under `<directory>/<local-part>/<ts>-<rand>.eml`.
pub struct LocalFileDelivery {
    directory: PathBuf,
    meta_transforms: Vec<Box<dyn MetaTransform>>,
    data_transforms: Vec<Box<dyn DataTransform>>,
}

impl LocalFileDelivery {
    #[must_use]
    pub fn new(
        directory: PathBuf,
        meta_transforms: Vec<Box<dyn MetaTransform>>,
        data_transforms: Vec<Box<dyn DataTransform>>,
    ) -> Self {
        Self { directory, meta_transforms, data_transforms }
    }

    fn file_stem() -> String {
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
        let rand: u32 = {
            use std::hash::{Hash, Hasher};
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            std::thread::current().id().hash(&mut hasher);
            ts.hash(&mut hasher);
            (hasher.finish() & 0xffff) as u32
        };
        format!("{ts}-{rand:04x}")
    }

    async fn write_one(&self, local: &str, raw: &[u8]) -> std::io::Result<()> {
        let dir = self.directory.join(local);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.eml", Self::file_stem()));
        tokio::fs::write(path, raw).await
    }
}

#[async_trait]
impl Adapter for LocalFileDelivery {
    async fn data(&self, raw: &[u8], meta: Meta, state: StageState) -> PhaseOutcome {
        let mut meta = meta;
        for transform in &self.meta_transforms {
            match transform.transform_meta(meta) {
                Ok(next) => meta = next,
                Err(error) => return PhaseOutcome::halt(HaltReason::TransientFailure(error.to_string()), state),
            }
        }

        let mut data = raw.to_vec();
        for transform in &self.data_transforms {
            match transform.transform_data(data, meta) {
                Ok((next_data, next_meta)) => {
                    data = next_data;
                    meta = next_meta;
                }
                Err(error) => return PhaseOutcome::halt(HaltReason::TransientFailure(error.to_string()), state),
            }
        }

        for rcpt in meta.to() {
            let local = rcpt.split_once('@').map_or(rcpt.as_str(), |(local, _)| local);
            if let Err(error) = self.write_one(local, &data).await {
                tracing::warn!(%error, recipient = %rcpt, "local file delivery failed");
                return PhaseOutcome::halt(HaltReason::TransientFailure(error.to_string()), state);
            }
        }

        PhaseOutcome::pass(meta, state)
    }
}

#[must_use]
pub fn fresh_state() -> StageState {
    noop_state()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn ctx() -> SessionCtx {
        SessionCtx {
            peer_ip: "127.0.0.1".parse::<IpAddr>().unwrap(),
            tls_active: false,
            server_hostname: feathermail_pipeline::Domain("mail.example.com".to_string()),
        }
    }

    #[tokio::test]
    async fn local_file_delivery_writes_one_file_per_recipient() {
        let dir = tempfile::tempdir().unwrap();
        let stage = LocalFileDelivery::new(dir.path().to_path_buf(), vec![], vec![]);
        let mut meta = Meta::new("127.0.0.1".parse().unwrap());
        meta.set_to(vec!["bob@elsewhere.com".to_string()]);

        let outcome = stage.data(b"Subject: hi\r\n\r\nhi\r\n", meta, noop_state()).await;
        assert!(matches!(outcome, PhaseOutcome::Continue { .. }));

        let bob_dir = dir.path().join("bob");
        let entries: Vec<_> = std::fs::read_dir(bob_dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn by_domain_routes_to_default_and_propagates_meta() {
        let dir = tempfile::tempdir().unwrap();
        let delivery = Arc::new(LocalFileDelivery::new(dir.path().to_path_buf(), vec![], vec![]));
        let default_init: InitFn = Arc::new(|_ctx: &SessionCtx| Box::new(()) as StageState);
        let stage = ByDomain::new(HashMap::new(), (delivery, default_init));

        let mut meta = Meta::new("127.0.0.1".parse().unwrap());
        meta.set_to(vec!["bob@elsewhere.com".to_string(), "carol@elsewhere.com".to_string()]);

        let state = ByDomain::fresh_state(&ctx());
        let outcome = stage.data(b"hi\r\n", meta, state).await;
        assert!(matches!(outcome, PhaseOutcome::Continue { .. }));

        let elsewhere_bob = dir.path().join("bob");
        assert!(elsewhere_bob.is_dir());
    }
}
