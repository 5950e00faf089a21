//! Loads the pipeline config file and keeps it hot-reloadable: on change,
//! re-parse, validate against the registry, compile, and only then swap the
//! live `ArcSwap`. A bad reload keeps the previous pipeline and logs.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;

use arc_swap::ArcSwap;
use feathermail_pipeline::{CompiledPipeline, PipelineSpec, Registry};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};

use crate::ConfigError;

fn parse_pipeline_file(path: &Path) -> Result<PipelineSpec, ConfigError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|error| ConfigError::FileOpen(path.to_path_buf(), error))?;
    let deser = &mut serde_json::Deserializer::from_str(&contents);
    serde_path_to_error::deserialize(deser)
        .map_err(|error| ConfigError::Deserialize(path.to_path_buf(), error))
}

fn load_and_compile(path: &Path, registry: &Registry) -> Result<CompiledPipeline, ConfigError> {
    let spec = parse_pipeline_file(path)?;
    Ok(registry.compile(&spec)?)
}

/// Owns the live compiled pipeline. Cloning shares the same underlying
/// `ArcSwap` — every clone observes the same reloads.
#[derive(Clone)]
pub struct PipelineLoader {
    path: PathBuf,
    registry: Arc<Registry>,
    current: Arc<ArcSwap<CompiledPipeline>>,
}

impl PipelineLoader {
    /// Loads, validates, and compiles the pipeline file once, at boot.
    pub fn load(path: impl Into<PathBuf>, registry: Arc<Registry>) -> Result<Self, ConfigError> {
        let path = path.into();
        let compiled = load_and_compile(&path, &registry)?;
        Ok(Self {
            path,
            registry,
            current: Arc::new(ArcSwap::from_pointee(compiled)),
        })
    }

    /// A snapshot handle sessions should read the compiled pipeline
    /// through. Bound once per connection at accept time: a session keeps
    /// running against the pipeline that was live when it started, even if
    /// a reload swaps a new one in mid-session.
    #[must_use]
    pub fn handle(&self) -> Arc<ArcSwap<CompiledPipeline>> {
        self.current.clone()
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<CompiledPipeline> {
        self.current.load_full()
    }

    /// Spawns a blocking thread watching the pipeline file; each change
    /// event triggers a re-parse/validate/compile/swap. Runs until the
    /// returned watcher is dropped.
    pub fn spawn_watcher(&self) -> notify::Result<RecommendedWatcher> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = RecommendedWatcher::new(tx, notify::Config::default())?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        let path = self.path.clone();
        let registry = self.registry.clone();
        let current = self.current.clone();
        std::thread::spawn(move || {
            for event in rx {
                match event {
                    Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                        match load_and_compile(&path, &registry) {
                            Ok(compiled) => {
                                tracing::info!(path = %path.display(), "pipeline spec reloaded");
                                current.store(Arc::new(compiled));
                            }
                            Err(error) => {
                                tracing::error!(path = %path.display(), %error, "pipeline reload rejected, keeping previous spec");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(%error, "pipeline file watch error");
                    }
                }
            }
        });

        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feathermail_pipeline::{Adapter, AdapterKind, InitFn, SessionCtx, StageState};
    use std::sync::Arc as StdArc;

    fn registry_with_noauth() -> Arc<Registry> {
        struct Noop;
        impl Adapter for Noop {}
        let mut registry = Registry::new();
        registry.register(AdapterKind::NoAuth, |_opts| {
            let init: InitFn = StdArc::new(|_ctx: &SessionCtx| Box::new(()) as StageState);
            Ok((StdArc::new(Noop) as StdArc<dyn Adapter>, init))
        });
        Arc::new(registry)
    }

    #[test]
    fn loads_and_validates_at_boot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"[{"kind": "no_auth"}]"#).unwrap();

        let loader = PipelineLoader::load(&path, registry_with_noauth()).unwrap();
        assert_eq!(loader.snapshot().stages.len(), 1);
    }

    #[test]
    fn rejects_unknown_kind_at_boot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"[{"kind": "pam_auth", "binary": "pam"}]"#).unwrap();

        let err = PipelineLoader::load(&path, registry_with_noauth()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPipeline(_)));
    }
}
