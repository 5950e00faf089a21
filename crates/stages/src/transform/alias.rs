//! `AliasResolver` / `FileBasedAliasResolver`: recursive `/etc/aliases`-style
//! expansion with cycle detection and a depth bound, using
//! `feathermail_config::alias`'s file format.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use feathermail_pipeline::Meta;
use feathermail_transform::{split_address, MetaTransform, TransformError};
use parking_lot::Mutex;

fn expand_rec(
    aliases: &HashMap<String, Vec<String>>,
    local: &str,
    domain: &str,
    depth: u32,
    max_depth: u32,
    seen: &mut HashSet<String>,
    out: &mut Vec<String>,
) -> Result<(), TransformError> {
    if depth > max_depth {
        return Err(TransformError::Rejected(format!("alias expansion exceeded max depth at {local}@{domain}")));
    }
    let key = format!("{local}@{domain}");
    match aliases.get(local) {
        None => {
            out.push(key);
            Ok(())
        }
        Some(targets) => {
            if !seen.insert(key.clone()) {
                return Err(TransformError::Rejected(format!("alias cycle detected at {key}")));
            }
            for target in targets {
                match split_address(target) {
                    Ok((t_local, t_domain)) => expand_rec(aliases, t_local, t_domain, depth + 1, max_depth, seen, out)?,
                    Err(_) => expand_rec(aliases, target, domain, depth + 1, max_depth, seen, out)?,
                }
            }
            Ok(())
        }
    }
}

fn expand_recipients(
    aliases: &HashMap<String, Vec<String>>,
    max_depth: u32,
    recipients: &[String],
) -> Result<Vec<String>, TransformError> {
    let mut out = Vec::new();
    for rcpt in recipients {
        let (local, domain) = split_address(rcpt)?;
        let mut seen = HashSet::new();
        expand_rec(aliases, local, domain, 0, max_depth, &mut seen, &mut out)?;
    }
    Ok(out)
}

/// Expands `meta.to` against a static, config-supplied alias table.
pub struct AliasResolver {
    aliases: HashMap<String, Vec<String>>,
    max_depth: u32,
}

impl AliasResolver {
    #[must_use]
    pub fn new(aliases: HashMap<String, Vec<String>>, max_depth: u32) -> Self {
        Self { aliases, max_depth }
    }
}

impl MetaTransform for AliasResolver {
    fn transform_meta(&self, mut meta: Meta) -> Result<Meta, TransformError> {
        let expanded = expand_recipients(&self.aliases, self.max_depth, &meta.to())?;
        meta.set_to(expanded);
        Ok(meta)
    }
}

struct Cache {
    aliases: HashMap<String, Vec<String>>,
    loaded_at: Instant,
}

/// Same expansion semantics as `AliasResolver`, but reads the table from an
/// on-disk `/etc/aliases`-format file, re-reading it once `reload_interval`
/// has elapsed since the last read.
pub struct FileBasedAliasResolver {
    path: PathBuf,
    reload_interval: Duration,
    max_depth: u32,
    cache: Mutex<Cache>,
}

impl FileBasedAliasResolver {
    pub fn new(path: PathBuf, reload_interval: Duration, max_depth: u32) -> Result<Self, String> {
        let aliases = feathermail_config::alias::load(&path).map_err(|error| error.to_string())?;
        Ok(Self { path, reload_interval, max_depth, cache: Mutex::new(Cache { aliases, loaded_at: Instant::now() }) })
    }

    fn current(&self) -> HashMap<String, Vec<String>> {
        let mut cache = self.cache.lock();
        if cache.loaded_at.elapsed() >= self.reload_interval {
            match feathermail_config::alias::load(&self.path) {
                Ok(aliases) => {
                    cache.aliases = aliases;
                    cache.loaded_at = Instant::now();
                }
                Err(error) => {
                    tracing::warn!(%error, path = %self.path.display(), "alias file reload failed, keeping stale table");
                }
            }
        }
        cache.aliases.clone()
    }
}

impl MetaTransform for FileBasedAliasResolver {
    fn transform_meta(&self, mut meta: Meta) -> Result<Meta, TransformError> {
        let aliases = self.current();
        let expanded = expand_recipients(&aliases, self.max_depth, &meta.to())?;
        meta.set_to(expanded);
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_one_level() {
        let aliases = HashMap::from([("team".to_string(), vec!["alice".to_string(), "bob".to_string()])]);
        let resolver = AliasResolver::new(aliases, 8);
        let mut meta = Meta::new("127.0.0.1".parse().unwrap());
        meta.set_to(vec!["team@example.com".to_string()]);
        let meta = resolver.transform_meta(meta).unwrap();
        assert_eq!(meta.to(), vec!["alice@example.com".to_string(), "bob@example.com".to_string()]);
    }

    #[test]
    fn detects_cycle() {
        let aliases = HashMap::from([
            ("a".to_string(), vec!["b".to_string()]),
            ("b".to_string(), vec!["a".to_string()]),
        ]);
        let resolver = AliasResolver::new(aliases, 8);
        let mut meta = Meta::new("127.0.0.1".parse().unwrap());
        meta.set_to(vec!["a@example.com".to_string()]);
        assert!(resolver.transform_meta(meta).is_err());
    }

    #[test]
    fn external_target_keeps_its_own_domain() {
        let aliases = HashMap::from([("alice".to_string(), vec!["alice@external.test".to_string()])]);
        let resolver = AliasResolver::new(aliases, 8);
        let mut meta = Meta::new("127.0.0.1".parse().unwrap());
        meta.set_to(vec!["alice@example.com".to_string()]);
        let meta = resolver.transform_meta(meta).unwrap();
        assert_eq!(meta.to(), vec!["alice@external.test".to_string()]);
    }
}
