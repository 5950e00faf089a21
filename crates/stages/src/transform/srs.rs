//! `SrsRewriter` / `SrsBounceHandler`: thin `MetaTransform` wrappers around
//! `feathermail_transform::srs`.

use std::time::SystemTime;

use feathermail_pipeline::Meta;
use feathermail_transform::{split_address, srs, MetaTransform, TransformError};

/// Rewrites `from` to an `SRS0=...` address at the configured SRS domain
/// once any recipient's domain falls outside the local set.
pub struct SrsRewriter {
    secret: String,
    srs_domain: String,
    local_domains: Vec<String>,
}

impl SrsRewriter {
    #[must_use]
    pub fn new(secret: String, srs_domain: String, local_domains: Vec<String>) -> Self {
        Self { secret, srs_domain, local_domains }
    }

    fn has_external_recipient(&self, meta: &Meta) -> bool {
        meta.to().iter().any(|rcpt| match split_address(rcpt) {
            Ok((_, domain)) => !self.local_domains.iter().any(|local| local.eq_ignore_ascii_case(domain)),
            Err(_) => true,
        })
    }
}

impl MetaTransform for SrsRewriter {
    fn transform_meta(&self, mut meta: Meta) -> Result<Meta, TransformError> {
        if !self.has_external_recipient(&meta) {
            return Ok(meta);
        }
        let Some(from) = meta.from() else {
            return Ok(meta);
        };
        let (local, domain) = split_address(from)?;
        let rewritten = srs::rewrite(&self.secret, domain, local, &self.srs_domain, SystemTime::now());
        meta.set_from(rewritten);
        Ok(meta)
    }
}

/// Decodes a bounce recipient's `SRS0=...` local part back to its original
/// address once the embedded HMAC and age check out.
pub struct SrsBounceHandler {
    secret: String,
    max_age_days: u32,
}

impl SrsBounceHandler {
    #[must_use]
    pub fn new(secret: String, max_age_days: u32) -> Self {
        Self { secret, max_age_days }
    }
}

impl MetaTransform for SrsBounceHandler {
    fn transform_meta(&self, mut meta: Meta) -> Result<Meta, TransformError> {
        let rewritten: Vec<String> = meta
            .to()
            .into_iter()
            .map(|rcpt| self.decode_one(&rcpt))
            .collect();
        meta.set_to(rewritten);
        Ok(meta)
    }
}

impl SrsBounceHandler {
    fn decode_one(&self, rcpt: &str) -> String {
        let Ok((local, _domain)) = split_address(rcpt) else {
            return rcpt.to_string();
        };
        let Ok(address) = srs::parse(local) else {
            return rcpt.to_string();
        };
        match srs::validate(&address, &self.secret, self.max_age_days, SystemTime::now()) {
            Ok(()) => format!("{}@{}", address.orig_local, address.orig_domain),
            Err(error) => {
                tracing::warn!(%error, %rcpt, "SRS bounce validation failed, leaving recipient unchanged");
                rcpt.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_from_for_external_recipient() {
        let stage = SrsRewriter::new("shh".to_string(), "srs.example.com".to_string(), vec!["example.com".to_string()]);
        let mut meta = Meta::new("127.0.0.1".parse().unwrap());
        meta.set_from("alice@example.com");
        meta.set_to(vec!["bob@elsewhere.com".to_string()]);
        let meta = stage.transform_meta(meta).unwrap();
        assert!(meta.from().unwrap().starts_with("SRS0="));
        assert!(meta.from().unwrap().ends_with("@srs.example.com"));
    }

    #[test]
    fn leaves_internal_only_transaction_untouched() {
        let stage = SrsRewriter::new("shh".to_string(), "srs.example.com".to_string(), vec!["example.com".to_string()]);
        let mut meta = Meta::new("127.0.0.1".parse().unwrap());
        meta.set_from("alice@example.com");
        meta.set_to(vec!["bob@example.com".to_string()]);
        let meta = stage.transform_meta(meta).unwrap();
        assert_eq!(meta.from(), Some("alice@example.com"));
    }

    #[test]
    fn bounce_handler_recovers_original_recipient() {
        let rewritten = srs::rewrite("shh", "example.com", "alice", "srs.example.com", SystemTime::now());
        let handler = SrsBounceHandler::new("shh".to_string(), 21);
        let mut meta = Meta::new("127.0.0.1".parse().unwrap());
        meta.set_to(vec![rewritten]);
        let meta = handler.transform_meta(meta).unwrap();
        assert_eq!(meta.to(), vec!["alice@example.com".to_string()]);
    }
}
