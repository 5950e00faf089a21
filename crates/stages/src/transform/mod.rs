//! The transformer sub-pipeline: rewrite steps a delivery stage runs over
//! envelope metadata and message body before handing off to its delivery
//! action.

mod alias;
mod dkim;
mod match_rules;
mod srs;

pub use alias::{AliasResolver, FileBasedAliasResolver};
pub use dkim::DkimSigner;
pub use match_rules::{DefaultMailbox, MatchBody, MatchHeader, MatchRcptTo, MatchSender};
pub use srs::{SrsBounceHandler, SrsRewriter};

use feathermail_pipeline::opts::TransformerOpts;
use feathermail_transform::{DataTransform, MetaTransform};

/// One configured transformer, resolved to whichever trait it implements.
pub enum Built {
    Meta(Box<dyn MetaTransform>),
    Data(Box<dyn DataTransform>),
}

/// Instantiates one `TransformerOpts` entry.
pub fn build(opts: &TransformerOpts) -> Result<Built, String> {
    match opts {
        TransformerOpts::AliasResolver { aliases, max_depth } => {
            Ok(Built::Meta(Box::new(AliasResolver::new(aliases.clone(), *max_depth))))
        }
        TransformerOpts::FileBasedAliasResolver { path, reload_interval } => Ok(Built::Meta(Box::new(
            FileBasedAliasResolver::new(path.clone(), *reload_interval, 8)?,
        ))),
        TransformerOpts::SrsRewriter { secret, srs_domain, local_domains } => Ok(Built::Meta(Box::new(
            SrsRewriter::new(secret.clone(), srs_domain.clone(), local_domains.clone()),
        ))),
        TransformerOpts::SrsBounceHandler { secret, max_age_days } => {
            Ok(Built::Meta(Box::new(SrsBounceHandler::new(secret.clone(), *max_age_days))))
        }
        TransformerOpts::MatchSender { rules } => Ok(Built::Meta(Box::new(MatchSender::new(rules)?))),
        TransformerOpts::MatchRcptTo { rules } => Ok(Built::Meta(Box::new(MatchRcptTo::new(rules)?))),
        TransformerOpts::MatchHeader { header, rules } => {
            Ok(Built::Data(Box::new(MatchHeader::new(header.clone(), rules)?)))
        }
        TransformerOpts::MatchBody { rules } => Ok(Built::Data(Box::new(MatchBody::new(rules)?))),
        TransformerOpts::DefaultMailbox { mailbox } => Ok(Built::Meta(Box::new(DefaultMailbox::new(mailbox.clone())))),
        TransformerOpts::DkimSigner { selector, domain, private_key_path, algorithm } => Ok(Built::Data(Box::new(
            DkimSigner::new(selector.clone(), domain.clone(), private_key_path, algorithm)?,
        ))),
    }
}

/// Builds a `meta_transforms` list, rejecting any entry that isn't a
/// metadata-only transformer.
pub fn build_meta_chain(specs: &[TransformerOpts]) -> Result<Vec<Box<dyn MetaTransform>>, String> {
    specs
        .iter()
        .map(|opts| match build(opts)? {
            Built::Meta(transform) => Ok(transform),
            Built::Data(_) => Err("this transformer rewrites message data and cannot be used as a meta_transform".to_string()),
        })
        .collect()
}

/// Builds a `data_transforms` list, rejecting any entry that isn't a
/// data-rewriting transformer.
pub fn build_data_chain(specs: &[TransformerOpts]) -> Result<Vec<Box<dyn DataTransform>>, String> {
    specs
        .iter()
        .map(|opts| match build(opts)? {
            Built::Data(transform) => Ok(transform),
            Built::Meta(_) => Err("this transformer only rewrites metadata and cannot be used as a data_transform".to_string()),
        })
        .collect()
}
