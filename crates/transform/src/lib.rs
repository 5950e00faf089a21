//! The transformer sub-pipeline (C6): the rewrite steps a delivery stage
//! runs over envelope metadata and message body before handing off to its
//! delivery action.

pub mod srs;

use feathermail_pipeline::Meta;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("malformed address `{0}`")]
    MalformedAddress(String),
    #[error("{0}")]
    Rejected(String),
}

/// A pure rewrite of envelope metadata (alias expansion, SRS rewrite of
/// `from`, mailbox tagging).
pub trait MetaTransform: Send + Sync {
    fn transform_meta(&self, meta: Meta) -> Result<Meta, TransformError>;
}

/// A rewrite of both the raw message body and metadata (DKIM signing,
/// header/body pattern matching, SRS bounce decoding).
pub trait DataTransform: Send + Sync {
    fn transform_data(&self, raw: Vec<u8>, meta: Meta) -> Result<(Vec<u8>, Meta), TransformError>;
}

/// Splits `user@domain` into its two halves, rejecting addresses without
/// an `@`.
pub fn split_address(address: &str) -> Result<(&str, &str), TransformError> {
    address
        .split_once('@')
        .ok_or_else(|| TransformError::MalformedAddress(address.to_string()))
}
