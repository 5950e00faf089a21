//! Typed configuration records for each adapter kind in the reference
//! registry (C9). These are pure data — the behavior lives in
//! `feathermail-stages`, which depends on this crate for the shapes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::registry::AdapterOpts;

fn default_recipient_limit_authenticated() -> u32 {
    100
}

fn default_recipient_limit_anonymous() -> u32 {
    10
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SimpleAuthOpts {
    /// username -> plaintext password.
    pub users: HashMap<String, String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EncryptedProvisionedPasswordOpts {
    pub keystore_path: PathBuf,
    /// Overrides `FEATHER_SECRET_KEY` when set.
    #[serde(default)]
    pub secret_key: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PamAuthOpts {
    #[serde(default = "PamAuthOpts::default_binary")]
    pub binary: PathBuf,
}

impl PamAuthOpts {
    fn default_binary() -> PathBuf {
        PathBuf::from("pam_auth")
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct NoAuthOpts {
    pub user: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SimpleAccessOpts {
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RelayControlOpts {
    #[serde(default)]
    pub local_domains: Vec<String>,
    #[serde(default)]
    pub trusted_ips: Vec<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct IpFilterOpts {
    pub blocked_ips: Vec<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SenderDomainValidatorOpts {
    #[serde(default)]
    pub require_auth_for_relay: bool,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackscatterGuardKind {
    StaticList { allowed: Vec<String> },
    Regex { patterns: Vec<String> },
    Maildir { root: PathBuf },
    AliasFile { path: PathBuf },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BackscatterGuardOpts {
    pub guards: Vec<BackscatterGuardKind>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MessageRateLimitOpts {
    pub max_messages: u64,
    #[serde(with = "humantime_serde")]
    pub time_window: Duration,
    #[serde(default)]
    pub exempt_ips: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UserRateLimitOpts {
    pub max_messages: u64,
    #[serde(with = "humantime_serde")]
    pub time_window: Duration,
    #[serde(default)]
    pub exempt_users: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RecipientLimitOpts {
    #[serde(default = "default_recipient_limit_anonymous")]
    pub max_recipients_anonymous: u32,
    #[serde(default = "default_recipient_limit_authenticated")]
    pub max_recipients_authenticated: u32,
}

impl Default for RecipientLimitOpts {
    fn default() -> Self {
        Self {
            max_recipients_anonymous: default_recipient_limit_anonymous(),
            max_recipients_authenticated: default_recipient_limit_authenticated(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformerOpts {
    AliasResolver {
        aliases: HashMap<String, Vec<String>>,
        #[serde(default = "TransformerOpts::default_max_depth")]
        max_depth: u32,
    },
    FileBasedAliasResolver {
        path: PathBuf,
        #[serde(with = "humantime_serde")]
        reload_interval: Duration,
    },
    SrsRewriter {
        secret: String,
        srs_domain: String,
        local_domains: Vec<String>,
    },
    SrsBounceHandler {
        secret: String,
        #[serde(default = "TransformerOpts::default_max_age_days")]
        max_age_days: u32,
    },
    MatchSender {
        /// (pattern, mailbox) pairs, first match wins.
        rules: Vec<(String, String)>,
    },
    MatchRcptTo {
        rules: Vec<(String, String)>,
    },
    MatchHeader {
        header: String,
        rules: Vec<(String, String)>,
    },
    MatchBody {
        rules: Vec<(String, String)>,
    },
    DefaultMailbox {
        mailbox: String,
    },
    DkimSigner {
        selector: String,
        domain: String,
        private_key_path: PathBuf,
        #[serde(default = "TransformerOpts::default_algorithm")]
        algorithm: String,
    },
}

impl TransformerOpts {
    const fn default_max_depth() -> u32 {
        8
    }

    const fn default_max_age_days() -> u32 {
        21
    }

    fn default_algorithm() -> String {
        "rsa-sha256".to_string()
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct LocalFileDeliveryOpts {
    pub directory: PathBuf,
    #[serde(default)]
    pub meta_transforms: Vec<TransformerOpts>,
    #[serde(default)]
    pub data_transforms: Vec<TransformerOpts>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ByDomainOpts {
    pub routes: HashMap<String, AdapterOpts>,
    pub default: Box<AdapterOpts>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogBackendOpts {
    Console,
    File { path: PathBuf },
    Syslog { address: String },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MailLoggerOpts {
    pub backends: Vec<LogBackendOpts>,
    #[serde(default = "MailLoggerOpts::default_sanitize")]
    pub sanitize: bool,
}

impl MailLoggerOpts {
    const fn default_sanitize() -> bool {
        true
    }
}
