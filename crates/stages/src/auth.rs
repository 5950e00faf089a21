//! Authentication stages: `SimpleAuth`, `EncryptedProvisionedPassword`,
//! `PamAuth`, `NoAuth`.

use std::collections::HashMap;
use std::process::Stdio;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use feathermail_config::Keystore;
use feathermail_pipeline::{Credentials, HaltReason, Meta, PhaseOutcome, Reply, StageState};
use sha2::{Digest, Sha256};

fn noop_state() -> StageState {
    Box::new(())
}

/// `auth` against a static `user -> password` map loaded from the pipeline
/// spec itself.
pub struct SimpleAuth {
    users: HashMap<String, String>,
}

impl SimpleAuth {
    #[must_use]
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl feathermail_pipeline::Adapter for SimpleAuth {
    async fn auth(&self, cred: &Credentials, mut meta: Meta, state: StageState) -> PhaseOutcome {
        match self.users.get(&cred.authcid) {
            Some(password) if password == &cred.password => {
                meta.set_user(cred.authcid.clone());
                meta.set_authenticated(true);
                PhaseOutcome::pass(meta, state)
            }
            _ => PhaseOutcome::halt(HaltReason::InvalidCredentials, state),
        }
    }

    fn format_reason(&self, reason: &HaltReason) -> Option<Reply> {
        matches!(reason, HaltReason::InvalidCredentials)
            .then(|| Reply::new(535, None, "Authentication failed"))
    }
}

#[derive(Debug, serde::Deserialize)]
struct EncryptedEnvelope {
    #[serde(with = "base64_field")]
    iv: Vec<u8>,
    #[serde(with = "base64_field")]
    ciphertext: Vec<u8>,
    #[serde(with = "base64_field")]
    tag: Vec<u8>,
}

mod base64_field {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

/// `auth` — the client's "password" is a base64 JSON envelope
/// `{iv, ciphertext, tag}`; decrypts with AES-256-GCM under
/// `SHA-256(secret_key)`, then checks the plaintext against a bcrypt hash
/// looked up by username in a keystore loaded once at construction.
pub struct EncryptedProvisionedPassword {
    keystore: Keystore,
    key: [u8; 32],
}

impl EncryptedProvisionedPassword {
    #[must_use]
    pub fn new(keystore: Keystore, secret_key: &str) -> Self {
        let key: [u8; 32] = Sha256::digest(secret_key.as_bytes()).into();
        Self { keystore, key }
    }

    fn decrypt(&self, encoded: &str) -> Option<String> {
        use base64::Engine as _;
        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
        let envelope: EncryptedEnvelope = serde_json::from_slice(&bytes).ok()?;
        if envelope.iv.len() != 12 {
            return None;
        }
        let cipher = Aes256Gcm::new_from_slice(&self.key).ok()?;
        let nonce = Nonce::from_slice(&envelope.iv);
        let mut combined = envelope.ciphertext.clone();
        combined.extend_from_slice(&envelope.tag);
        let plaintext = cipher.decrypt(nonce, combined.as_ref()).ok()?;
        String::from_utf8(plaintext).ok()
    }
}

#[async_trait]
impl feathermail_pipeline::Adapter for EncryptedProvisionedPassword {
    async fn auth(&self, cred: &Credentials, mut meta: Meta, state: StageState) -> PhaseOutcome {
        let Some(plaintext) = self.decrypt(&cred.password) else {
            return PhaseOutcome::halt(HaltReason::InvalidCredentials, state);
        };
        let Some(entry) = self.keystore.get(&cred.authcid) else {
            return PhaseOutcome::halt(HaltReason::InvalidCredentials, state);
        };
        match bcrypt::verify(&plaintext, &entry.hashed_password) {
            Ok(true) => {
                meta.set_user(cred.authcid.clone());
                meta.set_authenticated(true);
                PhaseOutcome::pass(meta, state)
            }
            _ => PhaseOutcome::halt(HaltReason::InvalidCredentials, state),
        }
    }

    fn format_reason(&self, reason: &HaltReason) -> Option<Reply> {
        matches!(reason, HaltReason::InvalidCredentials)
            .then(|| Reply::new(535, None, "Authentication failed"))
    }
}

/// `auth` — shells out to an external `pam_auth <user> <pass>` binary;
/// exit code 0 authenticates, anything else halts with its output.
pub struct PamAuth {
    binary: std::path::PathBuf,
}

impl PamAuth {
    #[must_use]
    pub fn new(binary: std::path::PathBuf) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl feathermail_pipeline::Adapter for PamAuth {
    async fn auth(&self, cred: &Credentials, mut meta: Meta, state: StageState) -> PhaseOutcome {
        let output = tokio::process::Command::new(&self.binary)
            .arg(&cred.authcid)
            .arg(&cred.password)
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                meta.set_user(cred.authcid.clone());
                meta.set_authenticated(true);
                PhaseOutcome::pass(meta, state)
            }
            Ok(output) => {
                let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
                let code = output.status.code().unwrap_or(-1);
                PhaseOutcome::halt(HaltReason::AuthFailed { output: text, code }, state)
            }
            Err(error) => PhaseOutcome::halt(
                HaltReason::AuthFailed { output: error.to_string(), code: -1 },
                state,
            ),
        }
    }

    fn format_reason(&self, reason: &HaltReason) -> Option<Reply> {
        match reason {
            HaltReason::AuthFailed { output, .. } => {
                Some(Reply::new(535, None, format!("Authentication failed: {output}")))
            }
            _ => None,
        }
    }
}

/// `auth`/`mail` — unconditionally authenticates, explicitly bypassing the
/// engine's MAIL FROM authentication wall; `mail` is plain pass-through.
pub struct NoAuth {
    user: String,
}

impl NoAuth {
    #[must_use]
    pub fn new(user: Option<String>) -> Self {
        Self { user: user.unwrap_or_else(|| "trusted@localhost".to_string()) }
    }
}

#[async_trait]
impl feathermail_pipeline::Adapter for NoAuth {
    async fn auth(&self, _cred: &Credentials, mut meta: Meta, state: StageState) -> PhaseOutcome {
        meta.set_user(self.user.clone());
        meta.set_authenticated(true);
        PhaseOutcome::pass(meta, state)
    }

    async fn mail(&self, _from: &str, meta: Meta, state: StageState) -> PhaseOutcome {
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
    use feathermail_pipeline::Adapter;

    fn meta() -> Meta {
        Meta::new("127.0.0.1".parse().unwrap())
    }

    #[tokio::test]
    async fn simple_auth_accepts_matching_password() {
        let stage = SimpleAuth::new(HashMap::from([("alice".to_string(), "secret".to_string())]));
        let cred = Credentials { authzid: None, authcid: "alice".to_string(), password: "secret".to_string() };
        let outcome = stage.auth(&cred, meta(), noop_state()).await;
        match outcome {
            PhaseOutcome::Continue { meta, .. } => {
                assert!(meta.authenticated());
                assert_eq!(meta.user(), Some("alice"));
            }
            PhaseOutcome::Halt { .. } => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn simple_auth_rejects_wrong_password() {
        let stage = SimpleAuth::new(HashMap::from([("alice".to_string(), "secret".to_string())]));
        let cred = Credentials { authzid: None, authcid: "alice".to_string(), password: "wrong".to_string() };
        let outcome = stage.auth(&cred, meta(), noop_state()).await;
        assert!(matches!(outcome, PhaseOutcome::Halt { reason: HaltReason::InvalidCredentials, .. }));
    }

    #[tokio::test]
    async fn no_auth_sets_default_user() {
        let stage = NoAuth::new(None);
        let cred = Credentials { authzid: None, authcid: "anyone".to_string(), password: String::new() };
        let outcome = stage.auth(&cred, meta(), noop_state()).await;
        match outcome {
            PhaseOutcome::Continue { meta, .. } => assert_eq!(meta.user(), Some("trusted@localhost")),
            PhaseOutcome::Halt { .. } => panic!("NoAuth never halts"),
        }
    }
}
