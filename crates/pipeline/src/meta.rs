//! The shared envelope metadata map — the sole inter-stage communication
//! channel. Canonical keys get typed accessors; anything else
//! flows through untouched as an open extension key, namespaced by the
//! writing stage's own convention.

use std::net::IpAddr;

/// The shared, mutable envelope map that flows across stages within a
/// session.
#[derive(Debug, Clone, Default)]
pub struct Meta {
    fields: std::collections::HashMap<String, serde_json::Value>,
}

macro_rules! string_field {
    ($get:ident, $set:ident, $key:literal) => {
        #[must_use]
        pub fn $get(&self) -> Option<&str> {
            self.fields.get($key).and_then(serde_json::Value::as_str)
        }

        pub fn $set(&mut self, value: impl Into<String>) {
            self.fields
                .insert($key.to_string(), serde_json::Value::String(value.into()));
        }
    };
}

macro_rules! bool_field {
    ($get:ident, $set:ident, $key:literal) => {
        #[must_use]
        pub fn $get(&self) -> bool {
            self.fields
                .get($key)
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false)
        }

        pub fn $set(&mut self, value: bool) {
            self.fields
                .insert($key.to_string(), serde_json::Value::Bool(value));
        }
    };
}

impl Meta {
    #[must_use]
    pub fn new(peer_ip: IpAddr) -> Self {
        let mut meta = Self::default();
        meta.set_peer_ip(peer_ip);
        meta
    }

    #[must_use]
    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.fields
            .get("peer_ip")
            .and_then(serde_json::Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    pub fn set_peer_ip(&mut self, addr: IpAddr) {
        self.fields.insert(
            "peer_ip".to_string(),
            serde_json::Value::String(addr.to_string()),
        );
    }

    string_field!(helo, set_helo, "helo");
    bool_field!(tls_active, set_tls_active, "tls_active");
    bool_field!(authenticated, set_authenticated, "authenticated");
    string_field!(user, set_user, "user");
    string_field!(from, set_from, "from");
    string_field!(mailbox, set_mailbox, "mailbox");

    #[must_use]
    pub fn to(&self) -> Vec<String> {
        self.fields
            .get("to")
            .and_then(serde_json::Value::as_array)
            .map(|array| {
                array
                    .iter()
                    .filter_map(serde_json::Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_to(&mut self, to: Vec<String>) {
        self.fields.insert(
            "to".to_string(),
            serde_json::Value::Array(to.into_iter().map(serde_json::Value::String).collect()),
        );
    }

    pub fn push_rcpt(&mut self, rcpt: impl Into<String>) {
        let mut to = self.to();
        to.push(rcpt.into());
        self.set_to(to);
    }

    /// Clears the per-transaction keys (`from`, `to`, `mailbox`) on RSET /
    /// after a successful DATA, keeping authentication and TLS state.
    pub fn reset_envelope(&mut self) {
        self.fields.remove("from");
        self.fields.remove("to");
        self.fields.remove("mailbox");
    }

    /// Read a raw (possibly stage-private) key.
    #[must_use]
    pub fn get_raw(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }

    /// Write a raw (possibly stage-private) key. Stage-private keys should
    /// be namespaced, e.g. `"recipient_limit.count"`.
    pub fn set_raw(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.fields.insert(key.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_keeps_auth_and_tls() {
        let mut meta = Meta::new("127.0.0.1".parse().unwrap());
        meta.set_authenticated(true);
        meta.set_user("alice");
        meta.set_tls_active(true);
        meta.set_from("a@b");
        meta.push_rcpt("c@d");

        meta.reset_envelope();

        assert!(meta.authenticated());
        assert_eq!(meta.user(), Some("alice"));
        assert!(meta.tls_active());
        assert_eq!(meta.from(), None);
        assert!(meta.to().is_empty());
    }

    #[test]
    fn rcpt_accumulates_in_order() {
        let mut meta = Meta::new("127.0.0.1".parse().unwrap());
        meta.push_rcpt("a@x");
        meta.push_rcpt("b@x");
        assert_eq!(meta.to(), vec!["a@x".to_string(), "b@x".to_string()]);
    }
}
