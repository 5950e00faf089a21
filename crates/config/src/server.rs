//! The boot-time server configuration document. Loaded once;
//! a later edit to this file only emits a "restart required" log line, it
//! is never applied live.

use std::net::IpAddr;
use std::path::PathBuf;

use feathermail_pipeline::TlsMode;

fn default_port() -> u16 {
    25
}

fn default_max_message_size() -> u64 {
    10 * 1024 * 1024
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionOptions {
    #[serde(default)]
    pub tls_mode: TlsMode,
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
    pub cacerts: Option<PathBuf>,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            tls_mode: TlsMode::default(),
            certfile: None,
            keyfile: None,
            cacerts: None,
            max_message_size: default_max_message_size(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub name: String,
    pub address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    pub domain: String,
    #[serde(default)]
    pub session_options: SessionOptions,
}

impl ServerConfig {
    #[must_use]
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_document_fills_defaults() {
        let json = r#"{"name": "mx1", "address": "0.0.0.0", "domain": "example.com"}"#;
        let cfg: ServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.port, 25);
        assert_eq!(cfg.session_options.tls_mode, TlsMode::IfAvailable);
        assert_eq!(cfg.session_options.max_message_size, default_max_message_size());
    }
}
