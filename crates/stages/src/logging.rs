//! `MailLogger`: a pass-through stage on every phase that emits one line
//! per event to each configured backend (`Console`/`File`/`Syslog`). Plain
//! line writes, no rotation or RFC 5424 formatter — this is per-session
//! event tracing, not a standalone log-dispatch service.

use std::io::Write as _;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use feathermail_pipeline::{ClientName, Credentials, HaltReason, Meta, PhaseOutcome, StageState, TerminationReason};

/// One log sink a `MailLogger` can write lines to. Failures are swallowed
/// at the call site — a broken backend must never fail a mail transaction.
pub trait LogBackend: Send + Sync {
    fn write(&self, line: &str);
}

pub struct Console;

impl LogBackend for Console {
    fn write(&self, line: &str) {
        println!("{line}");
    }
}

pub struct File {
    path: PathBuf,
}

impl File {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl LogBackend for File {
    fn write(&self, line: &str) {
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(error) = result {
            tracing::warn!(%error, path = %self.path.display(), "mail logger: file backend write failed");
        }
    }
}

/// Connectionless syslog push: bind an ephemeral local socket once, then
/// send a datagram per line.
pub struct Syslog {
    socket: Mutex<Option<UdpSocket>>,
    address: String,
}

impl Syslog {
    #[must_use]
    pub fn new(address: String) -> Self {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .and_then(|socket| socket.connect(&address).map(|()| socket))
            .map_err(|error| tracing::warn!(%error, %address, "mail logger: could not reach syslog address"))
            .ok();
        Self { socket: Mutex::new(socket), address }
    }
}

impl LogBackend for Syslog {
    fn write(&self, line: &str) {
        let guard = self.socket.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match guard.as_ref() {
            Some(socket) => {
                if let Err(error) = socket.send(line.as_bytes()) {
                    tracing::warn!(%error, address = %self.address, "mail logger: syslog send failed");
                }
            }
            None => tracing::warn!(address = %self.address, "mail logger: syslog socket unavailable"),
        }
    }
}

struct SessionLog {
    id: String,
    start: Instant,
}

impl SessionLog {
    fn elapsed_ms(&self) -> u128 {
        self.start.elapsed().as_millis()
    }
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// `helo`/`auth`/`mail`/`rcpt`/`data`/`terminate` — pass-through on every
/// phase, emitting one line per event.
pub struct MailLogger {
    backends: Vec<Box<dyn LogBackend>>,
    sanitize: bool,
}

impl MailLogger {
    #[must_use]
    pub fn new(backends: Vec<Box<dyn LogBackend>>, sanitize: bool) -> Self {
        Self { backends, sanitize }
    }

    #[must_use]
    pub fn fresh_state() -> StageState {
        Box::new(SessionLog { id: new_session_id(), start: Instant::now() })
    }

    fn emit(&self, log: &SessionLog, event: &str) {
        let line = format!("[{}] {}ms {event}", log.id, log.elapsed_ms());
        for backend in &self.backends {
            backend.write(&line);
        }
    }
}

#[async_trait]
impl feathermail_pipeline::Adapter for MailLogger {
    fn helo(&self, domain: &ClientName, meta: Meta, state: StageState) -> PhaseOutcome {
        let log = state.downcast::<SessionLog>().expect("MailLogger state type mismatch");
        self.emit(&log, &format!("HELO {domain}"));
        PhaseOutcome::pass(meta, log)
    }

    async fn auth(&self, cred: &Credentials, meta: Meta, state: StageState) -> PhaseOutcome {
        let log = state.downcast::<SessionLog>().expect("MailLogger state type mismatch");
        let password = if self.sanitize { "***" } else { cred.password.as_str() };
        self.emit(&log, &format!("AUTH authcid={} password={password}", cred.authcid));
        PhaseOutcome::pass(meta, log)
    }

    async fn mail(&self, from: &str, meta: Meta, state: StageState) -> PhaseOutcome {
        let log = state.downcast::<SessionLog>().expect("MailLogger state type mismatch");
        self.emit(&log, &format!("MAIL FROM:<{from}>"));
        PhaseOutcome::pass(meta, log)
    }

    async fn rcpt(&self, to: &str, meta: Meta, state: StageState) -> PhaseOutcome {
        let log = state.downcast::<SessionLog>().expect("MailLogger state type mismatch");
        self.emit(&log, &format!("RCPT TO:<{to}>"));
        PhaseOutcome::pass(meta, log)
    }

    async fn data(&self, raw: &[u8], meta: Meta, state: StageState) -> PhaseOutcome {
        let log = state.downcast::<SessionLog>().expect("MailLogger state type mismatch");
        self.emit(&log, &format!("DATA {} bytes", raw.len()));
        PhaseOutcome::pass(meta, log)
    }

    fn terminate(&self, reason: TerminationReason, _meta: &Meta, state: &StageState) {
        let Some(log) = state.downcast_ref::<SessionLog>() else {
            return;
        };
        self.emit(log, &format!("TERMINATE {reason:?}"));
    }

    fn format_reason(&self, _reason: &HaltReason) -> Option<feathermail_pipeline::Reply> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feathermail_pipeline::Adapter;
    use std::sync::{Arc, Mutex as StdMutex};

    struct Captured(Arc<StdMutex<Vec<String>>>);
    impl LogBackend for Captured {
        fn write(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    #[tokio::test]
    async fn sanitize_masks_password() {
        let captured = Arc::new(StdMutex::new(Vec::new()));
        let stage = MailLogger::new(vec![Box::new(Captured(captured.clone()))], true);
        let state = MailLogger::fresh_state();
        let cred = Credentials { authzid: None, authcid: "alice".to_string(), password: "hunter2".to_string() };
        let meta = Meta::new("127.0.0.1".parse().unwrap());

        let _ = stage.auth(&cred, meta, state).await;
        let lines = captured.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("password=***"));
        assert!(!lines[0].contains("hunter2"));
    }

    #[tokio::test]
    async fn unsanitized_backend_sees_plaintext() {
        let captured = Arc::new(StdMutex::new(Vec::new()));
        let stage = MailLogger::new(vec![Box::new(Captured(captured.clone()))], false);
        let state = MailLogger::fresh_state();
        let cred = Credentials { authzid: None, authcid: "alice".to_string(), password: "hunter2".to_string() };
        let meta = Meta::new("127.0.0.1".parse().unwrap());

        let _ = stage.auth(&cred, meta, state).await;
        assert!(captured.lock().unwrap()[0].contains("hunter2"));
    }
}
