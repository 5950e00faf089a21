//! The connection listener (C8): accepts TCP connections, binds each one
//! to the pipeline snapshot live at accept time, and drives the session
//! engine's command loop until the client disconnects or QUITs.

pub mod conn;
pub mod tls;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use feathermail_config::{PipelineLoader, ServerConfig};
use feathermail_engine::data::{DataAccumulator, FeedOutcome};
use feathermail_engine::{auth, command, Command, Session, TerminationReason};
use feathermail_pipeline::{Credentials, Domain};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::conn::Conn;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind `{0}`: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),
    #[error(transparent)]
    TlsSetup(#[from] tls::TlsSetupError),
}

/// Binds the listening socket and serves connections until the process is
/// asked to stop. Each accepted connection is spawned onto its own task and
/// keeps running against the pipeline snapshot that was live at accept
/// time, even if a reload swaps it out mid-session.
pub async fn serve(config: ServerConfig, pipeline: PipelineLoader) -> Result<(), ServerError> {
    let tls_acceptor = tls::build_acceptor(&config.session_options)?;
    let addr = config.socket_addr();
    let listener = TcpListener::bind(addr).await.map_err(|error| ServerError::Bind(addr, error))?;
    tracing::info!(%addr, "listening");

    let session_count = Arc::new(AtomicU64::new(0));
    let config = Arc::new(config);

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(error) => {
                tracing::warn!(%error, "accept failed");
                continue;
            }
        };

        let config = config.clone();
        let compiled = pipeline.snapshot();
        let tls_acceptor = tls_acceptor.clone();
        let session_count = session_count.clone();

        tokio::spawn(async move {
            let count = session_count.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::info!(%peer_addr, "connection accepted");
            if let Err(error) =
                handle_connection(stream, peer_addr, &config, &compiled, tls_acceptor, count).await
            {
                tracing::warn!(%peer_addr, %error, "connection ended with an error");
            }
        });
    }
}

#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS handshake failed: {0}")]
    Tls(#[source] std::io::Error),
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: &ServerConfig,
    compiled: &feathermail_pipeline::CompiledPipeline,
    tls_acceptor: Option<TlsAcceptor>,
    session_count: u64,
) -> Result<(), ConnectionError> {
    let server_hostname = Domain(config.domain.clone());
    let ctx = feathermail_pipeline::SessionCtx {
        peer_ip: peer_addr.ip(),
        tls_active: false,
        server_hostname: server_hostname.clone(),
    };
    let stages = compiled.init_session(&ctx);

    let tls_mode = config.session_options.tls_mode;
    let max_message_size = config.session_options.max_message_size;
    let mut session = Session::new(
        peer_addr.ip(),
        server_hostname,
        config.name.clone(),
        tls_mode,
        max_message_size,
        stages,
    );

    let mut reader = BufReader::new(Conn::Plain(stream));
    let greeting = session.greeting(session_count);
    write_reply(&mut reader, &greeting).await?;

    let termination = run_command_loop(&mut session, reader, &tls_acceptor).await;
    session.terminate(termination);
    Ok(())
}

async fn write_reply(reader: &mut BufReader<Conn>, reply: &str) -> Result<(), ConnectionError> {
    reader.write_all(reply.as_bytes()).await?;
    reader.flush().await?;
    Ok(())
}

async fn read_line(reader: &mut BufReader<Conn>) -> Result<Option<String>, ConnectionError> {
    let mut line = String::new();
    let read = tokio::time::timeout(feathermail_engine::DEFAULT_IDLE_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| ConnectionError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "idle timeout")))??;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Reads one base64 AUTH continuation line, replying `501` and returning
/// `None` (already answered) on malformed input or client-issued `*`.
async fn read_auth_field(reader: &mut BufReader<Conn>) -> Result<Option<String>, ConnectionError> {
    let Some(line) = read_line(reader).await? else {
        return Ok(None);
    };
    if line == "*" {
        write_reply(reader, "501 5.0.0 Authentication cancelled\r\n").await?;
        return Ok(None);
    }
    match auth::decode_login_field(&line) {
        Ok(field) => Ok(Some(field)),
        Err(_) => {
            write_reply(reader, "501 5.5.2 Malformed auth response\r\n").await?;
            Ok(None)
        }
    }
}

/// Owns the connection reader for the session's command loop; swapped out
/// wholesale on STARTTLS since the underlying transport changes type.
async fn run_command_loop(
    session: &mut Session,
    mut reader: BufReader<Conn>,
    tls_acceptor: &Option<TlsAcceptor>,
) -> TerminationReason {
    let mut oversize_strikes: u32 = 0;
    loop {
        let line = match read_line(&mut reader).await {
            Ok(Some(line)) => line,
            Ok(None) => return TerminationReason::ClientDisconnect,
            Err(_) => return TerminationReason::ProtocolError,
        };

        let command = command::parse(&line);
        let reply = match command {
            Command::Helo(domain) | Command::Ehlo(domain) => {
                session.dispatch_helo(domain.parse().unwrap_or_else(|_| Domain(domain)))
            }
            Command::StartTls => {
                let Some(acceptor) = tls_acceptor.clone() else {
                    if write_reply(&mut reader, "454 4.7.0 TLS not available\r\n").await.is_err() {
                        return TerminationReason::ProtocolError;
                    }
                    continue;
                };
                if write_reply(&mut reader, "220 2.0.0 Ready to start TLS\r\n").await.is_err() {
                    return TerminationReason::ProtocolError;
                }
                match upgrade_to_tls(reader, acceptor).await {
                    Ok(upgraded) => {
                        reader = upgraded;
                        session.mark_tls_active();
                        continue;
                    }
                    Err(_) => return TerminationReason::Fatal,
                }
            }
            Command::Auth { mechanism, initial_response } => {
                match dispatch_auth(session, &mut reader, &mechanism, initial_response).await {
                    Ok(reply) => reply,
                    Err(()) => continue,
                }
            }
            Command::MailFrom { address, params } => {
                if command::unknown_param(&params, command::KNOWN_MAIL_PARAMS) {
                    Session::unknown_param()
                } else {
                    session.dispatch_mail(address).await
                }
            }
            Command::RcptTo { address, params } => {
                if command::unknown_param(&params, command::KNOWN_RCPT_PARAMS) {
                    Session::unknown_param()
                } else {
                    session.dispatch_rcpt(address).await
                }
            }
            Command::Data => {
                let Some(begin) = session.begin_data() else {
                    if write_reply(&mut reader, &Session::need_rcpt_before_data()).await.is_err() {
                        return TerminationReason::ProtocolError;
                    }
                    continue;
                };
                if write_reply(&mut reader, &begin).await.is_err() {
                    return TerminationReason::ProtocolError;
                }
                match accumulate_data(&mut reader, session.max_message_size).await {
                    Ok(raw) => {
                        oversize_strikes = 0;
                        session.dispatch_data(raw).await
                    }
                    Err(too_large) if too_large => {
                        oversize_strikes += 1;
                        if oversize_strikes >= 2 {
                            let _ = write_reply(&mut reader, &Session::message_too_large()).await;
                            return TerminationReason::ProtocolError;
                        }
                        Session::message_too_large()
                    }
                    Err(_) => return TerminationReason::ClientDisconnect,
                }
            }
            Command::Rset => session.rset(),
            Command::Vrfy(_) => session.vrfy(),
            Command::Noop => session.noop(),
            Command::Quit => {
                let reply = session.quit();
                let _ = write_reply(&mut reader, &reply).await;
                return TerminationReason::Normal;
            }
            Command::Unknown(_) => Session::unknown_command(),
        };

        if write_reply(&mut reader, &reply).await.is_err() {
            return TerminationReason::ProtocolError;
        }
    }
}

async fn dispatch_auth(
    session: &mut Session,
    reader: &mut BufReader<Conn>,
    mechanism: &str,
    initial_response: Option<String>,
) -> Result<String, ()> {
    let credentials = match mechanism {
        "PLAIN" => {
            let response = match initial_response {
                Some(response) => response,
                None => {
                    write_reply(reader, "334 \r\n").await.map_err(|_| ())?;
                    read_line(reader).await.map_err(|_| ())?.ok_or(())?
                }
            };
            match auth::decode_plain(&response) {
                Ok(creds) => creds,
                Err(_) => {
                    write_reply(reader, "501 5.5.2 Malformed auth response\r\n").await.map_err(|_| ())?;
                    return Err(());
                }
            }
        }
        "LOGIN" => {
            write_reply(reader, &format!("334 {}\r\n", auth::encode_b64_prompt("Username:"))).await.map_err(|_| ())?;
            let username = read_auth_field(reader).await.map_err(|_| ())?.ok_or(())?;
            write_reply(reader, &format!("334 {}\r\n", auth::encode_b64_prompt("Password:"))).await.map_err(|_| ())?;
            let password = read_auth_field(reader).await.map_err(|_| ())?.ok_or(())?;
            Credentials { authzid: None, authcid: username, password }
        }
        _ => {
            write_reply(reader, "504 5.5.4 Unrecognized authentication mechanism\r\n").await.map_err(|_| ())?;
            return Err(());
        }
    };

    Ok(session.dispatch_auth(credentials).await)
}

/// Feeds lines into a `DataAccumulator` until the terminator is seen.
/// Returns `Err(true)` if the message exceeded the size limit, `Err(false)`
/// on client disconnect.
async fn accumulate_data(reader: &mut BufReader<Conn>, max_size: u64) -> Result<Vec<u8>, bool> {
    let mut acc = DataAccumulator::new(max_size);
    loop {
        let line = read_line(reader).await.map_err(|_| false)?.ok_or(false)?;
        match acc.feed_line(&line) {
            FeedOutcome::Continue => {}
            FeedOutcome::Done => return Ok(acc.into_message()),
            FeedOutcome::TooLarge => return Err(true),
        }
    }
}

/// Consumes the plain-TCP reader and performs the TLS handshake, returning a
/// fresh reader over the upgraded transport. Any bytes still buffered in the
/// old reader (there should be none — clients must not pipeline across
/// STARTTLS) are discarded.
async fn upgrade_to_tls(reader: BufReader<Conn>, acceptor: TlsAcceptor) -> Result<BufReader<Conn>, ConnectionError> {
    let Conn::Plain(stream) = reader.into_inner() else {
        unreachable!("STARTTLS only runs once, before any prior upgrade");
    };
    let tls_stream = acceptor.accept(stream).await.map_err(ConnectionError::Tls)?;
    Ok(BufReader::new(Conn::Tls(Box::new(tls_stream))))
}
