/*
 * server.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Cassetta, a personal email server.
 *
 * Cassetta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Cassetta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Cassetta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! SMTP server: per-connection state machine for reception and
//! authenticated submission. The hosting application supplies
//! authentication and the message sink through [`SmtpApp`].

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;

use super::{parse_path, split_verb};
use crate::dns::BoxFuture;
use crate::error::UserError;
use crate::sasl::{
    decode_b64, parse_plain, Mechanism, LOGIN_PASSWORD_CHALLENGE, LOGIN_USERNAME_CHALLENGE,
};
use crate::shutdown::CancelToken;

/// Longest accepted command line; DATA lines may be longer.
const MAX_COMMAND_LINE: usize = 4096;
const MAX_DATA_LINE: usize = 1024 * 1024;

pub struct SmtpConfig {
    pub hostname: String,
    pub max_size: u64,
    pub max_recipients: usize,
    pub max_sessions: usize,
    /// Permit mail commands on plaintext connections. Off in production.
    pub allow_no_tls: bool,
    /// STARTTLS support; absent means the capability is not advertised.
    pub tls: Option<TlsAcceptor>,
    /// Advertise AUTH PLAIN LOGIN.
    pub auth_enabled: bool,
}

/// The hosting application behind the server.
pub trait SmtpApp: Send + Sync {
    /// Verify credentials; a non-zero opaque token on success, 0 on
    /// failure. Throttling happens behind this call.
    fn authenticate<'a>(
        &'a self,
        remote: &'a str,
        username: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, u64>;

    /// Open a message transaction for MAIL FROM.
    fn start_message(
        &self,
        sender: &str,
        auth_token: u64,
    ) -> Result<Box<dyn SmtpTransaction>, UserError>;
}

/// One MAIL transaction: recipients, data lines, then commit or cancel.
pub trait SmtpTransaction: Send {
    /// Whether to accept this recipient (`Ok(false)` refuses politely).
    fn add_recipient(&mut self, recipient: &str) -> Result<bool, UserError>;

    /// One unstuffed data line, terminator not included.
    fn data_line(&mut self, line: &[u8]) -> Result<(), UserError>;

    fn commit(&mut self) -> Result<(), UserError>;

    fn cancel(&mut self);
}

/// Why a session loop returned.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEnd {
    Quit,
    /// Client asked for TLS; the caller upgrades the socket and runs a
    /// fresh loop on the secured stream.
    StartTls,
    Eof,
}

pub struct SmtpServer {
    config: Arc<SmtpConfig>,
    app: Arc<dyn SmtpApp>,
    sessions: Arc<Semaphore>,
    cancel: CancelToken,
}

impl SmtpServer {
    pub fn new(config: SmtpConfig, app: Arc<dyn SmtpApp>, cancel: CancelToken) -> Self {
        let sessions = Arc::new(Semaphore::new(config.max_sessions));
        Self {
            config: Arc::new(config),
            app,
            sessions,
            cancel,
        }
    }

    /// Accept loop. Accepts block while all session slots are taken;
    /// accept errors back off exponentially from 5 ms to 1 s.
    pub async fn serve(&self, listener: TcpListener) {
        let mut backoff = Duration::from_millis(5);
        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&self.sessions).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
                _ = self.cancel.cancelled() => return,
            };
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.cancel.cancelled() => return,
            };
            match accepted {
                Ok((stream, remote)) => {
                    backoff = Duration::from_millis(5);
                    let config = Arc::clone(&self.config);
                    let app = Arc::clone(&self.app);
                    let cancel = self.cancel.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let remote = remote.to_string();
                        if let Err(e) = handle_connection(&config, &app, &cancel, stream, &remote).await
                        {
                            tracing::debug!(remote = %remote, error = %e, "smtp session ended");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "accept failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(1));
                }
            }
        }
    }

    /// Resolve when every session slot is free again (shutdown drain).
    pub async fn wait_idle(&self) {
        let max = self.config.max_sessions;
        while self.sessions.available_permits() < max {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

async fn handle_connection(
    config: &Arc<SmtpConfig>,
    app: &Arc<dyn SmtpApp>,
    cancel: &CancelToken,
    mut stream: tokio::net::TcpStream,
    remote: &str,
) -> io::Result<()> {
    match run_session(config, app, cancel, &mut stream, remote, false).await? {
        SessionEnd::StartTls => {
            let Some(acceptor) = config.tls.clone() else {
                return Ok(());
            };
            let mut tls = acceptor.accept(stream).await?;
            let end = run_session(config, app, cancel, &mut tls, remote, true).await?;
            if end != SessionEnd::Eof {
                let _ = tls.shutdown().await;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

struct LineReader {
    buf: Vec<u8>,
    pos: usize,
}

impl LineReader {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            pos: 0,
        }
    }

    /// One line without its terminator, plus whether it ended in CRLF.
    /// `Ok(None)` on EOF with no pending bytes.
    async fn read_line<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
        max: usize,
    ) -> io::Result<Option<(Vec<u8>, bool)>> {
        loop {
            if let Some(nl) = self.buf[self.pos..].iter().position(|&b| b == b'\n') {
                let start = self.pos;
                let end = start + nl;
                let crlf = end > start && self.buf[end - 1] == b'\r';
                let line = self.buf[start..if crlf { end - 1 } else { end }].to_vec();
                self.pos = end + 1;
                if self.pos >= self.buf.len() {
                    self.buf.clear();
                    self.pos = 0;
                }
                return Ok(Some((line, crlf)));
            }
            if self.buf.len() - self.pos > max {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                if self.pos < self.buf.len() {
                    let line = self.buf[self.pos..].to_vec();
                    self.buf.clear();
                    self.pos = 0;
                    return Ok(Some((line, false)));
                }
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

async fn send<S: AsyncWrite + Unpin>(stream: &mut S, line: &str) -> io::Result<()> {
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await
}

struct Session<'a> {
    app: &'a Arc<dyn SmtpApp>,
    remote: &'a str,
    tls_active: bool,
    helo_done: bool,
    auth_token: u64,
    txn: Option<Box<dyn SmtpTransaction>>,
    rcpt_count: usize,
}

impl Session<'_> {
    fn reset_txn(&mut self) {
        if let Some(mut txn) = self.txn.take() {
            txn.cancel();
        }
        self.rcpt_count = 0;
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.reset_txn();
    }
}

/// Run the command loop on `stream` until QUIT, STARTTLS, EOF, or a
/// framing violation. Used directly by tests over in-memory streams.
pub async fn run_session<S: AsyncRead + AsyncWrite + Unpin>(
    config: &Arc<SmtpConfig>,
    app: &Arc<dyn SmtpApp>,
    cancel: &CancelToken,
    stream: &mut S,
    remote: &str,
    tls_active: bool,
) -> io::Result<SessionEnd> {
    let mut session = Session {
        app,
        remote,
        tls_active,
        helo_done: false,
        auth_token: 0,
        txn: None,
        rcpt_count: 0,
    };
    let mut reader = LineReader::new();
    if !tls_active {
        send(stream, &format!("220 {} ESMTP ready", config.hostname)).await?;
    }

    loop {
        if cancel.is_cancelled() {
            send(stream, "421 4.3.2 Service shutting down").await?;
            return Ok(SessionEnd::Quit);
        }
        let line = tokio::select! {
            line = reader.read_line(stream, MAX_COMMAND_LINE) => line?,
            _ = cancel.cancelled() => {
                send(stream, "421 4.3.2 Service shutting down").await?;
                return Ok(SessionEnd::Quit);
            }
        };
        let Some((line, crlf)) = line else {
            return Ok(SessionEnd::Eof);
        };
        if !crlf {
            send(stream, "500 5.5.2 command does not end in CR-LF").await?;
            return Ok(SessionEnd::Quit);
        }
        let text = String::from_utf8_lossy(&line).into_owned();
        let (verb, args) = split_verb(&text);

        // Plaintext gate: nothing but session plumbing before STARTTLS.
        let exempt = matches!(verb.as_str(), "HELO" | "EHLO" | "STARTTLS" | "NOOP" | "QUIT");
        if !session.tls_active && !config.allow_no_tls && !exempt {
            send(stream, "530 5.7.0 Must issue a STARTTLS command first").await?;
            continue;
        }

        match verb.as_str() {
            "HELO" => {
                session.reset_txn();
                session.helo_done = true;
                send(stream, &format!("250 {}", config.hostname)).await?;
            }
            "EHLO" => {
                session.reset_txn();
                session.helo_done = true;
                let mut caps = vec![
                    config.hostname.clone(),
                    format!("SIZE {}", config.max_size),
                    "8BITMIME".to_string(),
                    "ENHANCEDSTATUSCODES".to_string(),
                    "SMTPUTF8".to_string(),
                ];
                if config.tls.is_some() && !session.tls_active {
                    caps.push("STARTTLS".to_string());
                }
                if config.auth_enabled && (session.tls_active || config.allow_no_tls) {
                    caps.push(format!(
                        "AUTH {} {}",
                        Mechanism::Plain.name(),
                        Mechanism::Login.name()
                    ));
                }
                let last = caps.len() - 1;
                for (i, cap) in caps.iter().enumerate() {
                    let sep = if i == last { ' ' } else { '-' };
                    send(stream, &format!("250{}{}", sep, cap)).await?;
                }
            }
            "STARTTLS" => {
                if session.tls_active {
                    send(stream, "503 5.5.1 TLS already active").await?;
                } else if config.tls.is_none() {
                    send(stream, "502 5.5.1 TLS not available").await?;
                } else if session.txn.is_some() {
                    send(stream, "503 5.5.1 STARTTLS not allowed inside a transaction").await?;
                } else {
                    send(stream, "220 2.0.0 Ready to start TLS").await?;
                    return Ok(SessionEnd::StartTls);
                }
            }
            "AUTH" => {
                handle_auth(&mut session, stream, &mut reader, args).await?;
            }
            "MAIL" => {
                if !session.helo_done {
                    send(stream, "503 5.5.1 send HELO/EHLO first").await?;
                    continue;
                }
                if session.txn.is_some() {
                    send(stream, "503 5.5.1 nested MAIL command").await?;
                    continue;
                }
                let Some(sender) = parse_path(args, "FROM") else {
                    send(stream, "501 5.1.7 Bad sender address syntax").await?;
                    continue;
                };
                match session.app.start_message(&sender, session.auth_token) {
                    Ok(txn) => {
                        session.txn = Some(txn);
                        session.rcpt_count = 0;
                        send(stream, "250 2.1.0 OK").await?;
                    }
                    Err(e) => {
                        tracing::warn!(remote = %session.remote, error = %e, "MAIL refused");
                        send(stream, &format!("550 {}", e.message)).await?;
                    }
                }
            }
            "RCPT" => {
                if session.txn.is_none() {
                    send(stream, "503 5.5.1 need MAIL before RCPT").await?;
                    continue;
                }
                if session.rcpt_count >= config.max_recipients {
                    send(stream, "452 4.5.3 Too many recipients").await?;
                    continue;
                }
                let Some(recipient) = parse_path(args, "TO") else {
                    send(stream, "501 5.1.3 Bad recipient address syntax").await?;
                    continue;
                };
                let txn = session.txn.as_mut().expect("transaction active");
                match txn.add_recipient(&recipient) {
                    Ok(true) => {
                        session.rcpt_count += 1;
                        send(stream, "250 2.1.5 OK").await?;
                    }
                    Ok(false) => {
                        send(stream, "550 Error: bad recipient").await?;
                    }
                    Err(e) => {
                        tracing::error!(remote = %session.remote, error = %e, "RCPT failed");
                        send(stream, "451 4.3.0 Requested action aborted").await?;
                    }
                }
            }
            "DATA" => {
                if session.txn.is_none() || session.rcpt_count == 0 {
                    send(stream, "503 5.5.1 need RCPT before DATA").await?;
                    continue;
                }
                send(stream, "354 End data with <CR><LF>.<CR><LF>").await?;
                match read_data(&mut session, stream, &mut reader, config.max_size).await? {
                    DataEnd::Committed => {
                        send(stream, "250 2.0.0 OK: queued").await?;
                    }
                    DataEnd::TooLarge => {
                        send(stream, "552 5.3.4 Too much mail data").await?;
                    }
                    DataEnd::SinkError => {
                        send(stream, "451 4.3.0 Requested action aborted").await?;
                    }
                    DataEnd::Framing => {
                        send(stream, "500 5.5.2 command does not end in CR-LF").await?;
                        return Ok(SessionEnd::Quit);
                    }
                    DataEnd::Eof => return Ok(SessionEnd::Eof),
                }
            }
            "RSET" => {
                session.reset_txn();
                send(stream, "250 2.0.0 OK").await?;
            }
            "NOOP" => {
                send(stream, "250 2.0.0 OK").await?;
            }
            "QUIT" => {
                send(stream, "221 2.0.0 Bye").await?;
                return Ok(SessionEnd::Quit);
            }
            "" => {
                send(stream, "500 5.5.2 unrecognized command").await?;
            }
            _ => {
                send(stream, "502 5.5.1 command not implemented").await?;
            }
        }
    }
}

async fn handle_auth<S: AsyncRead + AsyncWrite + Unpin>(
    session: &mut Session<'_>,
    stream: &mut S,
    reader: &mut LineReader,
    args: &str,
) -> io::Result<()> {
    if session.auth_token != 0 {
        return send(stream, "503 5.5.1 already authenticated").await;
    }
    let mut words = args.split_whitespace();
    let Some(mechanism) = words.next().and_then(Mechanism::from_name) else {
        return send(stream, "504 5.5.4 unsupported mechanism").await;
    };
    let initial = words.next();

    let credentials = match mechanism {
        Mechanism::Plain => {
            let payload = match initial {
                Some(arg) => arg.to_string(),
                None => {
                    send(stream, "334 ").await?;
                    let Some((line, _)) = reader.read_line(stream, MAX_COMMAND_LINE).await? else {
                        return Ok(());
                    };
                    String::from_utf8_lossy(&line).into_owned()
                }
            };
            if payload.trim() == "*" {
                return send(stream, "501 5.7.0 authentication cancelled").await;
            }
            match decode_b64(&payload).ok().and_then(|b| parse_plain(&b).ok()) {
                Some(creds) => Some((creds.authcid, creds.password)),
                None => None,
            }
        }
        Mechanism::Login => {
            send(stream, &format!("334 {}", LOGIN_USERNAME_CHALLENGE)).await?;
            let Some((user_line, _)) = reader.read_line(stream, MAX_COMMAND_LINE).await? else {
                return Ok(());
            };
            send(stream, &format!("334 {}", LOGIN_PASSWORD_CHALLENGE)).await?;
            let Some((pass_line, _)) = reader.read_line(stream, MAX_COMMAND_LINE).await? else {
                return Ok(());
            };
            let user = decode_b64(&String::from_utf8_lossy(&user_line));
            let pass = decode_b64(&String::from_utf8_lossy(&pass_line));
            match (user, pass) {
                (Ok(u), Ok(p)) => Some((
                    String::from_utf8_lossy(&u).into_owned(),
                    String::from_utf8_lossy(&p).into_owned(),
                )),
                _ => None,
            }
        }
    };

    let Some((username, password)) = credentials else {
        return send(stream, "501 5.5.2 invalid authentication payload").await;
    };
    let token = session
        .app
        .authenticate(session.remote, &username, &password)
        .await;
    if token != 0 {
        session.auth_token = token;
        tracing::info!(remote = %session.remote, user = %username, "authenticated");
        send(stream, "235 2.7.0 Authentication successful").await
    } else {
        tracing::info!(remote = %session.remote, user = %username, "authentication failed");
        send(stream, "535 5.7.1 Authentication failed").await
    }
}

enum DataEnd {
    Committed,
    TooLarge,
    SinkError,
    Framing,
    Eof,
}

async fn read_data<S: AsyncRead + AsyncWrite + Unpin>(
    session: &mut Session<'_>,
    stream: &mut S,
    reader: &mut LineReader,
    max_size: u64,
) -> io::Result<DataEnd> {
    let mut total: u64 = 0;
    let mut overflow = false;
    let mut sink_error = false;
    loop {
        let Some((line, crlf)) = reader.read_line(stream, MAX_DATA_LINE).await? else {
            session.reset_txn();
            return Ok(DataEnd::Eof);
        };
        if !crlf {
            session.reset_txn();
            return Ok(DataEnd::Framing);
        }
        if line == b"." {
            if overflow {
                session.reset_txn();
                return Ok(DataEnd::TooLarge);
            }
            if sink_error {
                session.reset_txn();
                return Ok(DataEnd::SinkError);
            }
            let mut txn = session.txn.take().expect("transaction active");
            session.rcpt_count = 0;
            return match txn.commit() {
                Ok(()) => Ok(DataEnd::Committed),
                Err(e) => {
                    tracing::error!(remote = %session.remote, error = %e, "commit failed");
                    txn.cancel();
                    Ok(DataEnd::SinkError)
                }
            };
        }
        // Strip one leading dot per the transparency rule.
        let payload: &[u8] = if line.first() == Some(&b'.') {
            &line[1..]
        } else {
            &line
        };
        total += payload.len() as u64 + 2;
        if total > max_size {
            overflow = true;
            continue;
        }
        if !overflow && !sink_error {
            if let Some(txn) = session.txn.as_mut() {
                if let Err(e) = txn.data_line(payload) {
                    tracing::error!(remote = %session.remote, error = %e, "data sink failed");
                    sink_error = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::duplex;

    #[derive(Default)]
    struct Recorded {
        sender: String,
        recipients: Vec<String>,
        data: Vec<u8>,
        committed: bool,
        cancelled: bool,
    }

    struct MockTxn {
        shared: Arc<Mutex<Recorded>>,
    }

    impl SmtpTransaction for MockTxn {
        fn add_recipient(&mut self, recipient: &str) -> Result<bool, UserError> {
            if recipient.ends_with("@rejected.example") {
                return Ok(false);
            }
            self.shared.lock().unwrap().recipients.push(recipient.into());
            Ok(true)
        }

        fn data_line(&mut self, line: &[u8]) -> Result<(), UserError> {
            let mut rec = self.shared.lock().unwrap();
            rec.data.extend_from_slice(line);
            rec.data.extend_from_slice(b"\r\n");
            Ok(())
        }

        fn commit(&mut self) -> Result<(), UserError> {
            self.shared.lock().unwrap().committed = true;
            Ok(())
        }

        fn cancel(&mut self) {
            self.shared.lock().unwrap().cancelled = true;
        }
    }

    struct MockApp {
        shared: Arc<Mutex<Recorded>>,
    }

    impl SmtpApp for MockApp {
        fn authenticate<'a>(
            &'a self,
            _remote: &'a str,
            username: &'a str,
            password: &'a str,
        ) -> BoxFuture<'a, u64> {
            let ok = username == "alice" && password == "secret";
            Box::pin(async move { if ok { 7 } else { 0 } })
        }

        fn start_message(
            &self,
            sender: &str,
            _auth_token: u64,
        ) -> Result<Box<dyn SmtpTransaction>, UserError> {
            self.shared.lock().unwrap().sender = sender.to_string();
            Ok(Box::new(MockTxn {
                shared: Arc::clone(&self.shared),
            }))
        }
    }

    fn test_config(allow_no_tls: bool) -> Arc<SmtpConfig> {
        Arc::new(SmtpConfig {
            hostname: "mx.test".into(),
            max_size: 1024,
            max_recipients: 2,
            max_sessions: 4,
            allow_no_tls,
            tls: None,
            auth_enabled: true,
        })
    }

    async fn read_reply(client: &mut tokio::io::DuplexStream) -> String {
        let mut reader = LineReader::new();
        let (line, _) = reader.read_line(client, 4096).await.unwrap().unwrap();
        String::from_utf8(line).unwrap()
    }

    /// Read continuation lines until the final `250 ` line.
    async fn read_multiline(client: &mut tokio::io::DuplexStream) -> Vec<String> {
        let mut reader = LineReader::new();
        let mut lines = Vec::new();
        loop {
            let (line, _) = reader.read_line(client, 4096).await.unwrap().unwrap();
            let text = String::from_utf8(line).unwrap();
            let done = text.len() < 4 || text.as_bytes()[3] != b'-';
            lines.push(text);
            if done {
                break;
            }
        }
        lines
    }

    async fn start_session(
        allow_no_tls: bool,
    ) -> (tokio::io::DuplexStream, Arc<Mutex<Recorded>>, tokio::task::JoinHandle<SessionEnd>) {
        let (mut server_side, client) = duplex(64 * 1024);
        let shared = Arc::new(Mutex::new(Recorded::default()));
        let app: Arc<dyn SmtpApp> = Arc::new(MockApp {
            shared: Arc::clone(&shared),
        });
        let config = test_config(allow_no_tls);
        let cancel = CancelToken::never();
        let handle = tokio::spawn(async move {
            run_session(&config, &app, &cancel, &mut server_side, "1.2.3.4:5", false)
                .await
                .unwrap()
        });
        (client, shared, handle)
    }

    async fn command(client: &mut tokio::io::DuplexStream, cmd: &str) {
        client.write_all(cmd.as_bytes()).await.unwrap();
        client.write_all(b"\r\n").await.unwrap();
    }

    #[tokio::test]
    async fn refuses_mail_before_starttls() {
        let (mut client, _shared, handle) = start_session(false).await;
        assert!(read_reply(&mut client).await.starts_with("220 "));
        command(&mut client, "EHLO c.test").await;
        read_multiline(&mut client).await;
        command(&mut client, "MAIL FROM:<a@b.org>").await;
        assert!(read_reply(&mut client)
            .await
            .starts_with("530 5.7.0 Must issue a STARTTLS"));
        command(&mut client, "NOOP").await;
        assert!(read_reply(&mut client).await.starts_with("250"));
        command(&mut client, "QUIT").await;
        assert!(read_reply(&mut client).await.starts_with("221"));
        assert_eq!(handle.await.unwrap(), SessionEnd::Quit);
    }

    #[tokio::test]
    async fn full_submission_flow() {
        let (mut client, shared, handle) = start_session(true).await;
        assert!(read_reply(&mut client).await.starts_with("220 mx.test"));
        command(&mut client, "EHLO c.test").await;
        let caps = read_multiline(&mut client).await;
        assert!(caps.iter().any(|c| c.contains("SIZE 1024")));
        assert!(caps.iter().any(|c| c.contains("8BITMIME")));
        assert!(caps.iter().any(|c| c.contains("SMTPUTF8")));
        assert!(caps.iter().any(|c| c.contains("AUTH PLAIN LOGIN")));

        // AUTH PLAIN with inline payload: \0alice\0secret.
        command(&mut client, "AUTH PLAIN AGFsaWNlAHNlY3JldA==").await;
        assert!(read_reply(&mut client).await.starts_with("235"));

        command(&mut client, "MAIL FROM:<alice@example.org>").await;
        assert!(read_reply(&mut client).await.starts_with("250"));
        command(&mut client, "RCPT TO:<bob@remote.net>").await;
        assert!(read_reply(&mut client).await.starts_with("250"));
        command(&mut client, "DATA").await;
        assert!(read_reply(&mut client).await.starts_with("354"));
        command(&mut client, "Subject: hi").await;
        command(&mut client, "").await;
        command(&mut client, "..dotted line").await;
        command(&mut client, "body").await;
        command(&mut client, ".").await;
        assert!(read_reply(&mut client).await.starts_with("250 2.0.0"));
        command(&mut client, "QUIT").await;
        read_reply(&mut client).await;
        handle.await.unwrap();

        let rec = shared.lock().unwrap();
        assert_eq!(rec.sender, "alice@example.org");
        assert_eq!(rec.recipients, vec!["bob@remote.net"]);
        assert!(rec.committed);
        // Dot-stuffing stripped exactly one dot.
        assert_eq!(rec.data, b"Subject: hi\r\n\r\n.dotted line\r\nbody\r\n");
    }

    #[tokio::test]
    async fn auth_login_and_failure() {
        let (mut client, _shared, handle) = start_session(true).await;
        read_reply(&mut client).await;
        command(&mut client, "EHLO c.test").await;
        read_multiline(&mut client).await;
        command(&mut client, "AUTH LOGIN").await;
        assert_eq!(read_reply(&mut client).await, "334 VXNlcm5hbWU6");
        command(&mut client, "YWxpY2U=").await; // alice
        assert_eq!(read_reply(&mut client).await, "334 UGFzc3dvcmQ6");
        command(&mut client, "d3Jvbmc=").await; // wrong
        assert!(read_reply(&mut client).await.starts_with("535 5.7.1"));
        command(&mut client, "QUIT").await;
        read_reply(&mut client).await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn recipient_limit_and_rejects() {
        let (mut client, _shared, handle) = start_session(true).await;
        read_reply(&mut client).await;
        command(&mut client, "EHLO c").await;
        read_multiline(&mut client).await;
        command(&mut client, "MAIL FROM:<s@x.org>").await;
        read_reply(&mut client).await;
        command(&mut client, "RCPT TO:<bad@rejected.example>").await;
        assert!(read_reply(&mut client).await.starts_with("550 Error: bad recipient"));
        command(&mut client, "RCPT TO:<a@ok.net>").await;
        read_reply(&mut client).await;
        command(&mut client, "RCPT TO:<b@ok.net>").await;
        read_reply(&mut client).await;
        command(&mut client, "RCPT TO:<c@ok.net>").await;
        assert!(read_reply(&mut client).await.starts_with("452"));
        command(&mut client, "QUIT").await;
        read_reply(&mut client).await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn state_and_syntax_errors() {
        let (mut client, _shared, handle) = start_session(true).await;
        read_reply(&mut client).await;
        command(&mut client, "MAIL FROM:<a@b.c>").await;
        assert!(read_reply(&mut client).await.starts_with("503"));
        command(&mut client, "EHLO c").await;
        read_multiline(&mut client).await;
        command(&mut client, "MAIL FROM:bogus").await;
        assert!(read_reply(&mut client).await.starts_with("501"));
        command(&mut client, "DATA").await;
        assert!(read_reply(&mut client).await.starts_with("503"));
        command(&mut client, "FROB x").await;
        assert!(read_reply(&mut client).await.starts_with("502"));
        command(&mut client, "QUIT").await;
        read_reply(&mut client).await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn oversize_message_rejected() {
        let (mut client, shared, handle) = start_session(true).await;
        read_reply(&mut client).await;
        command(&mut client, "EHLO c").await;
        read_multiline(&mut client).await;
        command(&mut client, "MAIL FROM:<s@x.org>").await;
        read_reply(&mut client).await;
        command(&mut client, "RCPT TO:<r@y.net>").await;
        read_reply(&mut client).await;
        command(&mut client, "DATA").await;
        read_reply(&mut client).await;
        let long = "x".repeat(600);
        command(&mut client, &long).await;
        command(&mut client, &long).await;
        command(&mut client, ".").await;
        assert!(read_reply(&mut client).await.starts_with("552"));
        assert!(!shared.lock().unwrap().committed);
        assert!(shared.lock().unwrap().cancelled);
        command(&mut client, "QUIT").await;
        read_reply(&mut client).await;
        handle.await.unwrap();
    }
}
