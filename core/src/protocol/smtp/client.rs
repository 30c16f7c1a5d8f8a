/*
 * client.rs
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

//! Outbound SMTP: dial an MX host, EHLO, STARTTLS when offered, then one
//! transaction carrying the whole recipient batch. Every recipient gets
//! its own result; a refused RCPT does not abort the rest.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::dot::dot_stuff;
use crate::net::{PlainStream, TlsStreamWrapper};
use crate::shutdown::CancelToken;

#[derive(Debug)]
pub enum SmtpClientError {
    Io(io::Error),
    /// The peer refused something that dooms the whole batch
    /// (greeting, EHLO, MAIL FROM, DATA).
    Refused { code: u16, message: String },
    Cancelled,
}

impl fmt::Display for SmtpClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpClientError::Io(e) => write!(f, "i/o: {}", e),
            SmtpClientError::Refused { code, message } => {
                write!(f, "refused: {} {}", code, message)
            }
            SmtpClientError::Cancelled => write!(f, "delivery cancelled"),
        }
    }
}

impl std::error::Error for SmtpClientError {}

impl From<io::Error> for SmtpClientError {
    fn from(e: io::Error) -> Self {
        SmtpClientError::Io(e)
    }
}

/// Outcome for one recipient of a batch.
#[derive(Debug, Clone)]
pub struct RecipientResult {
    pub recipient: String,
    pub code: u16,
    pub message: String,
}

impl RecipientResult {
    pub fn accepted(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

struct Response {
    code: u16,
    lines: Vec<String>,
}

impl Response {
    fn message(&self) -> String {
        self.lines.join(" / ")
    }

    fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

async fn read_response<S>(stream: &mut S, buf: &mut Vec<u8>) -> io::Result<Response>
where
    S: AsyncRead + Unpin,
{
    let mut lines = Vec::new();
    loop {
        buf.clear();
        loop {
            let mut b = [0u8; 1];
            let n = stream.read(&mut b).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed",
                ));
            }
            if b[0] == b'\n' {
                break;
            }
            if b[0] != b'\r' {
                buf.push(b[0]);
            }
        }
        let line = String::from_utf8_lossy(buf).into_owned();
        if line.len() < 3 {
            continue;
        }
        let code: u16 = line[..3].parse().unwrap_or(0);
        let continuation = line.as_bytes().get(3) == Some(&b'-');
        lines.push(line.get(4..).unwrap_or("").trim().to_string());
        if !continuation {
            return Ok(Response { code, lines });
        }
    }
}

async fn write_line<S>(stream: &mut S, line: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await
}

/// EHLO; returns whether STARTTLS is offered.
async fn ehlo<S>(
    stream: &mut S,
    buf: &mut Vec<u8>,
    hostname: &str,
) -> Result<bool, SmtpClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_line(stream, &format!("EHLO {}", hostname)).await?;
    let r = read_response(stream, buf).await?;
    if !r.is_success() {
        return Err(SmtpClientError::Refused {
            code: r.code,
            message: r.message(),
        });
    }
    Ok(r.lines.iter().any(|l| l.eq_ignore_ascii_case("STARTTLS")))
}

/// MAIL, batch RCPT, DATA. Per-recipient codes come back to the caller.
async fn transaction<S>(
    stream: &mut S,
    buf: &mut Vec<u8>,
    sender: &str,
    recipients: &[String],
    message: &[u8],
) -> Result<Vec<RecipientResult>, SmtpClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_line(stream, &format!("MAIL FROM:<{}>", sender)).await?;
    let r = read_response(stream, buf).await?;
    if !r.is_success() {
        return Err(SmtpClientError::Refused {
            code: r.code,
            message: r.message(),
        });
    }

    let mut results = Vec::with_capacity(recipients.len());
    let mut accepted = 0usize;
    for recipient in recipients {
        write_line(stream, &format!("RCPT TO:<{}>", recipient)).await?;
        let r = read_response(stream, buf).await?;
        if r.is_success() || r.code == 251 || r.code == 252 {
            accepted += 1;
        }
        results.push(RecipientResult {
            recipient: recipient.clone(),
            code: r.code,
            message: r.message(),
        });
    }
    if accepted == 0 {
        return Ok(results);
    }

    write_line(stream, "DATA").await?;
    let r = read_response(stream, buf).await?;
    if r.code != 354 {
        return Err(SmtpClientError::Refused {
            code: r.code,
            message: r.message(),
        });
    }
    let mut payload = Vec::with_capacity(message.len() + 64);
    dot_stuff(message, &mut payload);
    stream.write_all(&payload).await?;
    stream.flush().await?;
    let r = read_response(stream, buf).await?;
    if !r.is_success() {
        // The whole batch failed at DATA; overwrite the accepted codes.
        let code = r.code;
        let message = r.message();
        for result in results.iter_mut().filter(|r| r.accepted()) {
            result.code = code;
            result.message = message.clone();
        }
    }
    Ok(results)
}

async fn quit<S>(stream: &mut S, buf: &mut Vec<u8>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if write_line(stream, "QUIT").await.is_ok() {
        let _ = read_response(stream, buf).await;
    }
}

/// Deliver `message` to `recipients` via `host`: greeting, EHLO,
/// STARTTLS when offered, one transaction, QUIT. Cancellation closes
/// the connection.
pub async fn deliver_batch(
    cancel: &CancelToken,
    host: &str,
    port: u16,
    ehlo_hostname: &str,
    sender: &str,
    recipients: &[String],
    message: &[u8],
) -> Result<Vec<RecipientResult>, SmtpClientError> {
    let work = async {
        let mut plain = PlainStream::connect(host, port).await?;
        let mut buf = Vec::with_capacity(1024);
        let greeting = read_response(&mut plain, &mut buf).await?;
        if greeting.code != 220 {
            return Err(SmtpClientError::Refused {
                code: greeting.code,
                message: greeting.message(),
            });
        }
        let starttls = ehlo(&mut plain, &mut buf, ehlo_hostname).await?;
        if starttls {
            write_line(&mut plain, "STARTTLS").await?;
            let r = read_response(&mut plain, &mut buf).await?;
            if r.code != 220 {
                return Err(SmtpClientError::Refused {
                    code: r.code,
                    message: r.message(),
                });
            }
            let mut tls: TlsStreamWrapper = plain.upgrade_to_tls(host).await?;
            ehlo(&mut tls, &mut buf, ehlo_hostname).await?;
            let results = transaction(&mut tls, &mut buf, sender, recipients, message).await?;
            quit(&mut tls, &mut buf).await;
            Ok(results)
        } else {
            let results = transaction(&mut plain, &mut buf, sender, recipients, message).await?;
            quit(&mut plain, &mut buf).await;
            Ok(results)
        }
    };
    tokio::select! {
        result = work => result,
        _ = cancel.cancelled() => Err(SmtpClientError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn response_parsing() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        b.write_all(b"250-one\r\n250-two\r\n250 three\r\n").await.unwrap();
        let mut buf = Vec::new();
        let r = read_response(&mut a, &mut buf).await.unwrap();
        assert_eq!(r.code, 250);
        assert_eq!(r.lines, vec!["one", "two", "three"]);
        assert!(r.is_success());
    }

    #[tokio::test]
    async fn transaction_records_per_recipient_codes() {
        let (mut client_side, mut server_side) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let mut reader = Vec::new();
            // Tiny scripted peer: read a line, push a canned reply.
            async fn read_cmd(
                s: &mut tokio::io::DuplexStream,
                buf: &mut Vec<u8>,
            ) -> String {
                buf.clear();
                loop {
                    let mut b = [0u8; 1];
                    s.read_exact(&mut b).await.unwrap();
                    if b[0] == b'\n' {
                        break;
                    }
                    if b[0] != b'\r' {
                        buf.push(b[0]);
                    }
                }
                String::from_utf8_lossy(buf).into_owned()
            }
            let cmd = read_cmd(&mut server_side, &mut reader).await;
            assert!(cmd.starts_with("MAIL FROM:<s@x.org>"));
            server_side.write_all(b"250 ok\r\n").await.unwrap();
            let cmd = read_cmd(&mut server_side, &mut reader).await;
            assert!(cmd.starts_with("RCPT TO:<good@y.net>"));
            server_side.write_all(b"250 ok\r\n").await.unwrap();
            let cmd = read_cmd(&mut server_side, &mut reader).await;
            assert!(cmd.starts_with("RCPT TO:<bad@y.net>"));
            server_side.write_all(b"550 no such user\r\n").await.unwrap();
            let cmd = read_cmd(&mut server_side, &mut reader).await;
            assert_eq!(cmd, "DATA");
            server_side.write_all(b"354 go\r\n").await.unwrap();
            loop {
                if read_cmd(&mut server_side, &mut reader).await == "." {
                    break;
                }
            }
            server_side.write_all(b"250 queued\r\n").await.unwrap();
        });

        let mut buf = Vec::new();
        let results = transaction(
            &mut client_side,
            &mut buf,
            "s@x.org",
            &["good@y.net".to_string(), "bad@y.net".to_string()],
            b"Subject: t\r\n\r\nbody\r\n",
        )
        .await
        .unwrap();
        server.await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].accepted());
        assert_eq!(results[1].code, 550);
        assert!(!results[1].accepted());
    }

    #[tokio::test]
    async fn all_recipients_refused_skips_data() {
        let (mut client_side, mut server_side) = tokio::io::duplex(8192);
        let peer = tokio::spawn(async move {
            let mut reader = Vec::new();
            async fn read_cmd(
                s: &mut tokio::io::DuplexStream,
                buf: &mut Vec<u8>,
            ) -> String {
                buf.clear();
                loop {
                    let mut b = [0u8; 1];
                    s.read_exact(&mut b).await.unwrap();
                    if b[0] == b'\n' {
                        break;
                    }
                    if b[0] != b'\r' {
                        buf.push(b[0]);
                    }
                }
                String::from_utf8_lossy(buf).into_owned()
            }
            let cmd = read_cmd(&mut server_side, &mut reader).await;
            assert!(cmd.starts_with("MAIL FROM"));
            server_side.write_all(b"250 ok\r\n").await.unwrap();
            let cmd = read_cmd(&mut server_side, &mut reader).await;
            assert!(cmd.starts_with("RCPT TO"));
            server_side.write_all(b"550 nope\r\n").await.unwrap();
            // Nothing else: DATA must not arrive.
            let mut b = [0u8; 1];
            assert_eq!(server_side.read(&mut b).await.unwrap(), 0);
        });

        let mut buf = Vec::new();
        let results = transaction(
            &mut client_side,
            &mut buf,
            "s@x.org",
            &["only@y.net".to_string()],
            b"irrelevant",
        )
        .await
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].code, 550);
        drop(client_side);
        peer.await.unwrap();
    }
}
