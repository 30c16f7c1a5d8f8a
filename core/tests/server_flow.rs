/*
 * server_flow.rs
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

//! Full-path test: SMTP reception stages a message, the processor and
//! local sender move it into the addressee's box, and an IMAP session
//! reads it back, exercises CONDSTORE, and expunges with renumbering.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;

use cassetta_core::auth::{hash_device_password, Authenticator, Throttle};
use cassetta_core::boxes::BoxMgr;
use cassetta_core::config::Config;
use cassetta_core::dkim::DkimVerifier;
use cassetta_core::dns::StaticResolver;
use cassetta_core::pipeline::{LocalSender, Processor, StagingSmtpApp, Worker};
use cassetta_core::protocol::imap::session::{run_session as run_imap, SessionDeps, Subscribers};
use cassetta_core::protocol::imap::ImapConfig;
use cassetta_core::protocol::smtp::{
    run_session as run_smtp, SmtpApp, SmtpConfig,
};
use cassetta_core::shutdown::CancelToken;
use cassetta_core::storage::StagingStore;

struct Fixture {
    _dir: tempfile::TempDir,
    config: Arc<Config>,
    staging: Arc<StagingStore>,
    boxes: Arc<BoxMgr>,
    auth: Arc<Authenticator>,
    wake: Arc<Notify>,
    cancel: CancelToken,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::new("mx.example.org", dir.path());
    config.local_domains.push("example.org".into());
    let config = Arc::new(config);
    let staging = Arc::new(StagingStore::open(dir.path()).unwrap());
    let boxes = Arc::new(BoxMgr::new(dir.path().join("boxes")));
    let cancel = CancelToken::never();

    let user_id = staging.create_user(&cancel, "alice").unwrap();
    staging
        .add_address(&cancel, "alice@example.org", user_id)
        .unwrap();
    let hash = hash_device_password("abcd efgh").unwrap();
    staging
        .add_device(&cancel, user_id, "laptop", &hash)
        .unwrap();

    let auth = Arc::new(Authenticator::new(
        Arc::clone(&staging),
        Throttle::new(10, Duration::from_secs(60), Duration::from_millis(1)),
    ));
    let _ = user_id;
    Fixture {
        _dir: dir,
        config,
        staging,
        boxes,
        auth,
        wake: Arc::new(Notify::new()),
        cancel,
    }
}

struct WireClient {
    stream: DuplexStream,
    buf: Vec<u8>,
    pos: usize,
}

impl WireClient {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            pos: 0,
        }
    }

    async fn read_line(&mut self) -> String {
        loop {
            if let Some(nl) = self.buf[self.pos..].iter().position(|&b| b == b'\n') {
                let start = self.pos;
                let mut end = start + nl;
                if end > start && self.buf[end - 1] == b'\r' {
                    end -= 1;
                }
                let line = String::from_utf8_lossy(&self.buf[start..end]).into_owned();
                self.pos = start + nl + 1;
                return line;
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "peer closed unexpectedly");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn write_line(&mut self, line: &str) {
        self.stream.write_all(line.as_bytes()).await.unwrap();
        self.stream.write_all(b"\r\n").await.unwrap();
    }

    /// Send an IMAP command; collect responses until the tagged line.
    async fn imap(&mut self, tag: &str, command: &str) -> Vec<String> {
        self.write_line(&format!("{} {}", tag, command)).await;
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            let done = line.starts_with(&format!("{} ", tag));
            lines.push(line);
            if done {
                return lines;
            }
        }
    }
}

async fn smtp_receive(fx: &Fixture, sender: &str, rcpt: &str, body_lines: &[&str]) {
    let app: Arc<dyn SmtpApp> = Arc::new(StagingSmtpApp::new(
        Arc::clone(&fx.config),
        Arc::clone(&fx.staging),
        Arc::clone(&fx.auth),
        Arc::clone(&fx.wake),
        fx.cancel.clone(),
    ));
    let smtp_config = Arc::new(SmtpConfig {
        hostname: fx.config.hostname.clone(),
        max_size: fx.config.max_size,
        max_recipients: fx.config.max_recipients,
        max_sessions: 4,
        allow_no_tls: true,
        tls: None,
        auth_enabled: true,
    });
    let (mut server_side, client_side) = tokio::io::duplex(64 * 1024);
    let cancel = fx.cancel.clone();
    let handle = tokio::spawn(async move {
        run_smtp(&smtp_config, &app, &cancel, &mut server_side, "test:1", false)
            .await
            .unwrap();
    });

    let mut client = WireClient::new(client_side);
    assert!(client.read_line().await.starts_with("220 "));
    client.write_line("EHLO client.test").await;
    loop {
        let line = client.read_line().await;
        if line.starts_with("250 ") {
            break;
        }
    }
    client.write_line(&format!("MAIL FROM:<{}>", sender)).await;
    assert!(client.read_line().await.starts_with("250"));
    client.write_line(&format!("RCPT TO:<{}>", rcpt)).await;
    assert!(client.read_line().await.starts_with("250"));
    client.write_line("DATA").await;
    assert!(client.read_line().await.starts_with("354"));
    for line in body_lines {
        client.write_line(line).await;
    }
    client.write_line(".").await;
    assert!(client.read_line().await.starts_with("250"));
    client.write_line("QUIT").await;
    client.read_line().await;
    handle.await.unwrap();
}

async fn pump_pipeline(fx: &Fixture) {
    let verifier = Arc::new(DkimVerifier::new(Arc::new(StaticResolver::new())));
    let processor = Processor::new(
        Arc::clone(&fx.config),
        Arc::clone(&fx.staging),
        verifier,
        None,
        Arc::clone(&fx.wake),
        fx.cancel.clone(),
    );
    let local_sender = LocalSender::new(
        Arc::clone(&fx.staging),
        Arc::clone(&fx.boxes),
        fx.cancel.clone(),
    );
    while processor.tick().await {}
    while local_sender.tick().await {}
}

fn imap_deps(fx: &Fixture) -> SessionDeps {
    let subscribers = Arc::new(Subscribers::new());
    fx.boxes.register_notifier(Arc::clone(&subscribers) as _);
    SessionDeps {
        config: Arc::new(ImapConfig {
            hostname: fx.config.hostname.clone(),
            max_sessions: 4,
        }),
        boxes: Arc::clone(&fx.boxes),
        auth: Arc::clone(&fx.auth),
        subscribers,
        cancel: fx.cancel.clone(),
    }
}

async fn imap_login(fx: &Fixture) -> (WireClient, tokio::task::JoinHandle<()>) {
    let deps = imap_deps(fx);
    let (mut server_side, client_side) = tokio::io::duplex(256 * 1024);
    let handle = tokio::spawn(async move {
        run_imap(&deps, &mut server_side, "test:2").await.unwrap();
    });
    let mut client = WireClient::new(client_side);
    let greeting = client.read_line().await;
    assert!(greeting.contains("CAPABILITY"));
    assert!(greeting.contains("CONDSTORE"));
    // Device passwords tolerate spacing and case differences.
    let lines = client.imap("a1", "LOGIN alice \"AB CD EF GH\"").await;
    assert!(lines.last().unwrap().starts_with("a1 OK"), "{:?}", lines);
    (client, handle)
}

#[tokio::test]
async fn inbound_message_reaches_imap() {
    let fx = fixture();
    smtp_receive(
        &fx,
        "sender@remote.net",
        "alice@example.org",
        &[
            "From: sender@remote.net",
            "To: alice@example.org",
            "Subject: welcome",
            "",
            "hello over the wire",
        ],
    )
    .await;
    pump_pipeline(&fx).await;

    let (mut client, handle) = imap_login(&fx).await;
    let lines = client.imap("a2", "SELECT INBOX").await;
    assert!(lines.iter().any(|l| l == "* 1 EXISTS"), "{:?}", lines);
    assert!(lines.iter().any(|l| l == "* 1 RECENT"), "{:?}", lines);
    assert!(lines.last().unwrap().starts_with("a2 OK [READ-WRITE]"));

    let lines = client
        .imap("a3", "FETCH 1 (FLAGS RFC822.SIZE BODY.PEEK[])")
        .await;
    let joined = lines.join("\n");
    assert!(joined.contains("\\Recent"), "{}", joined);
    assert!(joined.contains("Subject: welcome"), "{}", joined);
    assert!(joined.contains("hello over the wire"), "{}", joined);
    assert!(lines.last().unwrap().starts_with("a3 OK"));

    let lines = client.imap("a4", "SEARCH SUBJECT welcome").await;
    assert!(lines.iter().any(|l| l == "* SEARCH 1"), "{:?}", lines);

    client.imap("a5", "LOGOUT").await;
    handle.await.unwrap();
}

#[tokio::test]
async fn condstore_changedsince_filters() {
    let fx = fixture();
    for i in 0..2 {
        smtp_receive(
            &fx,
            "sender@remote.net",
            "alice@example.org",
            &[
                "From: sender@remote.net",
                &format!("Subject: msg{}", i),
                "",
                &format!("body number {}", i),
            ],
        )
        .await;
    }
    pump_pipeline(&fx).await;

    let (mut client, handle) = imap_login(&fx).await;
    let lines = client.imap("b1", "SELECT INBOX (CONDSTORE)").await;
    assert!(lines.iter().any(|l| l == "* 2 EXISTS"), "{:?}", lines);

    // Bump only the second message.
    let lines = client.imap("b2", "STORE 2 +FLAGS (\\Flagged)").await;
    let modseq_line = lines
        .iter()
        .find(|l| l.contains("MODSEQ ("))
        .expect("modseq reported");
    let modseq: i64 = modseq_line
        .split("MODSEQ (")
        .nth(1)
        .unwrap()
        .split(')')
        .next()
        .unwrap()
        .parse()
        .unwrap();

    let lines = client
        .imap("b3", &format!("FETCH 1:* (FLAGS) (CHANGEDSINCE {})", modseq - 1))
        .await;
    let fetches: Vec<&String> = lines
        .iter()
        .filter(|l| l.starts_with("* ") && l.contains("FETCH"))
        .collect();
    assert_eq!(fetches.len(), 1, "{:?}", lines);
    assert!(fetches[0].starts_with("* 2 FETCH"), "{:?}", fetches);

    // UNCHANGEDSINCE below the row's modseq refuses the store.
    let lines = client
        .imap(
            "b4",
            &format!("STORE 2 (UNCHANGEDSINCE {}) FLAGS (\\Seen)", modseq - 1),
        )
        .await;
    assert!(
        lines.last().unwrap().contains("[MODIFIED"),
        "{:?}",
        lines
    );

    client.imap("b5", "LOGOUT").await;
    handle.await.unwrap();
}

#[tokio::test]
async fn expunge_reports_shrinking_sequence_numbers() {
    let fx = fixture();
    for i in 0..4 {
        smtp_receive(
            &fx,
            "sender@remote.net",
            "alice@example.org",
            &[
                "From: sender@remote.net",
                &format!("Subject: bulk{}", i),
                "",
                &format!("payload {}", i),
            ],
        )
        .await;
    }
    pump_pipeline(&fx).await;

    let (mut client, handle) = imap_login(&fx).await;
    client.imap("c1", "SELECT INBOX").await;
    let lines = client.imap("c2", "STORE 2,4 +FLAGS (\\Deleted)").await;
    assert!(lines.last().unwrap().starts_with("c2 OK"));

    let lines = client.imap("c3", "EXPUNGE").await;
    let expunges: Vec<&String> = lines.iter().filter(|l| l.ends_with("EXPUNGE")).collect();
    assert_eq!(expunges.len(), 2, "{:?}", lines);
    assert_eq!(expunges[0], "* 2 EXPUNGE");
    assert_eq!(expunges[1], "* 3 EXPUNGE");

    let lines = client.imap("c4", "SELECT INBOX").await;
    assert!(lines.iter().any(|l| l == "* 2 EXISTS"), "{:?}", lines);

    client.imap("c5", "LOGOUT").await;
    handle.await.unwrap();
}

#[tokio::test]
async fn append_move_and_uidvalidity() {
    let fx = fixture();
    let (mut client, handle) = imap_login(&fx).await;

    // APPEND with a non-synchronizing literal.
    let message = "From: alice@example.org\r\nSubject: draft\r\n\r\nkept locally\r\n";
    client
        .write_line(&format!(
            "d1 APPEND Drafts (\\Seen) {{{}+}}\r\n{}",
            message.len(),
            message
        ))
        .await;
    let mut lines = Vec::new();
    loop {
        let line = client.read_line().await;
        let done = line.starts_with("d1 ");
        lines.push(line);
        if done {
            break;
        }
    }
    assert!(
        lines.last().unwrap().contains("[APPENDUID"),
        "{:?}",
        lines
    );

    let lines = client.imap("d2", "SELECT Drafts").await;
    assert!(lines.iter().any(|l| l == "* 1 EXISTS"), "{:?}", lines);

    let lines = client.imap("d3", "MOVE 1 Archive").await;
    assert!(lines.iter().any(|l| l == "* 1 EXPUNGE"), "{:?}", lines);
    assert!(lines.last().unwrap().starts_with("d3 OK"));
    let lines = client.imap("d4", "STATUS Archive (MESSAGES)").await;
    assert!(
        lines.iter().any(|l| l.contains("MESSAGES 1")),
        "{:?}",
        lines
    );

    // Rename/delete/recreate advances UIDVALIDITY.
    let lines = client.imap("d5", "CREATE Foo").await;
    assert!(lines.last().unwrap().starts_with("d5 OK"));
    let uv1 = select_uidvalidity(&mut client, "d6", "Foo").await;
    client.imap("d7", "CLOSE").await;
    client.imap("d8", "RENAME Foo Bar").await;
    client.imap("d9", "DELETE Bar").await;
    client.imap("d10", "CREATE Bar").await;
    let uv2 = select_uidvalidity(&mut client, "d11", "Bar").await;
    assert!(uv2 > uv1, "uidvalidity {} -> {}", uv1, uv2);

    client.imap("d12", "LOGOUT").await;
    handle.await.unwrap();
}

async fn select_uidvalidity(client: &mut WireClient, tag: &str, mailbox: &str) -> i64 {
    let lines = client.imap(tag, &format!("SELECT {}", mailbox)).await;
    let uv_line = lines
        .iter()
        .find(|l| l.contains("UIDVALIDITY"))
        .expect("uidvalidity line");
    uv_line
        .split("UIDVALIDITY ")
        .nth(1)
        .unwrap()
        .split(']')
        .next()
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}
