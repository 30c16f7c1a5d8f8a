/*
 * session.rs
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

//! IMAP session: greeting, authentication, selected-mailbox commands,
//! CONDSTORE/QRESYNC responses, IDLE push, XAPPLEPUSHSERVICE.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;

use super::ops;
use super::parser::{
    parse_command, tokenize_line, Command, FetchItem, Section, StatusItem, Token,
};
use super::search::SearchKey;
use super::sequence::{format_set, SeqRange};
use crate::auth::Authenticator;
use crate::boxes::{BoxMgr, Notifier, NotifyEvent, UserBox};
use crate::mime::{encode_msg, plan_tree, Headers, PartNode};
use crate::msg::{FlagSet, Msg, FLAG_RECENT, FLAG_SEEN};
use crate::sasl::{decode_b64, parse_plain};
use crate::shutdown::CancelToken;
use crate::storage::{FlagMode, FlagsOp, MailboxInfo, PushDevice, StorageError};

const CAPABILITIES: &str =
    "IMAP4rev1 LITERAL+ IDLE MOVE UIDPLUS ENABLE CONDSTORE QRESYNC XAPPLEPUSHSERVICE";

pub struct ImapConfig {
    pub hostname: String,
    pub max_sessions: usize,
}

/// Session wake-up registry: one entry per selected mailbox of a live
/// session. The box manager's notifier fan-out lands here.
pub struct Subscribers {
    next_id: AtomicU64,
    inner: Mutex<HashMap<u64, Entry>>,
}

struct Entry {
    user_id: i64,
    mailbox: String,
    tx: UnboundedSender<()>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn subscribe(&self, user_id: i64, mailbox: &str) -> (u64, UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().expect("subscriber lock").insert(
            id,
            Entry {
                user_id,
                mailbox: mailbox.to_string(),
                tx,
            },
        );
        (id, rx)
    }

    fn unsubscribe(&self, id: u64) {
        self.inner.lock().expect("subscriber lock").remove(&id);
    }
}

impl Default for Subscribers {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for Subscribers {
    fn notify(&self, event: &NotifyEvent) {
        let inner = self.inner.lock().expect("subscriber lock");
        for entry in inner.values() {
            if entry.user_id == event.user_id && entry.mailbox == event.mailbox_name {
                let _ = entry.tx.send(());
            }
        }
    }
}

/// Everything a session needs, shared across sessions.
pub struct SessionDeps {
    pub config: Arc<ImapConfig>,
    pub boxes: Arc<BoxMgr>,
    pub auth: Arc<Authenticator>,
    pub subscribers: Arc<Subscribers>,
    pub cancel: CancelToken,
}

pub struct ImapServer {
    deps: Arc<SessionDeps>,
    sessions: Arc<Semaphore>,
}

impl ImapServer {
    /// Builds the server and hooks its subscriber registry into the box
    /// manager's notifier fan-out.
    pub fn new(
        config: ImapConfig,
        boxes: Arc<BoxMgr>,
        auth: Arc<Authenticator>,
        cancel: CancelToken,
    ) -> Self {
        let subscribers = Arc::new(Subscribers::new());
        boxes.register_notifier(Arc::clone(&subscribers) as Arc<dyn Notifier>);
        let sessions = Arc::new(Semaphore::new(config.max_sessions));
        Self {
            deps: Arc::new(SessionDeps {
                config: Arc::new(config),
                boxes,
                auth,
                subscribers,
                cancel,
            }),
            sessions,
        }
    }

    pub async fn serve(&self, listener: TcpListener) {
        let mut backoff = Duration::from_millis(5);
        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&self.sessions).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
                _ = self.deps.cancel.cancelled() => return,
            };
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.deps.cancel.cancelled() => return,
            };
            match accepted {
                Ok((mut stream, remote)) => {
                    backoff = Duration::from_millis(5);
                    let deps = Arc::clone(&self.deps);
                    tokio::spawn(async move {
                        let _permit = permit;
                        let remote = remote.to_string();
                        if let Err(e) = run_session(&deps, &mut stream, &remote).await {
                            tracing::debug!(remote = %remote, error = %e, "imap session ended");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "imap accept failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(1));
                }
            }
        }
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

    async fn read_line<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
    ) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(nl) = self.buf[self.pos..].iter().position(|&b| b == b'\n') {
                let start = self.pos;
                let mut end = start + nl;
                if end > start && self.buf[end - 1] == b'\r' {
                    end -= 1;
                }
                let line = self.buf[start..end].to_vec();
                self.pos = start + nl + 1;
                if self.pos >= self.buf.len() {
                    self.buf.clear();
                    self.pos = 0;
                }
                return Ok(Some(line));
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Exactly `len` literal bytes.
    async fn read_exact_bytes<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
        len: usize,
    ) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let available = self.buf.len() - self.pos;
        let from_buf = available.min(len);
        out.extend_from_slice(&self.buf[self.pos..self.pos + from_buf]);
        self.pos += from_buf;
        if self.pos >= self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
        while out.len() < len {
            let mut chunk = vec![0u8; (len - out.len()).min(65536)];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "eof inside literal",
                ));
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(out)
    }
}

async fn send<S: AsyncWrite + Unpin>(stream: &mut S, line: &str) -> io::Result<()> {
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await
}

struct Selected {
    info: MailboxInfo,
    read_only: bool,
    subscription: u64,
    notify_rx: UnboundedReceiver<()>,
    last_exists: u32,
}

struct Session<'a> {
    deps: &'a SessionDeps,
    remote: &'a str,
    user: Option<Arc<UserBox>>,
    selected: Option<Selected>,
    handles: HashMap<String, MailboxInfo>,
    qresync_enabled: bool,
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if let Some(selected) = self.selected.take() {
            self.deps.subscribers.unsubscribe(selected.subscription);
        }
    }
}

impl Session<'_> {
    fn store(&self) -> Option<&crate::storage::UserStore> {
        self.user.as_ref().map(|u| &u.store)
    }

    /// Cached mailbox handle, loaded on first use.
    fn mailbox_handle(
        &mut self,
        cancel: &CancelToken,
        name: &str,
    ) -> Result<Option<MailboxInfo>, StorageError> {
        if let Some(info) = self.handles.get(name) {
            return Ok(Some(info.clone()));
        }
        let Some(store) = self.store() else {
            return Ok(None);
        };
        match store.mailbox(cancel, name)? {
            Some(info) => {
                self.handles.insert(name.to_string(), info.clone());
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    fn invalidate_handles(&mut self) {
        self.handles.clear();
    }

    fn deselect(&mut self) {
        if let Some(selected) = self.selected.take() {
            self.deps.subscribers.unsubscribe(selected.subscription);
        }
    }
}

/// Run a full session on `stream`. Public so tests drive it over
/// in-memory duplex streams.
pub async fn run_session<S: AsyncRead + AsyncWrite + Unpin>(
    deps: &SessionDeps,
    stream: &mut S,
    remote: &str,
) -> io::Result<()> {
    let mut session = Session {
        deps,
        remote,
        user: None,
        selected: None,
        handles: HashMap::new(),
        qresync_enabled: false,
    };
    let mut reader = LineReader::new();
    send(
        stream,
        &format!(
            "* OK [CAPABILITY {}] {} ready",
            CAPABILITIES, deps.config.hostname
        ),
    )
    .await?;

    loop {
        if deps.cancel.is_cancelled() {
            send(stream, "* BYE shutting down").await?;
            return Ok(());
        }
        let line = tokio::select! {
            line = reader.read_line(stream) => line?,
            _ = deps.cancel.cancelled() => {
                send(stream, "* BYE shutting down").await?;
                return Ok(());
            }
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.is_empty() {
            continue;
        }

        // Tag, then command tokens; literals splice in as Bytes.
        let space = line.iter().position(|&b| b == b' ');
        let (tag_bytes, rest) = match space {
            Some(i) => (&line[..i], &line[i + 1..]),
            None => (&line[..], &line[..0]),
        };
        let tag = String::from_utf8_lossy(tag_bytes).into_owned();
        if tag.is_empty() || rest.is_empty() {
            send(stream, &format!("{} BAD missing command", tag_or_star(&tag))).await?;
            continue;
        }
        let mut tokens = Vec::new();
        let mut pending = match tokenize_line(rest, &mut tokens) {
            Ok(p) => p,
            Err(e) => {
                send(stream, &format!("{} BAD {}", tag, e)).await?;
                continue;
            }
        };
        let mut tokenize_failed = false;
        while let Some(marker) = pending {
            if !marker.non_synchronizing {
                send(stream, "+ OK").await?;
            }
            let bytes = reader.read_exact_bytes(stream, marker.len).await?;
            tokens.push(Token::Bytes(bytes));
            let Some(next_line) = reader.read_line(stream).await? else {
                return Ok(());
            };
            pending = match tokenize_line(&next_line, &mut tokens) {
                Ok(p) => p,
                Err(e) => {
                    send(stream, &format!("{} BAD {}", tag, e)).await?;
                    tokenize_failed = true;
                    break;
                }
            };
        }
        if tokenize_failed {
            continue;
        }

        let command = match parse_command(tokens) {
            Ok(c) => c,
            Err(e) => {
                send(stream, &format!("{} BAD {}", tag, e)).await?;
                continue;
            }
        };

        match dispatch(&mut session, stream, &mut reader, &tag, command).await? {
            Flow::Continue => {}
            Flow::Logout => return Ok(()),
        }
    }
}

fn tag_or_star(tag: &str) -> &str {
    if tag.is_empty() {
        "*"
    } else {
        tag
    }
}

enum Flow {
    Continue,
    Logout,
}

async fn dispatch<S: AsyncRead + AsyncWrite + Unpin>(
    session: &mut Session<'_>,
    stream: &mut S,
    reader: &mut LineReader,
    tag: &str,
    command: Command,
) -> io::Result<Flow> {
    let cancel = session.deps.cancel.clone();
    match command {
        Command::Capability => {
            send(stream, &format!("* CAPABILITY {}", CAPABILITIES)).await?;
            send(stream, &format!("{} OK CAPABILITY completed", tag)).await?;
        }
        Command::Noop => {
            emit_mailbox_updates(session, stream, &cancel).await?;
            send(stream, &format!("{} OK NOOP completed", tag)).await?;
        }
        Command::Logout => {
            send(stream, "* BYE logging out").await?;
            send(stream, &format!("{} OK LOGOUT completed", tag)).await?;
            return Ok(Flow::Logout);
        }
        Command::Login { username, password } => {
            login(session, stream, tag, &username, &password).await?;
        }
        Command::Authenticate { mechanism, initial } => {
            if mechanism != "PLAIN" {
                send(stream, &format!("{} NO unsupported mechanism", tag)).await?;
                return Ok(Flow::Continue);
            }
            let payload = match initial {
                Some(p) => p,
                None => {
                    send(stream, "+ ").await?;
                    match reader.read_line(stream).await? {
                        Some(line) => String::from_utf8_lossy(&line).into_owned(),
                        None => return Ok(Flow::Logout),
                    }
                }
            };
            match decode_b64(&payload).ok().and_then(|b| parse_plain(&b).ok()) {
                Some(creds) => {
                    login(session, stream, tag, &creds.authcid, &creds.password).await?;
                }
                None => {
                    send(stream, &format!("{} BAD invalid credentials payload", tag)).await?;
                }
            }
        }
        _ if session.user.is_none() => {
            send(stream, &format!("{} NO not authenticated", tag)).await?;
        }
        Command::Enable(caps) => {
            let mut enabled = Vec::new();
            for cap in caps {
                if cap == "QRESYNC" {
                    session.qresync_enabled = true;
                    enabled.push("QRESYNC");
                } else if cap == "CONDSTORE" {
                    enabled.push("CONDSTORE");
                }
            }
            send(stream, &format!("* ENABLED {}", enabled.join(" "))).await?;
            send(stream, &format!("{} OK ENABLE completed", tag)).await?;
        }
        Command::List { pattern, .. } | Command::Lsub { pattern, .. } => {
            let store = session.store().expect("authenticated");
            match store.mailboxes(&cancel) {
                Ok(infos) => {
                    for info in infos {
                        if !list_matches(&pattern, &info.name) {
                            continue;
                        }
                        let attrs = if crate::storage::MAILBOX_NO_CHILDREN
                            .iter()
                            .any(|n| *n == info.name)
                        {
                            "(\\Noinferiors)"
                        } else {
                            "()"
                        };
                        send(
                            stream,
                            &format!("* LIST {} \"/\" \"{}\"", attrs, info.name),
                        )
                        .await?;
                    }
                    send(stream, &format!("{} OK LIST completed", tag)).await?;
                }
                Err(e) => storage_no(stream, tag, &e).await?,
            }
        }
        Command::Subscribe(name) => {
            let store = session.store().expect("authenticated");
            match store.set_subscribed(&cancel, &name, true) {
                Ok(()) => send(stream, &format!("{} OK SUBSCRIBE completed", tag)).await?,
                Err(e) => storage_no(stream, tag, &e).await?,
            }
        }
        Command::Unsubscribe(name) => {
            let store = session.store().expect("authenticated");
            match store.set_subscribed(&cancel, &name, false) {
                Ok(()) => send(stream, &format!("{} OK UNSUBSCRIBE completed", tag)).await?,
                Err(e) => storage_no(stream, tag, &e).await?,
            }
        }
        Command::Create(name) => {
            session.invalidate_handles();
            let store = session.store().expect("authenticated");
            match store.create_mailbox(&cancel, &name, 0) {
                Ok(_) => send(stream, &format!("{} OK CREATE completed", tag)).await?,
                Err(e) => storage_no(stream, tag, &e).await?,
            }
        }
        Command::Delete(name) => {
            session.invalidate_handles();
            let store = session.store().expect("authenticated");
            match store.delete_mailbox(&cancel, &name) {
                Ok(()) => send(stream, &format!("{} OK DELETE completed", tag)).await?,
                Err(e) => storage_no(stream, tag, &e).await?,
            }
        }
        Command::Rename { from, to } => {
            session.invalidate_handles();
            let store = session.store().expect("authenticated");
            match store.rename_mailbox(&cancel, &from, &to) {
                Ok(()) => send(stream, &format!("{} OK RENAME completed", tag)).await?,
                Err(e) => storage_no(stream, tag, &e).await?,
            }
        }
        Command::Select {
            mailbox,
            condstore: _,
            qresync,
        } => {
            select_mailbox(session, stream, &cancel, tag, &mailbox, false, qresync).await?;
        }
        Command::Examine { mailbox, .. } => {
            select_mailbox(session, stream, &cancel, tag, &mailbox, true, None).await?;
        }
        Command::Status { mailbox, items } => {
            status(session, stream, &cancel, tag, &mailbox, &items).await?;
        }
        Command::Append {
            mailbox,
            flags,
            date,
            message,
        } => {
            append(session, stream, &cancel, tag, &mailbox, flags, date, &message).await?;
        }
        Command::Check => {
            emit_mailbox_updates(session, stream, &cancel).await?;
            send(stream, &format!("{} OK CHECK completed", tag)).await?;
        }
        Command::Close => {
            if let Some(selected) = session.selected.as_ref() {
                if !selected.read_only {
                    let store = session.store().expect("authenticated");
                    let _ = ops::expunge(store, &cancel, selected.info.mailbox_id, None);
                }
            }
            session.deselect();
            send(stream, &format!("{} OK CLOSE completed", tag)).await?;
        }
        Command::Unselect => {
            session.deselect();
            send(stream, &format!("{} OK UNSELECT completed", tag)).await?;
        }
        Command::Idle => {
            idle(session, stream, reader, &cancel, tag).await?;
        }
        Command::XApplePush {
            account_id,
            device_token,
            mailboxes,
        } => {
            let store = session.store().expect("authenticated");
            let device = PushDevice {
                account_id,
                device_token,
            };
            let mut failed = None;
            for mailbox in &mailboxes {
                if let Err(e) = store.register_push_device(&cancel, mailbox, &device) {
                    failed = Some(e);
                    break;
                }
            }
            match failed {
                None => {
                    send(stream, "* XAPPLEPUSHSERVICE aps-version 2").await?;
                    send(stream, &format!("{} OK XAPPLEPUSHSERVICE completed", tag)).await?;
                }
                Some(e) => storage_no(stream, tag, &e).await?,
            }
        }
        _ if session.selected.is_none() => {
            send(stream, &format!("{} NO no mailbox selected", tag)).await?;
        }
        Command::Expunge { uid: _, ranges } => {
            let mailbox_id = session.selected.as_ref().expect("selected").info.mailbox_id;
            let store = session.store().expect("authenticated");
            match ops::expunge(store, &cancel, mailbox_id, ranges.as_deref()) {
                Ok(reported) => {
                    for (seq, _uid) in &reported {
                        send(stream, &format!("* {} EXPUNGE", seq)).await?;
                    }
                    send(stream, &format!("{} OK EXPUNGE completed", tag)).await?;
                }
                Err(e) => storage_no(stream, tag, &e).await?,
            }
        }
        Command::Search { uid, key } => {
            let mailbox_id = session.selected.as_ref().expect("selected").info.mailbox_id;
            let store = session.store().expect("authenticated");
            match ops::search_rows(store, &cancel, mailbox_id, &key) {
                Ok(matches) => {
                    let mut response = String::from("* SEARCH");
                    for m in &matches {
                        response.push(' ');
                        if uid {
                            response.push_str(&m.row.uid.to_string());
                        } else {
                            response.push_str(&m.seq.to_string());
                        }
                    }
                    if search_mentions_modseq(&key) {
                        let max = matches.iter().map(|m| m.row.modseq).max().unwrap_or(0);
                        response.push_str(&format!(" (MODSEQ {})", max));
                    }
                    send(stream, &response).await?;
                    send(stream, &format!("{} OK SEARCH completed", tag)).await?;
                }
                Err(e) => storage_no(stream, tag, &e).await?,
            }
        }
        Command::Fetch {
            uid,
            ranges,
            items,
            changed_since,
            vanished,
        } => {
            fetch(
                session,
                stream,
                &cancel,
                tag,
                uid,
                &ranges,
                &items,
                changed_since,
                vanished,
            )
            .await?;
        }
        Command::Store {
            uid,
            ranges,
            mode,
            silent,
            flags,
            unchanged_since,
        } => {
            store_cmd(
                session,
                stream,
                &cancel,
                tag,
                uid,
                &ranges,
                mode,
                silent,
                flags,
                unchanged_since,
            )
            .await?;
        }
        Command::Copy {
            uid,
            ranges,
            mailbox,
        } => {
            let mailbox_id = session.selected.as_ref().expect("selected").info.mailbox_id;
            let store = session.store().expect("authenticated");
            match ops::copy(store, &cancel, mailbox_id, uid, &ranges, &mailbox) {
                Ok(outcome) if outcome.pairs.is_empty() => {
                    send(stream, &format!("{} OK COPY completed", tag)).await?;
                }
                Ok(outcome) => {
                    let src: Vec<i64> = outcome.pairs.iter().map(|p| p.0).collect();
                    let dst: Vec<i64> = outcome.pairs.iter().map(|p| p.1).collect();
                    send(
                        stream,
                        &format!(
                            "{} OK [COPYUID {} {} {}] COPY completed",
                            tag,
                            outcome.dst_uid_validity,
                            format_set(&src),
                            format_set(&dst)
                        ),
                    )
                    .await?;
                }
                Err(e) => storage_no(stream, tag, &e).await?,
            }
        }
        Command::Move {
            uid,
            ranges,
            mailbox,
        } => {
            let mailbox_id = session.selected.as_ref().expect("selected").info.mailbox_id;
            let store = session.store().expect("authenticated");
            match ops::transfer_move(store, &cancel, mailbox_id, uid, &ranges, &mailbox) {
                Ok(outcome) => {
                    if !outcome.pairs.is_empty() {
                        let src: Vec<i64> = outcome.pairs.iter().map(|p| p.0).collect();
                        let dst: Vec<i64> = outcome.pairs.iter().map(|p| p.1).collect();
                        send(
                            stream,
                            &format!(
                                "* OK [COPYUID {} {} {}]",
                                outcome.dst_uid_validity,
                                format_set(&src),
                                format_set(&dst)
                            ),
                        )
                        .await?;
                    }
                    for seq in &outcome.expunged_seqs {
                        send(stream, &format!("* {} EXPUNGE", seq)).await?;
                    }
                    send(stream, &format!("{} OK MOVE completed", tag)).await?;
                }
                Err(e) => storage_no(stream, tag, &e).await?,
            }
        }
    }
    Ok(Flow::Continue)
}

async fn storage_no<S: AsyncWrite + Unpin>(
    stream: &mut S,
    tag: &str,
    e: &StorageError,
) -> io::Result<()> {
    match e {
        StorageError::Denied(m) => send(stream, &format!("{} NO {}", tag, m)).await,
        StorageError::NotFound => {
            send(stream, &format!("{} NO [TRYCREATE] no such mailbox", tag)).await
        }
        other => {
            tracing::error!(error = %other, "storage failure");
            send(stream, &format!("{} NO server failure", tag)).await
        }
    }
}

async fn login<S: AsyncRead + AsyncWrite + Unpin>(
    session: &mut Session<'_>,
    stream: &mut S,
    tag: &str,
    username: &str,
    password: &str,
) -> io::Result<()> {
    if session.user.is_some() {
        return send(stream, &format!("{} NO already authenticated", tag)).await;
    }
    let cancel = session.deps.cancel.clone();
    match session
        .deps
        .auth
        .verify(&cancel, session.remote, username, password)
        .await
    {
        Ok(Some(user_id)) => match session.deps.boxes.user_box(user_id) {
            Ok(user_box) => {
                session.user = Some(user_box);
                tracing::info!(remote = %session.remote, user = %username, "imap login");
                send(
                    stream,
                    &format!("{} OK [CAPABILITY {}] LOGIN completed", tag, CAPABILITIES),
                )
                .await
            }
            Err(e) => {
                tracing::error!(error = %e, user = %username, "box open failed");
                send(stream, &format!("{} NO server failure", tag)).await
            }
        },
        Ok(None) => {
            send(
                stream,
                &format!("{} NO [AUTHENTICATIONFAILED] invalid credentials", tag),
            )
            .await
        }
        Err(e) => {
            tracing::error!(error = %e, "authentication backend failure");
            send(stream, &format!("{} NO server failure", tag)).await
        }
    }
}

async fn select_mailbox<S: AsyncRead + AsyncWrite + Unpin>(
    session: &mut Session<'_>,
    stream: &mut S,
    cancel: &CancelToken,
    tag: &str,
    name: &str,
    read_only: bool,
    qresync: Option<(i64, i64)>,
) -> io::Result<()> {
    session.deselect();
    let info = match session.mailbox_handle(cancel, name) {
        Ok(Some(info)) => info,
        Ok(None) => {
            return send(stream, &format!("{} NO [TRYCREATE] no such mailbox", tag)).await;
        }
        Err(e) => return storage_no(stream, tag, &e).await,
    };
    let store = session.store().expect("authenticated");
    let status = match store.info(cancel, info.mailbox_id) {
        Ok(s) => s,
        Err(e) => return storage_no(stream, tag, &e).await,
    };

    send(stream, "* FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)").await?;
    send(stream, &format!("* {} EXISTS", status.messages)).await?;
    send(stream, &format!("* {} RECENT", status.recent)).await?;
    if let Some(first_unseen) = status.first_unseen_seq {
        send(
            stream,
            &format!("* OK [UNSEEN {}] first unseen", first_unseen),
        )
        .await?;
    }
    send(
        stream,
        &format!("* OK [UIDVALIDITY {}] UIDs valid", status.uid_validity),
    )
    .await?;
    send(
        stream,
        &format!("* OK [UIDNEXT {}] predicted next UID", status.uid_next),
    )
    .await?;
    send(
        stream,
        &format!("* OK [HIGHESTMODSEQ {}] modseq", status.highest_modseq.max(1)),
    )
    .await?;
    send(
        stream,
        "* OK [PERMANENTFLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft \\*)] flags allowed",
    )
    .await?;

    // QRESYNC resynchronization from the expunge tombstones.
    if let Some((uid_validity, since_modseq)) = qresync {
        if session.qresync_enabled && uid_validity == status.uid_validity {
            match store.expunged_uids_since(cancel, info.mailbox_id, since_modseq) {
                Ok(vanished) if !vanished.is_empty() => {
                    send(
                        stream,
                        &format!("* VANISHED (EARLIER) {}", format_set(&vanished)),
                    )
                    .await?;
                }
                Ok(_) => {}
                Err(e) => return storage_no(stream, tag, &e).await,
            }
            match store.ready_rows(cancel, info.mailbox_id) {
                Ok(rows) => {
                    for (i, row) in rows.iter().enumerate() {
                        if row.modseq > since_modseq {
                            send(
                                stream,
                                &format!(
                                    "* {} FETCH (UID {} MODSEQ ({}) FLAGS {})",
                                    i + 1,
                                    row.uid,
                                    row.modseq,
                                    flags_wire(&row.flags)
                                ),
                            )
                            .await?;
                        }
                    }
                }
                Err(e) => return storage_no(stream, tag, &e).await,
            }
        }
    }

    let user_id = session.user.as_ref().expect("authenticated").user_id;
    let (subscription, notify_rx) = session.deps.subscribers.subscribe(user_id, name);
    session.selected = Some(Selected {
        info,
        read_only,
        subscription,
        notify_rx,
        last_exists: status.messages,
    });
    let mode = if read_only { "READ-ONLY" } else { "READ-WRITE" };
    send(
        stream,
        &format!("{} OK [{}] {} completed", tag, mode, if read_only { "EXAMINE" } else { "SELECT" }),
    )
    .await
}

async fn status<S: AsyncRead + AsyncWrite + Unpin>(
    session: &mut Session<'_>,
    stream: &mut S,
    cancel: &CancelToken,
    tag: &str,
    mailbox: &str,
    items: &[StatusItem],
) -> io::Result<()> {
    let info = match session.mailbox_handle(cancel, mailbox) {
        Ok(Some(info)) => info,
        Ok(None) => {
            return send(stream, &format!("{} NO [TRYCREATE] no such mailbox", tag)).await;
        }
        Err(e) => return storage_no(stream, tag, &e).await,
    };
    let store = session.store().expect("authenticated");
    let s = match store.info(cancel, info.mailbox_id) {
        Ok(s) => s,
        Err(e) => return storage_no(stream, tag, &e).await,
    };
    let mut parts = Vec::new();
    for item in items {
        match item {
            StatusItem::Messages => parts.push(format!("MESSAGES {}", s.messages)),
            StatusItem::Recent => parts.push(format!("RECENT {}", s.recent)),
            StatusItem::UidNext => parts.push(format!("UIDNEXT {}", s.uid_next)),
            StatusItem::UidValidity => parts.push(format!("UIDVALIDITY {}", s.uid_validity)),
            StatusItem::Unseen => parts.push(format!("UNSEEN {}", s.unseen)),
            StatusItem::HighestModSeq => {
                parts.push(format!("HIGHESTMODSEQ {}", s.highest_modseq))
            }
        }
    }
    send(
        stream,
        &format!("* STATUS \"{}\" ({})", mailbox, parts.join(" ")),
    )
    .await?;
    send(stream, &format!("{} OK STATUS completed", tag)).await
}

#[allow(clippy::too_many_arguments)]
async fn append<S: AsyncRead + AsyncWrite + Unpin>(
    session: &mut Session<'_>,
    stream: &mut S,
    cancel: &CancelToken,
    tag: &str,
    mailbox: &str,
    mut flags: FlagSet,
    date: Option<i64>,
    message: &[u8],
) -> io::Result<()> {
    let info = match session.mailbox_handle(cancel, mailbox) {
        Ok(Some(info)) => info,
        Ok(None) => {
            return send(stream, &format!("{} NO [TRYCREATE] no such mailbox", tag)).await;
        }
        Err(e) => return storage_no(stream, tag, &e).await,
    };
    let mut msg: Msg = match crate::mime::cleave(message) {
        Ok(m) => m,
        Err(e) => {
            return send(stream, &format!("{} NO malformed message: {}", tag, e)).await;
        }
    };
    flags.remove(FLAG_RECENT);
    msg.flags = flags;
    let internal_date = date.and_then(|d| Utc.timestamp_opt(d, 0).single());
    let user_id = session.user.as_ref().expect("authenticated").user_id;
    match session
        .deps
        .boxes
        .append(cancel, user_id, mailbox, &mut msg, internal_date)
    {
        Ok(uid) => {
            send(
                stream,
                &format!(
                    "{} OK [APPENDUID {} {}] APPEND completed",
                    tag, info.uid_validity, uid
                ),
            )
            .await
        }
        Err(e) => storage_no(stream, tag, &e).await,
    }
}

/// Untagged EXISTS/RECENT when the selected mailbox grew (NOOP, CHECK,
/// IDLE wake-ups).
async fn emit_mailbox_updates<S: AsyncWrite + Unpin>(
    session: &mut Session<'_>,
    stream: &mut S,
    cancel: &CancelToken,
) -> io::Result<()> {
    let Some(selected) = session.selected.as_mut() else {
        return Ok(());
    };
    let Some(user) = session.user.as_ref() else {
        return Ok(());
    };
    if let Ok(status) = user.store.info(cancel, selected.info.mailbox_id) {
        if status.messages != selected.last_exists {
            selected.last_exists = status.messages;
            send(stream, &format!("* {} EXISTS", status.messages)).await?;
            send(stream, &format!("* {} RECENT", status.recent)).await?;
        }
    }
    Ok(())
}

async fn idle<S: AsyncRead + AsyncWrite + Unpin>(
    session: &mut Session<'_>,
    stream: &mut S,
    reader: &mut LineReader,
    cancel: &CancelToken,
    tag: &str,
) -> io::Result<()> {
    send(stream, "+ idling").await?;
    loop {
        let notified = {
            let Some(selected) = session.selected.as_mut() else {
                // IDLE without a selected mailbox just waits for DONE.
                match reader.read_line(stream).await? {
                    Some(_) => return send(stream, &format!("{} OK IDLE terminated", tag)).await,
                    None => return Ok(()),
                }
            };
            tokio::select! {
                line = reader.read_line(stream) => {
                    match line? {
                        Some(_) => None,
                        None => return Ok(()),
                    }
                }
                _ = selected.notify_rx.recv() => Some(()),
                _ = cancel.cancelled() => {
                    send(stream, "* BYE shutting down").await?;
                    return Ok(());
                }
            }
        };
        match notified {
            Some(()) => {
                emit_mailbox_updates(session, stream, cancel).await?;
            }
            None => {
                // DONE (or anything else) ends the idle.
                return send(stream, &format!("{} OK IDLE terminated", tag)).await;
            }
        }
    }
}

fn search_mentions_modseq(key: &SearchKey) -> bool {
    match key {
        SearchKey::ModSeq(_) => true,
        SearchKey::And(keys) => keys.iter().any(search_mentions_modseq),
        SearchKey::Or(a, b) => search_mentions_modseq(a) || search_mentions_modseq(b),
        SearchKey::Not(k) => search_mentions_modseq(k),
        _ => false,
    }
}

fn flags_wire(flags: &FlagSet) -> String {
    let list: Vec<&str> = flags.iter().collect();
    format!("({})", list.join(" "))
}

fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn nstring(v: Option<String>) -> String {
    match v {
        Some(s) if !s.is_empty() => quoted(&s),
        _ => "NIL".to_string(),
    }
}

/// `((name NIL local host) ...)` or NIL.
fn address_list_wire(value: Option<String>) -> String {
    let Some(value) = value else {
        return "NIL".to_string();
    };
    let mut out = String::new();
    for chunk in value.split(',') {
        let chunk = chunk.trim();
        if chunk.is_empty() {
            continue;
        }
        let (name, addr) = match (chunk.rfind('<'), chunk.rfind('>')) {
            (Some(a), Some(b)) if a < b => {
                let name = chunk[..a].trim().trim_matches('"').trim();
                (
                    if name.is_empty() { None } else { Some(name.to_string()) },
                    &chunk[a + 1..b],
                )
            }
            _ => (None, chunk),
        };
        let (local, host) = match addr.rsplit_once('@') {
            Some((l, h)) => (l.trim(), h.trim()),
            None => (addr.trim(), ""),
        };
        out.push_str(&format!(
            "({} NIL {} {})",
            nstring(name),
            quoted(local),
            quoted(host)
        ));
    }
    if out.is_empty() {
        "NIL".to_string()
    } else {
        format!("({})", out)
    }
}

fn envelope_wire(headers: &Headers) -> String {
    let from = address_list_wire(headers.get_str("From"));
    format!(
        "({} {} {} {} {} {} {} NIL {} {})",
        nstring(headers.get_str("Date")),
        nstring(headers.get_str("Subject")),
        from.clone(),
        from,
        address_list_wire(headers.get_str("Reply-To")),
        address_list_wire(headers.get_str("To")),
        address_list_wire(headers.get_str("Cc")),
        nstring(headers.get_str("In-Reply-To")),
        nstring(headers.get_str("Message-ID")),
    )
}

fn bodystructure_wire(msg: &Msg, node: &PartNode) -> String {
    match node {
        PartNode::Empty => {
            "(\"text\" \"plain\" (\"charset\" \"UTF-8\") NIL NIL \"7bit\" 0 0)".to_string()
        }
        PartNode::Leaf(i) => {
            let part = &msg.parts[*i];
            let (primary, sub) = part
                .content_type
                .split_once('/')
                .unwrap_or(("application", "octet-stream"));
            let encoding = part
                .cte
                .clone()
                .unwrap_or_else(|| {
                    if primary == "text" {
                        "7bit".to_string()
                    } else {
                        "base64".to_string()
                    }
                });
            let params = if primary == "text" {
                "(\"charset\" \"UTF-8\")".to_string()
            } else {
                "NIL".to_string()
            };
            let mut s = format!(
                "({} {} {} {} NIL {} {}",
                quoted(primary),
                quoted(sub),
                params,
                part.content_id
                    .as_ref()
                    .map(|c| quoted(&format!("<{}>", c)))
                    .unwrap_or_else(|| "NIL".to_string()),
                quoted(&encoding),
                part.ct_size,
            );
            if primary == "text" {
                s.push_str(&format!(" {}", part.ct_lines));
            }
            s.push(')');
            s
        }
        PartNode::Multipart { subtype, children } => {
            let mut s = String::from("(");
            for child in children {
                s.push_str(&bodystructure_wire(msg, child));
            }
            s.push_str(&format!(" {})", quoted(subtype)));
            s
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch<S: AsyncRead + AsyncWrite + Unpin>(
    session: &mut Session<'_>,
    stream: &mut S,
    cancel: &CancelToken,
    tag: &str,
    uid: bool,
    ranges: &[SeqRange],
    items: &[FetchItem],
    changed_since: Option<i64>,
    vanished: bool,
) -> io::Result<()> {
    let mailbox_id = session.selected.as_ref().expect("selected").info.mailbox_id;
    let store = session.store().expect("authenticated");

    if vanished {
        let since = changed_since.unwrap_or(0);
        match store.expunged_uids_since(cancel, mailbox_id, since) {
            Ok(gone) if !gone.is_empty() => {
                send(
                    stream,
                    &format!("* VANISHED (EARLIER) {}", format_set(&gone)),
                )
                .await?;
            }
            Ok(_) => {}
            Err(e) => return storage_no(stream, tag, &e).await,
        }
    }

    let selected = match ops::fetch_rows(store, cancel, mailbox_id, uid, ranges, changed_since) {
        Ok(s) => s,
        Err(e) => return storage_no(stream, tag, &e).await,
    };

    let wants_body_content = items
        .iter()
        .any(|i| matches!(i, FetchItem::Body { .. } | FetchItem::Envelope | FetchItem::BodyStructure));
    let mut seen_uids: Vec<i64> = Vec::new();

    for sel in &selected {
        let mut fields: Vec<Vec<u8>> = Vec::new();
        let mut loaded: Option<Msg> = None;
        let mut wire: Option<Vec<u8>> = None;
        if wants_body_content {
            match store.load_msg(cancel, sel.row.msg_id) {
                Ok(m) => loaded = Some(m),
                Err(e) => return storage_no(stream, tag, &e).await,
            }
        }

        let implicit_uid = uid && !items.iter().any(|i| matches!(i, FetchItem::Uid));
        if implicit_uid {
            fields.push(format!("UID {}", sel.row.uid).into_bytes());
        }
        let implicit_modseq =
            changed_since.is_some() && !items.iter().any(|i| matches!(i, FetchItem::ModSeq));
        if implicit_modseq {
            fields.push(format!("MODSEQ ({})", sel.row.modseq).into_bytes());
        }

        for item in items {
            match item {
                FetchItem::Flags => {
                    fields.push(format!("FLAGS {}", flags_wire(&sel.row.flags)).into_bytes());
                }
                FetchItem::Uid => fields.push(format!("UID {}", sel.row.uid).into_bytes()),
                FetchItem::ModSeq => {
                    fields.push(format!("MODSEQ ({})", sel.row.modseq).into_bytes());
                }
                FetchItem::InternalDate => {
                    let date = Utc
                        .timestamp_opt(sel.row.date, 0)
                        .single()
                        .unwrap_or_else(Utc::now);
                    fields.push(
                        format!(
                            "INTERNALDATE \"{}\"",
                            date.format("%d-%b-%Y %H:%M:%S +0000")
                        )
                        .into_bytes(),
                    );
                }
                FetchItem::Rfc822Size => {
                    fields.push(format!("RFC822.SIZE {}", sel.row.size).into_bytes());
                }
                FetchItem::Envelope => {
                    let msg = loaded.as_ref().expect("loaded for envelope");
                    fields.push(
                        format!("ENVELOPE {}", envelope_wire(&msg.headers)).into_bytes(),
                    );
                }
                FetchItem::BodyStructure => {
                    let msg = loaded.as_ref().expect("loaded for bodystructure");
                    let plan = plan_tree(msg);
                    fields.push(
                        format!("BODYSTRUCTURE {}", bodystructure_wire(msg, &plan))
                            .into_bytes(),
                    );
                }
                FetchItem::Body { peek, section } => {
                    let msg = loaded.as_mut().expect("loaded for body");
                    if wire.is_none() {
                        let mut bytes = Vec::new();
                        if let Err(e) = encode_msg(msg, &mut bytes, None) {
                            tracing::error!(error = %e, "rebuild failed");
                            return send(stream, &format!("{} NO rebuild failed", tag)).await;
                        }
                        wire = Some(bytes);
                    }
                    let full = wire.as_ref().expect("wire built");
                    let (label, bytes) = section_bytes(full, section, msg);
                    let mut field =
                        format!("{} {{{}}}\r\n", label, bytes.len()).into_bytes();
                    field.extend_from_slice(&bytes);
                    fields.push(field);
                    if !peek && !sel.row.flags.contains(FLAG_SEEN) {
                        seen_uids.push(sel.row.uid);
                    }
                }
            }
        }

        let mut response = format!("* {} FETCH (", sel.seq).into_bytes();
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                response.push(b' ');
            }
            response.extend_from_slice(field);
        }
        response.extend_from_slice(b")\r\n");
        stream.write_all(&response).await?;
    }
    stream.flush().await?;

    // Un-peeked body fetches set \Seen.
    if !seen_uids.is_empty() {
        let op = FlagsOp {
            mode: FlagMode::Add,
            flags: FlagSet::from_iter([FLAG_SEEN]),
            unchanged_since: None,
        };
        let _ = store.store_flags(cancel, mailbox_id, &seen_uids, &op);
    }
    send(stream, &format!("{} OK FETCH completed", tag)).await
}

/// Slice the rebuilt wire bytes per the requested section.
fn section_bytes(full: &[u8], section: &Section, msg: &Msg) -> (String, Vec<u8>) {
    let header_end = full
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
        .unwrap_or(full.len());
    match section {
        Section::Full => ("BODY[]".to_string(), full.to_vec()),
        Section::Header => ("BODY[HEADER]".to_string(), full[..header_end].to_vec()),
        Section::Text => ("BODY[TEXT]".to_string(), full[header_end..].to_vec()),
        Section::HeaderFields(fields, negated) => {
            let mut subset = Headers::new();
            for (key, value) in msg.headers.iter() {
                let listed = fields.iter().any(|f| f.eq_ignore_ascii_case(key));
                if listed != *negated {
                    subset.add(key, value.to_vec());
                }
            }
            let mut bytes = Vec::new();
            let _ = subset.encode(&mut bytes);
            bytes.extend_from_slice(b"\r\n");
            let label = if *negated {
                format!("BODY[HEADER.FIELDS.NOT ({})]", fields.join(" "))
            } else {
                format!("BODY[HEADER.FIELDS ({})]", fields.join(" "))
            };
            (label, bytes)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn store_cmd<S: AsyncRead + AsyncWrite + Unpin>(
    session: &mut Session<'_>,
    stream: &mut S,
    cancel: &CancelToken,
    tag: &str,
    uid: bool,
    ranges: &[SeqRange],
    mode: FlagMode,
    silent: bool,
    flags: FlagSet,
    unchanged_since: Option<i64>,
) -> io::Result<()> {
    let mailbox_id = session.selected.as_ref().expect("selected").info.mailbox_id;
    let store = session.store().expect("authenticated");
    let selected = match ops::fetch_rows(store, cancel, mailbox_id, uid, ranges, None) {
        Ok(s) => s,
        Err(e) => return storage_no(stream, tag, &e).await,
    };
    let uids: Vec<i64> = selected.iter().map(|s| s.row.uid).collect();
    let seq_of: HashMap<i64, u32> = selected.iter().map(|s| (s.row.uid, s.seq)).collect();

    let op = FlagsOp {
        mode,
        flags,
        unchanged_since,
    };
    let outcome = match store.store_flags(cancel, mailbox_id, &uids, &op) {
        Ok(o) => o,
        Err(e) => return storage_no(stream, tag, &e).await,
    };

    for stored in &outcome.stored {
        let emit = !silent || unchanged_since.is_some();
        if !emit {
            continue;
        }
        let seq = seq_of.get(&stored.uid).copied().unwrap_or(0);
        let mut parts = Vec::new();
        if !silent {
            parts.push(format!("FLAGS {}", flags_wire(&stored.flags)));
        }
        parts.push(format!("MODSEQ ({})", stored.modseq));
        if uid {
            parts.push(format!("UID {}", stored.uid));
        }
        send(
            stream,
            &format!("* {} FETCH ({})", seq, parts.join(" ")),
        )
        .await?;
    }

    if outcome.failed_modified.is_empty() {
        send(stream, &format!("{} OK STORE completed", tag)).await
    } else {
        send(
            stream,
            &format!(
                "{} OK [MODIFIED {}] conditional STORE failed for some messages",
                tag,
                format_set(&outcome.failed_modified)
            ),
        )
        .await
    }
}

/// Minimal IMAP LIST wildcard match: `*` spans everything, `%` stops at
/// the hierarchy delimiter.
fn list_matches(pattern: &str, name: &str) -> bool {
    fn rec(p: &[u8], n: &[u8]) -> bool {
        match p.first() {
            None => n.is_empty(),
            Some(b'*') => {
                (0..=n.len()).any(|i| rec(&p[1..], &n[i..]))
            }
            Some(b'%') => {
                for i in 0..=n.len() {
                    if n[..i].contains(&b'/') {
                        break;
                    }
                    if rec(&p[1..], &n[i..]) {
                        return true;
                    }
                }
                false
            }
            Some(&c) => n.first() == Some(&c) && rec(&p[1..], &n[1..]),
        }
    }
    rec(pattern.as_bytes(), name.as_bytes())
}
