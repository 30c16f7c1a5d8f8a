/*
 * parser.rs
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

//! IMAP command parsing: tokenizer (atoms, quoted strings, parens,
//! literal markers) and the command grammar. Literal bytes are read by
//! the session and spliced in as [`Token::Bytes`].

use chrono::DateTime;

use super::search::{flag_key, parse_imap_date, SearchKey};
use super::sequence::{parse_sequence_set, SeqRange};
use crate::msg::FlagSet;
use crate::storage::FlagMode;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Atom(String),
    Str(String),
    Bytes(Vec<u8>),
    LParen,
    RParen,
}

/// A literal announced at end of line: `{len}` or `{len+}` (LITERAL+).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiteralMarker {
    pub len: usize,
    pub non_synchronizing: bool,
}

/// Tokenize one line. When it ends with a literal marker, the caller
/// reads that many bytes, pushes `Token::Bytes`, then tokenizes the
/// continuation line into the same vector.
pub fn tokenize_line(
    line: &[u8],
    out: &mut Vec<Token>,
) -> Result<Option<LiteralMarker>, String> {
    let mut i = 0;
    while i < line.len() {
        match line[i] {
            b' ' | b'\t' => i += 1,
            b'(' => {
                out.push(Token::LParen);
                i += 1;
            }
            b')' => {
                out.push(Token::RParen);
                i += 1;
            }
            b'"' => {
                i += 1;
                let mut s = String::new();
                loop {
                    if i >= line.len() {
                        return Err("unterminated quoted string".into());
                    }
                    match line[i] {
                        b'"' => {
                            i += 1;
                            break;
                        }
                        b'\\' if i + 1 < line.len() => {
                            s.push(line[i + 1] as char);
                            i += 2;
                        }
                        c => {
                            s.push(c as char);
                            i += 1;
                        }
                    }
                }
                out.push(Token::Str(s));
            }
            b'{' => {
                let close = line[i..]
                    .iter()
                    .position(|&b| b == b'}')
                    .map(|p| i + p)
                    .ok_or_else(|| "malformed literal".to_string())?;
                if close != line.len() - 1 {
                    return Err("literal marker not at end of line".into());
                }
                let inner = &line[i + 1..close];
                let (digits, non_sync) = match inner.last() {
                    Some(b'+') => (&inner[..inner.len() - 1], true),
                    _ => (inner, false),
                };
                let len: usize = std::str::from_utf8(digits)
                    .ok()
                    .and_then(|d| d.parse().ok())
                    .ok_or_else(|| "malformed literal length".to_string())?;
                return Ok(Some(LiteralMarker {
                    len,
                    non_synchronizing: non_sync,
                }));
            }
            _ => {
                let start = i;
                let mut depth = 0usize;
                while i < line.len() {
                    match line[i] {
                        b'[' => depth += 1,
                        b']' => depth = depth.saturating_sub(1),
                        b' ' | b'(' | b')' if depth == 0 => break,
                        _ => {}
                    }
                    i += 1;
                }
                out.push(Token::Atom(
                    String::from_utf8_lossy(&line[start..i]).into_owned(),
                ));
            }
        }
    }
    Ok(None)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusItem {
    Messages,
    Recent,
    UidNext,
    UidValidity,
    Unseen,
    HighestModSeq,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Section {
    Full,
    Header,
    HeaderFields(Vec<String>, bool),
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchItem {
    Flags,
    Uid,
    ModSeq,
    InternalDate,
    Rfc822Size,
    Envelope,
    BodyStructure,
    Body { peek: bool, section: Section },
}

#[derive(Debug, PartialEq)]
pub enum Command {
    Capability,
    Noop,
    Logout,
    Login {
        username: String,
        password: String,
    },
    Authenticate {
        mechanism: String,
        initial: Option<String>,
    },
    List {
        reference: String,
        pattern: String,
    },
    Lsub {
        reference: String,
        pattern: String,
    },
    Subscribe(String),
    Unsubscribe(String),
    Create(String),
    Delete(String),
    Rename {
        from: String,
        to: String,
    },
    Select {
        mailbox: String,
        condstore: bool,
        qresync: Option<(i64, i64)>,
    },
    Examine {
        mailbox: String,
        condstore: bool,
    },
    Status {
        mailbox: String,
        items: Vec<StatusItem>,
    },
    Append {
        mailbox: String,
        flags: FlagSet,
        date: Option<i64>,
        message: Vec<u8>,
    },
    Check,
    Close,
    Unselect,
    Expunge {
        uid: bool,
        ranges: Option<Vec<SeqRange>>,
    },
    Search {
        uid: bool,
        key: SearchKey,
    },
    Fetch {
        uid: bool,
        ranges: Vec<SeqRange>,
        items: Vec<FetchItem>,
        changed_since: Option<i64>,
        vanished: bool,
    },
    Store {
        uid: bool,
        ranges: Vec<SeqRange>,
        mode: FlagMode,
        silent: bool,
        flags: FlagSet,
        unchanged_since: Option<i64>,
    },
    Copy {
        uid: bool,
        ranges: Vec<SeqRange>,
        mailbox: String,
    },
    Move {
        uid: bool,
        ranges: Vec<SeqRange>,
        mailbox: String,
    },
    Idle,
    Enable(Vec<String>),
    XApplePush {
        account_id: String,
        device_token: String,
        mailboxes: Vec<String>,
    },
}

struct Cursor {
    tokens: Vec<Token>,
    pos: usize,
}

impl Cursor {
    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    /// Atom, quoted string, or literal, as text.
    fn astring(&mut self) -> Result<String, String> {
        match self.next() {
            Some(Token::Atom(a)) => Ok(a),
            Some(Token::Str(s)) => Ok(s),
            Some(Token::Bytes(b)) => Ok(String::from_utf8_lossy(&b).into_owned()),
            _ => Err("expected string".into()),
        }
    }

    fn atom_upper(&mut self) -> Result<String, String> {
        match self.next() {
            Some(Token::Atom(a)) => Ok(a.to_ascii_uppercase()),
            _ => Err("expected atom".into()),
        }
    }

    fn bytes(&mut self) -> Result<Vec<u8>, String> {
        match self.next() {
            Some(Token::Bytes(b)) => Ok(b),
            Some(Token::Str(s)) => Ok(s.into_bytes()),
            _ => Err("expected literal".into()),
        }
    }

    fn number(&mut self) -> Result<i64, String> {
        self.astring()?
            .parse()
            .map_err(|_| "expected number".to_string())
    }

    fn expect_lparen(&mut self) -> Result<(), String> {
        match self.next() {
            Some(Token::LParen) => Ok(()),
            _ => Err("expected (".into()),
        }
    }

    fn sequence_set(&mut self) -> Result<Vec<SeqRange>, String> {
        let s = self.astring()?;
        parse_sequence_set(&s).ok_or_else(|| "bad sequence set".to_string())
    }
}

/// Parse a complete command (tag already stripped).
pub fn parse_command(tokens: Vec<Token>) -> Result<Command, String> {
    let mut c = Cursor { tokens, pos: 0 };
    let name = c.atom_upper()?;
    let command = match name.as_str() {
        "CAPABILITY" => Command::Capability,
        "NOOP" => Command::Noop,
        "LOGOUT" => Command::Logout,
        "CHECK" => Command::Check,
        "CLOSE" => Command::Close,
        "UNSELECT" => Command::Unselect,
        "IDLE" => Command::Idle,
        "LOGIN" => Command::Login {
            username: c.astring()?,
            password: c.astring()?,
        },
        "AUTHENTICATE" => Command::Authenticate {
            mechanism: c.atom_upper()?,
            initial: if c.at_end() { None } else { Some(c.astring()?) },
        },
        "LIST" => Command::List {
            reference: c.astring()?,
            pattern: c.astring()?,
        },
        "LSUB" => Command::Lsub {
            reference: c.astring()?,
            pattern: c.astring()?,
        },
        "SUBSCRIBE" => Command::Subscribe(c.astring()?),
        "UNSUBSCRIBE" => Command::Unsubscribe(c.astring()?),
        "CREATE" => Command::Create(c.astring()?),
        "DELETE" => Command::Delete(c.astring()?),
        "RENAME" => Command::Rename {
            from: c.astring()?,
            to: c.astring()?,
        },
        "SELECT" | "EXAMINE" => {
            let mailbox = c.astring()?;
            let mut condstore = false;
            let mut qresync = None;
            if let Some(Token::LParen) = c.peek() {
                c.next();
                loop {
                    match c.next() {
                        Some(Token::RParen) | None => break,
                        Some(Token::Atom(word)) => {
                            match word.to_ascii_uppercase().as_str() {
                                "CONDSTORE" => condstore = true,
                                "QRESYNC" => {
                                    c.expect_lparen()?;
                                    let uv = c.number()?;
                                    let modseq = c.number()?;
                                    // Optional known-uids argument is
                                    // tolerated and ignored.
                                    while !matches!(c.peek(), Some(Token::RParen) | None) {
                                        c.next();
                                    }
                                    c.next();
                                    qresync = Some((uv, modseq));
                                    condstore = true;
                                }
                                _ => return Err(format!("unknown select parameter {}", word)),
                            }
                        }
                        _ => return Err("bad select parameters".into()),
                    }
                }
            }
            if name == "SELECT" {
                Command::Select {
                    mailbox,
                    condstore,
                    qresync,
                }
            } else {
                Command::Examine { mailbox, condstore }
            }
        }
        "STATUS" => {
            let mailbox = c.astring()?;
            c.expect_lparen()?;
            let mut items = Vec::new();
            loop {
                match c.next() {
                    Some(Token::RParen) | None => break,
                    Some(Token::Atom(word)) => {
                        items.push(match word.to_ascii_uppercase().as_str() {
                            "MESSAGES" => StatusItem::Messages,
                            "RECENT" => StatusItem::Recent,
                            "UIDNEXT" => StatusItem::UidNext,
                            "UIDVALIDITY" => StatusItem::UidValidity,
                            "UNSEEN" => StatusItem::Unseen,
                            "HIGHESTMODSEQ" => StatusItem::HighestModSeq,
                            other => return Err(format!("unknown status item {}", other)),
                        });
                    }
                    _ => return Err("bad status items".into()),
                }
            }
            Command::Status { mailbox, items }
        }
        "APPEND" => {
            let mailbox = c.astring()?;
            let mut flags = FlagSet::new();
            if let Some(Token::LParen) = c.peek() {
                c.next();
                loop {
                    match c.next() {
                        Some(Token::RParen) | None => break,
                        Some(Token::Atom(flag)) => {
                            flags.insert(flag);
                        }
                        _ => return Err("bad append flags".into()),
                    }
                }
            }
            let mut date = None;
            if let Some(Token::Str(s)) = c.peek() {
                if let Ok(parsed) = DateTime::parse_from_str(s, "%d-%b-%Y %H:%M:%S %z") {
                    date = Some(parsed.timestamp());
                    c.next();
                }
            }
            let message = c.bytes()?;
            Command::Append {
                mailbox,
                flags,
                date,
                message,
            }
        }
        "EXPUNGE" => Command::Expunge {
            uid: false,
            ranges: None,
        },
        "SEARCH" => Command::Search {
            uid: false,
            key: parse_search(&mut c)?,
        },
        "FETCH" => parse_fetch(&mut c, false)?,
        "STORE" => parse_store(&mut c, false)?,
        "COPY" => Command::Copy {
            uid: false,
            ranges: c.sequence_set()?,
            mailbox: c.astring()?,
        },
        "MOVE" => Command::Move {
            uid: false,
            ranges: c.sequence_set()?,
            mailbox: c.astring()?,
        },
        "ENABLE" => {
            let mut caps = Vec::new();
            while !c.at_end() {
                caps.push(c.atom_upper()?);
            }
            Command::Enable(caps)
        }
        "UID" => {
            let sub = c.atom_upper()?;
            match sub.as_str() {
                "FETCH" => parse_fetch(&mut c, true)?,
                "STORE" => parse_store(&mut c, true)?,
                "SEARCH" => Command::Search {
                    uid: true,
                    key: parse_search(&mut c)?,
                },
                "COPY" => Command::Copy {
                    uid: true,
                    ranges: c.sequence_set()?,
                    mailbox: c.astring()?,
                },
                "MOVE" => Command::Move {
                    uid: true,
                    ranges: c.sequence_set()?,
                    mailbox: c.astring()?,
                },
                "EXPUNGE" => Command::Expunge {
                    uid: true,
                    ranges: Some(c.sequence_set()?),
                },
                other => return Err(format!("unknown UID command {}", other)),
            }
        }
        "XAPPLEPUSHSERVICE" => {
            let mut account_id = String::new();
            let mut device_token = String::new();
            let mut mailboxes = Vec::new();
            while !c.at_end() {
                match c.next() {
                    Some(Token::Atom(word)) => match word.to_ascii_lowercase().as_str() {
                        "aps-account-id" => account_id = c.astring()?,
                        "aps-device-token" => device_token = c.astring()?,
                        "mailboxes" => {
                            c.expect_lparen()?;
                            loop {
                                match c.next() {
                                    Some(Token::RParen) | None => break,
                                    Some(Token::Atom(m)) => mailboxes.push(m),
                                    Some(Token::Str(m)) => mailboxes.push(m),
                                    _ => return Err("bad mailboxes list".into()),
                                }
                            }
                        }
                        // aps-version, aps-subtopic and friends carry one
                        // value each.
                        _ => {
                            c.next();
                        }
                    },
                    _ => return Err("bad XAPPLEPUSHSERVICE arguments".into()),
                }
            }
            if mailboxes.is_empty() {
                mailboxes.push("INBOX".to_string());
            }
            Command::XApplePush {
                account_id,
                device_token,
                mailboxes,
            }
        }
        other => return Err(format!("unknown command {}", other)),
    };
    Ok(command)
}

fn parse_fetch(c: &mut Cursor, uid: bool) -> Result<Command, String> {
    let ranges = c.sequence_set()?;
    let mut items = Vec::new();
    match c.next() {
        Some(Token::LParen) => loop {
            match c.next() {
                Some(Token::RParen) | None => break,
                Some(Token::Atom(word)) => items.extend(parse_fetch_item(&word)?),
                _ => return Err("bad fetch items".into()),
            }
        },
        Some(Token::Atom(word)) => items.extend(parse_fetch_item(&word)?),
        _ => return Err("expected fetch items".into()),
    }
    let mut changed_since = None;
    let mut vanished = false;
    if let Some(Token::LParen) = c.peek() {
        c.next();
        loop {
            match c.next() {
                Some(Token::RParen) | None => break,
                Some(Token::Atom(word)) => match word.to_ascii_uppercase().as_str() {
                    "CHANGEDSINCE" => changed_since = Some(c.number()?),
                    "VANISHED" => vanished = true,
                    other => return Err(format!("unknown fetch modifier {}", other)),
                },
                _ => return Err("bad fetch modifiers".into()),
            }
        }
    }
    if vanished && (!uid || changed_since.is_none()) {
        return Err("VANISHED requires UID FETCH with CHANGEDSINCE".into());
    }
    Ok(Command::Fetch {
        uid,
        ranges,
        items,
        changed_since,
        vanished,
    })
}

fn parse_fetch_item(word: &str) -> Result<Vec<FetchItem>, String> {
    let upper = word.to_ascii_uppercase();
    Ok(match upper.as_str() {
        "ALL" => vec![
            FetchItem::Flags,
            FetchItem::InternalDate,
            FetchItem::Rfc822Size,
            FetchItem::Envelope,
        ],
        "FAST" => vec![
            FetchItem::Flags,
            FetchItem::InternalDate,
            FetchItem::Rfc822Size,
        ],
        "FULL" => vec![
            FetchItem::Flags,
            FetchItem::InternalDate,
            FetchItem::Rfc822Size,
            FetchItem::Envelope,
            FetchItem::BodyStructure,
        ],
        "FLAGS" => vec![FetchItem::Flags],
        "UID" => vec![FetchItem::Uid],
        "MODSEQ" => vec![FetchItem::ModSeq],
        "INTERNALDATE" => vec![FetchItem::InternalDate],
        "RFC822.SIZE" => vec![FetchItem::Rfc822Size],
        "ENVELOPE" => vec![FetchItem::Envelope],
        "BODYSTRUCTURE" => vec![FetchItem::BodyStructure],
        "RFC822" => vec![FetchItem::Body {
            peek: false,
            section: Section::Full,
        }],
        "RFC822.HEADER" => vec![FetchItem::Body {
            peek: true,
            section: Section::Header,
        }],
        "RFC822.TEXT" => vec![FetchItem::Body {
            peek: false,
            section: Section::Text,
        }],
        "BODY" => vec![FetchItem::BodyStructure],
        _ => {
            let peek = upper.starts_with("BODY.PEEK[");
            if !peek && !upper.starts_with("BODY[") {
                return Err(format!("unknown fetch item {}", word));
            }
            let open = word.find('[').expect("bracket present");
            let close = word.rfind(']').ok_or_else(|| "missing ]".to_string())?;
            let inner = &word[open + 1..close];
            vec![FetchItem::Body {
                peek,
                section: parse_section(inner)?,
            }]
        }
    })
}

fn parse_section(inner: &str) -> Result<Section, String> {
    let upper = inner.to_ascii_uppercase();
    if inner.is_empty() {
        return Ok(Section::Full);
    }
    if upper == "HEADER" {
        return Ok(Section::Header);
    }
    if upper == "TEXT" {
        return Ok(Section::Text);
    }
    for (prefix, not) in [("HEADER.FIELDS.NOT", true), ("HEADER.FIELDS", false)] {
        if upper.starts_with(prefix) {
            let rest = inner[prefix.len()..].trim();
            let rest = rest
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .ok_or_else(|| "bad header field list".to_string())?;
            let fields = rest
                .split_whitespace()
                .map(|f| f.trim_matches('"').to_string())
                .collect();
            return Ok(Section::HeaderFields(fields, not));
        }
    }
    Err(format!("unsupported body section {}", inner))
}

fn parse_store(c: &mut Cursor, uid: bool) -> Result<Command, String> {
    let ranges = c.sequence_set()?;
    let mut unchanged_since = None;
    if let Some(Token::LParen) = c.peek() {
        c.next();
        loop {
            match c.next() {
                Some(Token::RParen) | None => break,
                Some(Token::Atom(word)) => {
                    if word.eq_ignore_ascii_case("UNCHANGEDSINCE") {
                        unchanged_since = Some(c.number()?);
                    } else {
                        return Err(format!("unknown store modifier {}", word));
                    }
                }
                _ => return Err("bad store modifiers".into()),
            }
        }
    }
    let item = c.atom_upper()?;
    let (mode, silent) = match item.as_str() {
        "FLAGS" => (FlagMode::Replace, false),
        "FLAGS.SILENT" => (FlagMode::Replace, true),
        "+FLAGS" => (FlagMode::Add, false),
        "+FLAGS.SILENT" => (FlagMode::Add, true),
        "-FLAGS" => (FlagMode::Remove, false),
        "-FLAGS.SILENT" => (FlagMode::Remove, true),
        other => return Err(format!("unknown store item {}", other)),
    };
    let mut flags = FlagSet::new();
    match c.next() {
        Some(Token::LParen) => loop {
            match c.next() {
                Some(Token::RParen) | None => break,
                Some(Token::Atom(flag)) => {
                    flags.insert(flag);
                }
                _ => return Err("bad flag list".into()),
            }
        },
        Some(Token::Atom(flag)) => {
            flags.insert(flag);
        }
        _ => return Err("expected flags".into()),
    }
    Ok(Command::Store {
        uid,
        ranges,
        mode,
        silent,
        flags,
        unchanged_since,
    })
}

fn parse_search(c: &mut Cursor) -> Result<SearchKey, String> {
    let mut keys = Vec::new();
    while !c.at_end() {
        if let Some(Token::RParen) = c.peek() {
            break;
        }
        keys.push(parse_search_one(c)?);
    }
    Ok(match keys.len() {
        0 => SearchKey::All,
        1 => keys.pop().expect("one key"),
        _ => SearchKey::And(keys),
    })
}

fn parse_search_one(c: &mut Cursor) -> Result<SearchKey, String> {
    match c.next() {
        Some(Token::LParen) => {
            let grouped = parse_search(c)?;
            match c.next() {
                Some(Token::RParen) => Ok(grouped),
                _ => Err("unbalanced parentheses in search".into()),
            }
        }
        Some(Token::Atom(word)) => {
            let upper = word.to_ascii_uppercase();
            if let Some(key) = flag_key(&upper) {
                return Ok(key);
            }
            match upper.as_str() {
                "ALL" => Ok(SearchKey::All),
                "NOT" => Ok(SearchKey::Not(Box::new(parse_search_one(c)?))),
                "OR" => Ok(SearchKey::Or(
                    Box::new(parse_search_one(c)?),
                    Box::new(parse_search_one(c)?),
                )),
                "UID" => {
                    let s = c.astring()?;
                    parse_sequence_set(&s)
                        .map(SearchKey::Uid)
                        .ok_or_else(|| "bad uid set".to_string())
                }
                "KEYWORD" => Ok(SearchKey::Keyword(c.astring()?)),
                "UNKEYWORD" => Ok(SearchKey::Unkeyword(c.astring()?)),
                "FROM" => Ok(SearchKey::From(c.astring()?)),
                "TO" => Ok(SearchKey::To(c.astring()?)),
                "CC" => Ok(SearchKey::Cc(c.astring()?)),
                "BCC" => Ok(SearchKey::Bcc(c.astring()?)),
                "SUBJECT" => Ok(SearchKey::Subject(c.astring()?)),
                "BODY" => Ok(SearchKey::Body(c.astring()?)),
                "TEXT" => Ok(SearchKey::Text(c.astring()?)),
                "HEADER" => Ok(SearchKey::Header(c.astring()?, c.astring()?)),
                "BEFORE" | "SENTBEFORE" => search_date(c).map(SearchKey::Before),
                "ON" | "SENTON" => search_date(c).map(SearchKey::On),
                "SINCE" | "SENTSINCE" => search_date(c).map(SearchKey::Since),
                "LARGER" => Ok(SearchKey::Larger(c.number()? as u64)),
                "SMALLER" => Ok(SearchKey::Smaller(c.number()? as u64)),
                "MODSEQ" => {
                    // Optional entry-name/entry-type pair precedes the
                    // value.
                    if matches!(c.peek(), Some(Token::Str(_))) {
                        c.next();
                        c.next();
                    }
                    Ok(SearchKey::ModSeq(c.number()?))
                }
                _ => parse_sequence_set(&word)
                    .map(SearchKey::SeqSet)
                    .ok_or_else(|| format!("unknown search key {}", word)),
            }
        }
        Some(Token::Str(s)) => {
            // A bare string searches TEXT.
            Ok(SearchKey::Text(s))
        }
        _ => Err("bad search key".into()),
    }
}

fn search_date(c: &mut Cursor) -> Result<i64, String> {
    let s = c.astring()?;
    parse_imap_date(&s).ok_or_else(|| format!("bad date {}", s))
}
