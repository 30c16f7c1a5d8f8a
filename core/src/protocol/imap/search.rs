/*
 * search.rs
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

//! SEARCH predicate tree and its evaluation against one message.

use chrono::{Datelike, NaiveDate, TimeZone, Utc};

use super::sequence::{set_contains, SeqRange};
use crate::mime::Headers;
use crate::msg::{
    FlagSet, FLAG_ANSWERED, FLAG_DELETED, FLAG_DRAFT, FLAG_FLAGGED, FLAG_RECENT, FLAG_SEEN,
};

#[derive(Debug, Clone, PartialEq)]
pub enum SearchKey {
    All,
    And(Vec<SearchKey>),
    Or(Box<SearchKey>, Box<SearchKey>),
    Not(Box<SearchKey>),
    SeqSet(Vec<SeqRange>),
    Uid(Vec<SeqRange>),
    Keyword(String),
    Unkeyword(String),
    From(String),
    To(String),
    Cc(String),
    Bcc(String),
    Subject(String),
    Header(String, String),
    Body(String),
    Text(String),
    Before(i64),
    On(i64),
    Since(i64),
    Larger(u64),
    Smaller(u64),
    ModSeq(i64),
    New,
    Old,
}

/// Everything `eval` can look at for one message.
pub struct SearchCtx<'a> {
    pub seq: u32,
    pub max_seq: u32,
    pub uid: i64,
    pub max_uid: i64,
    pub modseq: i64,
    pub size: i64,
    pub date: i64,
    pub flags: &'a FlagSet,
    pub headers: &'a Headers,
    /// Decoded text-part content, loaded only when the key needs it.
    pub body: Option<&'a str>,
}

/// Whether evaluating `key` requires body content.
pub fn needs_body(key: &SearchKey) -> bool {
    match key {
        SearchKey::Body(_) | SearchKey::Text(_) => true,
        SearchKey::And(keys) => keys.iter().any(needs_body),
        SearchKey::Or(a, b) => needs_body(a) || needs_body(b),
        SearchKey::Not(k) => needs_body(k),
        _ => false,
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn header_contains(headers: &Headers, key: &str, needle: &str) -> bool {
    headers
        .get_all(key)
        .iter()
        .any(|v| contains_ci(&String::from_utf8_lossy(v), needle))
}

/// Civil day (UTC) of a timestamp, as days from epoch.
fn day_of(ts: i64) -> i64 {
    let dt = Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now);
    i64::from(dt.num_days_from_ce())
}

pub fn eval(key: &SearchKey, ctx: &SearchCtx<'_>) -> bool {
    match key {
        SearchKey::All => true,
        SearchKey::And(keys) => keys.iter().all(|k| eval(k, ctx)),
        SearchKey::Or(a, b) => eval(a, ctx) || eval(b, ctx),
        SearchKey::Not(k) => !eval(k, ctx),
        SearchKey::SeqSet(set) => set_contains(set, ctx.seq, ctx.max_seq),
        SearchKey::Uid(set) => set_contains(set, ctx.uid as u32, ctx.max_uid as u32),
        SearchKey::Keyword(flag) => ctx.flags.contains(flag),
        SearchKey::Unkeyword(flag) => !ctx.flags.contains(flag),
        SearchKey::From(s) => header_contains(ctx.headers, "From", s),
        SearchKey::To(s) => header_contains(ctx.headers, "To", s),
        SearchKey::Cc(s) => header_contains(ctx.headers, "Cc", s),
        SearchKey::Bcc(s) => header_contains(ctx.headers, "Bcc", s),
        SearchKey::Subject(s) => header_contains(ctx.headers, "Subject", s),
        SearchKey::Header(name, s) => {
            if s.is_empty() {
                ctx.headers.get(name).is_some()
            } else {
                header_contains(ctx.headers, name, s)
            }
        }
        SearchKey::Body(s) => ctx.body.map_or(false, |b| contains_ci(b, s)),
        SearchKey::Text(s) => {
            ctx.body.map_or(false, |b| contains_ci(b, s))
                || ctx
                    .headers
                    .iter()
                    .any(|(k, v)| {
                        contains_ci(k, s) || contains_ci(&String::from_utf8_lossy(v), s)
                    })
        }
        SearchKey::Before(ts) => day_of(ctx.date) < day_of(*ts),
        SearchKey::On(ts) => day_of(ctx.date) == day_of(*ts),
        SearchKey::Since(ts) => day_of(ctx.date) >= day_of(*ts),
        SearchKey::Larger(n) => ctx.size > *n as i64,
        SearchKey::Smaller(n) => ctx.size < *n as i64,
        SearchKey::ModSeq(n) => ctx.modseq >= *n,
        SearchKey::New => ctx.flags.contains(FLAG_RECENT) && !ctx.flags.contains(FLAG_SEEN),
        SearchKey::Old => !ctx.flags.contains(FLAG_RECENT),
    }
}

/// Flag-name sugar (`ANSWERED`, `UNSEEN`, ...) used by the parser.
pub fn flag_key(word: &str) -> Option<SearchKey> {
    let make = |flag: &str, negated: bool| {
        if negated {
            SearchKey::Unkeyword(flag.to_string())
        } else {
            SearchKey::Keyword(flag.to_string())
        }
    };
    Some(match word {
        "ANSWERED" => make(FLAG_ANSWERED, false),
        "UNANSWERED" => make(FLAG_ANSWERED, true),
        "DELETED" => make(FLAG_DELETED, false),
        "UNDELETED" => make(FLAG_DELETED, true),
        "DRAFT" => make(FLAG_DRAFT, false),
        "UNDRAFT" => make(FLAG_DRAFT, true),
        "FLAGGED" => make(FLAG_FLAGGED, false),
        "UNFLAGGED" => make(FLAG_FLAGGED, true),
        "SEEN" => make(FLAG_SEEN, false),
        "UNSEEN" => make(FLAG_SEEN, true),
        "RECENT" => make(FLAG_RECENT, false),
        "NEW" => SearchKey::New,
        "OLD" => SearchKey::Old,
        _ => return None,
    })
}

/// Parse an IMAP date (`1-Feb-2020` or `"1-Feb-2020"`) to a timestamp.
pub fn parse_imap_date(s: &str) -> Option<i64> {
    let s = s.trim_matches('"');
    let mut pieces = s.splitn(3, '-');
    let day: u32 = pieces.next()?.trim().parse().ok()?;
    let month = match pieces.next()?.to_ascii_lowercase().as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    let year: i32 = pieces.next()?.trim().parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(
        date.and_hms_opt(0, 0, 0)?
            .and_utc()
            .timestamp(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(flags: &'a FlagSet, headers: &'a Headers) -> SearchCtx<'a> {
        SearchCtx {
            seq: 2,
            max_seq: 5,
            uid: 20,
            max_uid: 50,
            modseq: 7,
            size: 1000,
            date: parse_imap_date("15-Jun-2024").unwrap(),
            flags,
            headers,
            body: Some("the quick brown fox"),
        }
    }

    fn sample_headers() -> Headers {
        let (h, _) = Headers::parse(
            b"From: Alice <alice@example.org>\r\nTo: bob@remote.net\r\nSubject: Project plan\r\n\r\n",
        )
        .unwrap();
        h
    }

    #[test]
    fn flag_and_header_keys() {
        let flags = FlagSet::from_iter([FLAG_SEEN]);
        let headers = sample_headers();
        let c = ctx(&flags, &headers);
        assert!(eval(&SearchKey::Keyword(FLAG_SEEN.into()), &c));
        assert!(!eval(&SearchKey::Keyword(FLAG_DELETED.into()), &c));
        assert!(eval(&SearchKey::From("alice".into()), &c));
        assert!(eval(&SearchKey::Subject("project".into()), &c));
        assert!(!eval(&SearchKey::Subject("unrelated".into()), &c));
        assert!(eval(&SearchKey::Header("to".into(), "remote".into()), &c));
        assert!(eval(&SearchKey::Header("subject".into(), "".into()), &c));
    }

    #[test]
    fn logic_and_ranges() {
        let flags = FlagSet::new();
        let headers = sample_headers();
        let c = ctx(&flags, &headers);
        let key = SearchKey::And(vec![
            SearchKey::Uid(vec![SeqRange { start: 10, end: 30 }]),
            SearchKey::Not(Box::new(SearchKey::Keyword(FLAG_SEEN.into()))),
        ]);
        assert!(eval(&key, &c));
        let either = SearchKey::Or(
            Box::new(SearchKey::Smaller(10)),
            Box::new(SearchKey::Larger(500)),
        );
        assert!(eval(&either, &c));
    }

    #[test]
    fn dates_compare_by_day() {
        let flags = FlagSet::new();
        let headers = sample_headers();
        let c = ctx(&flags, &headers);
        assert!(eval(&SearchKey::On(parse_imap_date("15-Jun-2024").unwrap()), &c));
        assert!(eval(&SearchKey::Since(parse_imap_date("15-Jun-2024").unwrap()), &c));
        assert!(eval(&SearchKey::Before(parse_imap_date("16-Jun-2024").unwrap()), &c));
        assert!(!eval(&SearchKey::Before(parse_imap_date("15-Jun-2024").unwrap()), &c));
    }

    #[test]
    fn body_and_text() {
        let flags = FlagSet::new();
        let headers = sample_headers();
        let c = ctx(&flags, &headers);
        assert!(eval(&SearchKey::Body("BROWN".into()), &c));
        assert!(!eval(&SearchKey::Body("purple".into()), &c));
        // TEXT also matches headers.
        assert!(eval(&SearchKey::Text("example.org".into()), &c));
        assert!(needs_body(&SearchKey::Not(Box::new(SearchKey::Text("x".into())))));
        assert!(!needs_body(&SearchKey::From("x".into())));
    }

    #[test]
    fn modseq_criterion() {
        let flags = FlagSet::new();
        let headers = sample_headers();
        let c = ctx(&flags, &headers);
        assert!(eval(&SearchKey::ModSeq(7), &c));
        assert!(eval(&SearchKey::ModSeq(3), &c));
        assert!(!eval(&SearchKey::ModSeq(8), &c));
    }

    #[test]
    fn date_parser() {
        assert!(parse_imap_date("1-Feb-2020").is_some());
        assert!(parse_imap_date("\"28-Dec-1999\"").is_some());
        assert!(parse_imap_date("31-Foo-2020").is_none());
    }
}
