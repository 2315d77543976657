//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Mailstore.
//
// Mailstore is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailstore is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Mailstore. If not, see <http://www.gnu.org/licenses/>.

//! Linear-scan search over the messages of a selected mailbox.
//!
//! A query is compiled into a postfix program of `Op`s, which is then run
//! against each message. Sequence sets are resolved against the view once at
//! compile time.

use chrono::prelude::*;
use regex::Regex;

use crate::store::identity;
use crate::store::model::*;
use crate::store::selected::SelectedMailbox;
use crate::support::error::Error;

/// One criterion of a search. A list of keys is satisfied when all of them
/// are.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchKey {
    All,
    SequenceSet(SequenceSet),
    Answered,
    Deleted,
    Draft,
    Flagged,
    Seen,
    Unanswered,
    Undeleted,
    Undraft,
    Unflagged,
    Unseen,
    Keyword(String),
    Unkeyword(String),
    /// Recent and not seen.
    New,
    /// Not recent.
    Old,
    Recent,
    /// Internal date before the given day.
    Before(NaiveDate),
    On(NaiveDate),
    /// Internal date on or after the given day.
    Since(NaiveDate),
    /// Like the above, but against the `Date` header.
    SentBefore(NaiveDate),
    SentOn(NaiveDate),
    SentSince(NaiveDate),
    Larger(u64),
    Smaller(u64),
    Header(String, String),
    Subject(String),
    From(String),
    To(String),
    Cc(String),
    Bcc(String),
    Body(String),
    /// Matches the headers or the body.
    Text(String),
    /// Messages changed at or after the given mod-sequence.
    Modseq(u64),
    EmailId(String),
    ThreadId(String),
    Not(Box<SearchKey>),
    Or(Box<SearchKey>, Box<SearchKey>),
    And(Vec<SearchKey>),
}

#[derive(Debug)]
enum Op {
    True,
    And,
    Or,
    Not,
    Flag(Flag),
    Recent,
    UidIn(Vec<Uid>),
    InternalDate(NaiveDate, Ordering3),
    SentDate(NaiveDate, Ordering3),
    Size(u64, Ordering3),
    Header(String, Regex),
    AnyHeader(Regex),
    Body(Regex),
    Modseq(u64),
    EmailId(String),
    ThreadId(String),
}

/// Which outcomes of a comparison of the message's value against the
/// operand are accepted: less, equal, greater.
#[derive(Clone, Copy, Debug)]
struct Ordering3(bool, bool, bool);

impl Ordering3 {
    const LT: Self = Ordering3(true, false, false);
    const EQ: Self = Ordering3(false, true, false);
    const GE: Self = Ordering3(false, true, true);
    const GT: Self = Ordering3(false, false, true);

    fn accepts<T: Ord>(self, value: &T, operand: &T) -> bool {
        match value.cmp(operand) {
            std::cmp::Ordering::Less => self.0,
            std::cmp::Ordering::Equal => self.1,
            std::cmp::Ordering::Greater => self.2,
        }
    }
}

/// A compiled query.
#[derive(Debug)]
pub struct Program {
    ops: Vec<Op>,
}

impl Program {
    pub fn compile(
        keys: &[SearchKey],
        view: &SelectedMailbox,
    ) -> Result<Self, Error> {
        let mut ops = Vec::new();
        compile_and(&mut ops, keys, view)?;
        Ok(Program { ops })
    }

    /// Whether evaluation needs the message content.
    pub fn requirement(&self) -> FetchRequirement {
        if self.ops.iter().any(|op| {
            matches!(*op, Op::Header(..) | Op::AnyHeader(..) | Op::Body(..))
                || matches!(*op, Op::SentDate(..))
        }) {
            FetchRequirement::CONTENT
        } else {
            FetchRequirement::METADATA
        }
    }

    /// Run the program against `message`, whose session-level recency is
    /// `recent`.
    pub fn eval(&self, message: &Message, recent: bool) -> bool {
        let content: &[u8] = message.content.as_deref().unwrap_or(&[]);
        let (_, body) = identity::split_message(content);
        let headers = identity::headers(content);
        let header_matches = |name: Option<&str>, rx: &Regex| {
            headers
                .iter()
                .filter(|&&(ref n, _)| {
                    name.map_or(true, |name| n.eq_ignore_ascii_case(name))
                })
                .any(|&(_, ref v)| rx.is_match(v))
        };

        let mut stack: Vec<bool> = Vec::with_capacity(8);
        for op in &self.ops {
            let value = match *op {
                Op::True => true,
                Op::And => {
                    let b = stack.pop().unwrap_or(true);
                    let a = stack.pop().unwrap_or(true);
                    a && b
                }
                Op::Or => {
                    let b = stack.pop().unwrap_or(false);
                    let a = stack.pop().unwrap_or(false);
                    a || b
                }
                Op::Not => !stack.pop().unwrap_or(false),
                Op::Flag(ref flag) => message.has_flag(flag),
                Op::Recent => recent,
                Op::UidIn(ref uids) => {
                    uids.binary_search(&message.uid).is_ok()
                }
                Op::InternalDate(ref date, ord) => {
                    let day = message.internal_date.naive_utc().date();
                    ord.accepts(&day, date)
                }
                Op::SentDate(ref date, ord) => {
                    sent_date(&headers).map_or(false, |d| ord.accepts(&d, date))
                }
                Op::Size(size, ord) => ord.accepts(&message.size, &size),
                Op::Header(ref name, ref rx) => {
                    header_matches(Some(name.as_str()), rx)
                }
                Op::AnyHeader(ref rx) => header_matches(None, rx),
                Op::Body(ref rx) => {
                    rx.is_match(&String::from_utf8_lossy(body))
                }
                Op::Modseq(modseq) => message.modseq >= modseq,
                Op::EmailId(ref id) => message.email_id == *id,
                Op::ThreadId(ref id) => message.thread_id == *id,
            };
            stack.push(value);
        }

        stack.pop().unwrap_or(true)
    }
}

fn sent_date(headers: &[(String, String)]) -> Option<NaiveDate> {
    headers
        .iter()
        .find(|&&(ref n, _)| n.eq_ignore_ascii_case("Date"))
        .and_then(|&(_, ref v)| DateTime::parse_from_rfc2822(v.trim()).ok())
        .map(|d| d.naive_local().date())
}

fn compile_and(
    dst: &mut Vec<Op>,
    keys: &[SearchKey],
    view: &SelectedMailbox,
) -> Result<(), Error> {
    if keys.is_empty() {
        dst.push(Op::True);
        return Ok(());
    }

    for (ix, key) in keys.iter().enumerate() {
        compile_one(dst, key, view)?;
        if ix > 0 {
            dst.push(Op::And);
        }
    }
    Ok(())
}

fn compile_not(dst: &mut Vec<Op>, op: Op) {
    dst.push(op);
    dst.push(Op::Not);
}

fn compile_one(
    dst: &mut Vec<Op>,
    key: &SearchKey,
    view: &SelectedMailbox,
) -> Result<(), Error> {
    match *key {
        SearchKey::All => dst.push(Op::True),
        SearchKey::SequenceSet(ref set) => {
            let mut uids = view.resolve(set)?;
            uids.sort_unstable();
            dst.push(Op::UidIn(uids));
        }

        SearchKey::Answered => dst.push(Op::Flag(Flag::Answered)),
        SearchKey::Deleted => dst.push(Op::Flag(Flag::Deleted)),
        SearchKey::Draft => dst.push(Op::Flag(Flag::Draft)),
        SearchKey::Flagged => dst.push(Op::Flag(Flag::Flagged)),
        SearchKey::Seen => dst.push(Op::Flag(Flag::Seen)),
        SearchKey::Keyword(ref kw) => {
            dst.push(Op::Flag(Flag::Keyword(kw.clone())))
        }
        SearchKey::Unanswered => compile_not(dst, Op::Flag(Flag::Answered)),
        SearchKey::Undeleted => compile_not(dst, Op::Flag(Flag::Deleted)),
        SearchKey::Undraft => compile_not(dst, Op::Flag(Flag::Draft)),
        SearchKey::Unflagged => compile_not(dst, Op::Flag(Flag::Flagged)),
        SearchKey::Unseen => compile_not(dst, Op::Flag(Flag::Seen)),
        SearchKey::Unkeyword(ref kw) => {
            compile_not(dst, Op::Flag(Flag::Keyword(kw.clone())))
        }

        SearchKey::New => {
            dst.push(Op::Recent);
            compile_not(dst, Op::Flag(Flag::Seen));
            dst.push(Op::And);
        }
        SearchKey::Old => compile_not(dst, Op::Recent),
        SearchKey::Recent => dst.push(Op::Recent),

        SearchKey::Before(date) => {
            dst.push(Op::InternalDate(date, Ordering3::LT))
        }
        SearchKey::On(date) => dst.push(Op::InternalDate(date, Ordering3::EQ)),
        SearchKey::Since(date) => {
            dst.push(Op::InternalDate(date, Ordering3::GE))
        }
        SearchKey::SentBefore(date) => {
            dst.push(Op::SentDate(date, Ordering3::LT))
        }
        SearchKey::SentOn(date) => dst.push(Op::SentDate(date, Ordering3::EQ)),
        SearchKey::SentSince(date) => {
            dst.push(Op::SentDate(date, Ordering3::GE))
        }

        SearchKey::Larger(size) => dst.push(Op::Size(size, Ordering3::GT)),
        SearchKey::Smaller(size) => dst.push(Op::Size(size, Ordering3::LT)),

        SearchKey::Header(ref name, ref pat) => {
            dst.push(Op::Header(name.clone(), to_regex(pat)?))
        }
        SearchKey::Subject(ref pat) => {
            dst.push(Op::Header("Subject".to_owned(), to_regex(pat)?))
        }
        SearchKey::From(ref pat) => {
            dst.push(Op::Header("From".to_owned(), to_regex(pat)?))
        }
        SearchKey::To(ref pat) => {
            dst.push(Op::Header("To".to_owned(), to_regex(pat)?))
        }
        SearchKey::Cc(ref pat) => {
            dst.push(Op::Header("Cc".to_owned(), to_regex(pat)?))
        }
        SearchKey::Bcc(ref pat) => {
            dst.push(Op::Header("Bcc".to_owned(), to_regex(pat)?))
        }
        SearchKey::Body(ref pat) => dst.push(Op::Body(to_regex(pat)?)),
        SearchKey::Text(ref pat) => {
            dst.push(Op::AnyHeader(to_regex(pat)?));
            dst.push(Op::Body(to_regex(pat)?));
            dst.push(Op::Or);
        }

        SearchKey::Modseq(modseq) => dst.push(Op::Modseq(modseq)),
        SearchKey::EmailId(ref id) => dst.push(Op::EmailId(id.clone())),
        SearchKey::ThreadId(ref id) => dst.push(Op::ThreadId(id.clone())),

        SearchKey::Not(ref key) => {
            compile_one(dst, key, view)?;
            dst.push(Op::Not);
        }
        SearchKey::Or(ref a, ref b) => {
            compile_one(dst, a, view)?;
            compile_one(dst, b, view)?;
            dst.push(Op::Or);
        }
        SearchKey::And(ref keys) => compile_and(dst, keys, view)?,
    }

    Ok(())
}

/// Build a case-insensitive substring matcher for `pat`, where any run of
/// whitespace matches any run of whitespace.
fn to_regex(pat: &str) -> Result<Regex, Error> {
    let rx = pat
        .split_whitespace()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("[ \r\n\t]+");

    regex::RegexBuilder::new(&rx)
        .case_insensitive(true)
        .build()
        .map_err(|e| Error::Unsupported(format!("search pattern: {}", e)))
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::store::selected::{Changes, ViewRegistry};

    fn message(uid: u32, flags: &[Flag], data: &str) -> Message {
        let append = AppendMessage {
            internal_date: Some(Utc.ymd(2020, 6, 15).and_hms(12, 0, 0)),
            ..AppendMessage::new(data)
        };
        let mut m = Message::for_append(
            Uid::u(uid),
            &append,
            flags.iter().cloned().collect(),
            false,
            uid as u64,
        );
        m.content = Some(Arc::from(data.as_bytes()));
        m
    }

    fn view(messages: &[Message]) -> SelectedMailbox {
        let mut registry = ViewRegistry::new();
        let mut view = SelectedMailbox::new(
            registry.register(),
            "id".to_owned(),
            "INBOX".to_owned(),
            false,
            PermanentFlags::unrestricted(),
            1,
        );
        view.apply(Changes::Full(messages.to_vec()), None);
        view.take_update();
        view
    }

    fn hits(keys: &[SearchKey], messages: &[Message]) -> Vec<u32> {
        let view = view(messages);
        let program = Program::compile(keys, &view).unwrap();
        messages
            .iter()
            .filter(|m| program.eval(m, view.is_recent(m.uid)))
            .map(|m| m.uid.get())
            .collect()
    }

    fn corpus() -> Vec<Message> {
        vec![
            message(
                1,
                &[Flag::Seen],
                "From: Alice <alice@example.com>\r\n\
                 Subject: Quarterly  report\r\n\
                 Date: Mon, 1 Jun 2020 09:00:00 +0000\r\n\
                 \r\n\
                 Numbers are up.\r\n",
            ),
            message(
                2,
                &[Flag::Flagged, Flag::Keyword("$Work".to_owned())],
                "From: Bob <bob@example.com>\r\n\
                 Subject: Lunch?\r\n\
                 Date: Tue, 16 Jun 2020 09:00:00 +0000\r\n\
                 \r\n\
                 Pizza or tacos?\r\n",
            ),
            message(3, &[Flag::Deleted], "Subject: spam\r\n\r\nBuy now\r\n"),
        ]
    }

    #[test]
    fn flags_and_logic() {
        let corpus = corpus();
        assert_eq!(vec![1, 2, 3], hits(&[], &corpus));
        assert_eq!(vec![1], hits(&[SearchKey::Seen], &corpus));
        assert_eq!(vec![2, 3], hits(&[SearchKey::Unseen], &corpus));
        assert_eq!(
            vec![2],
            hits(&[SearchKey::Unseen, SearchKey::Undeleted], &corpus)
        );
        assert_eq!(
            vec![1, 3],
            hits(
                &[SearchKey::Or(
                    Box::new(SearchKey::Seen),
                    Box::new(SearchKey::Deleted)
                )],
                &corpus
            )
        );
        assert_eq!(
            vec![2],
            hits(&[SearchKey::Keyword("$WORK".to_owned())], &corpus)
        );
        assert_eq!(
            vec![1, 3],
            hits(
                &[SearchKey::Not(Box::new(SearchKey::Keyword(
                    "$work".to_owned()
                )))],
                &corpus
            )
        );
        // Nothing in this view is recent
        assert!(hits(&[SearchKey::New], &corpus).is_empty());
        assert_eq!(vec![1, 2, 3], hits(&[SearchKey::Old], &corpus));
    }

    #[test]
    fn content_and_dates() {
        let corpus = corpus();
        assert_eq!(
            vec![1],
            hits(&[SearchKey::Subject("quarterly report".to_owned())], &corpus)
        );
        assert_eq!(
            vec![2],
            hits(&[SearchKey::From("BOB@".to_owned())], &corpus)
        );
        assert_eq!(
            vec![2],
            hits(&[SearchKey::Body("tacos".to_owned())], &corpus)
        );
        assert_eq!(
            vec![3],
            hits(&[SearchKey::Text("spam".to_owned())], &corpus)
        );

        let june = |d| NaiveDate::from_ymd(2020, 6, d);
        assert_eq!(vec![1], hits(&[SearchKey::SentBefore(june(2))], &corpus));
        assert_eq!(vec![2], hits(&[SearchKey::SentSince(june(16))], &corpus));
        assert_eq!(vec![1, 2, 3], hits(&[SearchKey::On(june(15))], &corpus));
        assert!(hits(&[SearchKey::Since(june(16))], &corpus).is_empty());
    }

    #[test]
    fn sets_sizes_and_identity() {
        let corpus = corpus();
        let set = SequenceSet::Seqnums(SeqRange::range(
            Seqnum::u(2),
            Seqnum::u(3),
        ));
        assert_eq!(vec![2, 3], hits(&[SearchKey::SequenceSet(set)], &corpus));
        assert_eq!(
            vec![3],
            hits(&[SearchKey::Smaller(corpus[1].size)], &corpus)
        );
        assert_eq!(vec![2, 3], hits(&[SearchKey::Modseq(2)], &corpus));
        assert_eq!(
            vec![1],
            hits(&[SearchKey::EmailId(corpus[0].email_id.clone())], &corpus)
        );

        let view = view(&corpus);
        let past_end = SequenceSet::Seqnums(SeqRange::just(Seqnum::u(9)));
        assert_matches!(
            Err(Error::NxMessage),
            Program::compile(&[SearchKey::SequenceSet(past_end)], &view)
        );
    }
}
