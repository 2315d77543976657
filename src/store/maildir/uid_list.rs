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

//! The `uidlist` file, which maps UIDs to maildir files.
//!
//! The first line is a header of space-separated fields:
//!
//! ```text
//! 3 V<uid-validity> N<next-uid> G<guid> M<modseq>
//! ```
//!
//! `3` is the format version. Every following line describes one live
//! message:
//!
//! ```text
//! <uid> [<letter><value> ...] :<basename>
//! ```
//!
//! The basename is the maildir file name without the `:2,` info suffix, and
//! may contain spaces. The known per-message fields are `W` (size in bytes),
//! `D` (internal date in UNIX seconds), `E` (email id) and `H` (thread id).
//! Fields with other letters are carried through unchanged so that files
//! written by newer versions survive a round trip.

use std::fmt::{self, Write as _};

use chrono::prelude::*;

use crate::store::model::Uid;
use crate::support::error::Error;

pub const FORMAT_VERSION: &str = "3";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UidList {
    pub uid_validity: u32,
    pub next_uid: Uid,
    /// The mailbox id, 32 hex digits.
    pub guid: String,
    /// Incremented on every committed write.
    pub modseq: u64,
    /// Sorted ascending by UID.
    pub records: Vec<UidRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UidRecord {
    pub uid: Uid,
    pub fields: Vec<(char, String)>,
    pub basename: String,
}

impl UidRecord {
    pub fn new(uid: Uid, basename: String) -> Self {
        UidRecord {
            uid,
            fields: Vec::new(),
            basename,
        }
    }

    pub fn field(&self, letter: char) -> Option<&str> {
        self.fields
            .iter()
            .find(|&&(l, _)| l == letter)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_field(&mut self, letter: char, value: impl ToString) {
        let value = value.to_string();
        match self.fields.iter_mut().find(|(l, _)| *l == letter) {
            Some(existing) => existing.1 = value,
            None => self.fields.push((letter, value)),
        }
    }

    pub fn size(&self) -> Option<u64> {
        self.field('W').and_then(|v| v.parse().ok())
    }

    pub fn internal_date(&self) -> Option<DateTime<Utc>> {
        self.field('D')
            .and_then(|v| v.parse::<i64>().ok())
            .map(|secs| Utc.timestamp(secs, 0))
    }

    pub fn email_id(&self) -> Option<&str> {
        self.field('E')
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.field('H')
    }
}

impl UidList {
    pub fn new(uid_validity: u32, guid: String) -> Self {
        UidList {
            uid_validity,
            next_uid: Uid::MIN,
            guid,
            modseq: 0,
            records: Vec::new(),
        }
    }

    pub fn find(&self, uid: Uid) -> Option<&UidRecord> {
        self.records
            .binary_search_by_key(&uid, |r| r.uid)
            .ok()
            .map(|ix| &self.records[ix])
    }

    /// Allocate the next UID and append a record for `basename`.
    pub fn push(&mut self, basename: String) -> Result<&mut UidRecord, Error> {
        let uid = self.next_uid;
        self.next_uid = uid.next().ok_or(Error::MailboxFull)?;
        self.records.push(UidRecord::new(uid, basename));
        let ix = self.records.len() - 1;
        Ok(&mut self.records[ix])
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut lines = text.lines();
        let header = lines.next().ok_or_else(|| corrupt("empty file"))?;
        let mut tokens = header.split(' ').filter(|t| !t.is_empty());
        if Some(FORMAT_VERSION) != tokens.next() {
            return Err(corrupt("unsupported version"));
        }

        let mut uid_validity = None;
        let mut next_uid = None;
        let mut guid = None;
        let mut modseq = 0u64;
        for token in tokens {
            let mut chars = token.chars();
            let letter = chars.next();
            let value = chars.as_str();
            match letter {
                Some('V') => {
                    uid_validity = Some(
                        value.parse().map_err(|_| corrupt("bad validity"))?,
                    );
                }
                Some('N') => {
                    next_uid = Some(
                        value
                            .parse::<u32>()
                            .ok()
                            .and_then(Uid::of)
                            .ok_or_else(|| corrupt("bad next uid"))?,
                    );
                }
                Some('G') => guid = Some(value.to_owned()),
                Some('M') => {
                    modseq =
                        value.parse().map_err(|_| corrupt("bad modseq"))?;
                }
                _ => (),
            }
        }

        let mut this = UidList {
            uid_validity: uid_validity
                .ok_or_else(|| corrupt("missing validity"))?,
            next_uid: next_uid.ok_or_else(|| corrupt("missing next uid"))?,
            guid: guid.ok_or_else(|| corrupt("missing guid"))?,
            modseq,
            records: Vec::new(),
        };

        for line in lines {
            if line.is_empty() {
                continue;
            }
            this.records.push(parse_record(line)?);
        }

        this.records.sort_by_key(|r| r.uid);
        this.records.dedup_by_key(|r| r.uid);
        if this.records.last().map_or(false, |r| r.uid >= this.next_uid) {
            return Err(corrupt("uid beyond next uid"));
        }

        Ok(this)
    }
}

fn parse_record(line: &str) -> Result<UidRecord, Error> {
    let name_start = line
        .find(" :")
        .ok_or_else(|| corrupt("record without file name"))?;
    let basename = &line[name_start + 2..];
    if basename.is_empty() {
        return Err(corrupt("record without file name"));
    }

    let mut tokens = line[..name_start].split(' ').filter(|t| !t.is_empty());
    let uid = tokens
        .next()
        .and_then(|t| t.parse::<u32>().ok())
        .and_then(Uid::of)
        .ok_or_else(|| corrupt("bad uid"))?;

    let mut record = UidRecord::new(uid, basename.to_owned());
    for token in tokens {
        let mut chars = token.chars();
        if let Some(letter) = chars.next() {
            record.fields.push((letter, chars.as_str().to_owned()));
        }
    }

    Ok(record)
}

fn corrupt(what: &str) -> Error {
    Error::CorruptIndex(format!("uidlist: {}", what))
}

impl fmt::Display for UidList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} V{} N{} G{} M{}",
            FORMAT_VERSION,
            self.uid_validity,
            self.next_uid,
            self.guid,
            self.modseq
        )?;

        let mut line = String::new();
        for record in &self.records {
            line.clear();
            let _ = write!(line, "{}", record.uid);
            for (letter, value) in &record.fields {
                let _ = write!(line, " {}{}", letter, value);
            }
            let _ = write!(line, " :{}", record.basename);
            writeln!(f, "{}", line)?;
        }

        Ok(())
    }
}
