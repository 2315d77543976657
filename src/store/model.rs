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

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::convert::{TryFrom, TryInto};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::num::{NonZeroU32, NonZeroU64};
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::str::FromStr;
use std::sync::Arc;

use bitflags::bitflags;
use chrono::prelude::*;
use serde::{Deserialize, Serialize};

use super::identity;
use crate::support::error::Error;

/// Uniquely identifies a message within a single mailbox incarnation.
///
/// UIDs start at 1 and increase monotonically as messages are added to the
/// mailbox. Within one UID validity, a UID is never reused, even after the
/// message it named has been expunged.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Uid(pub NonZeroU32);

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uid({})", self.0.get())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

// This isn't a useful default implementation, but is here so that things
// containing SeqRange<ID> can still derive Default.
impl Default for Uid {
    fn default() -> Self {
        Uid::MIN
    }
}

impl Uid {
    // Unsafe because new() isn't const for some reason
    pub const MIN: Self = unsafe { Uid(NonZeroU32::new_unchecked(1)) };
    pub const MAX: Self = unsafe { Uid(NonZeroU32::new_unchecked(u32::MAX)) };

    pub fn of(uid: u32) -> Option<Self> {
        NonZeroU32::new(uid).map(Uid)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    pub fn next(self) -> Option<Self> {
        self.0.get().checked_add(1).and_then(Uid::of)
    }

    #[cfg(test)]
    pub fn u(uid: u32) -> Self {
        Uid::of(uid).unwrap()
    }
}

impl TryFrom<u32> for Uid {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        Self::of(v).ok_or(())
    }
}

impl Into<u32> for Uid {
    fn into(self) -> u32 {
        self.0.get()
    }
}

/// The position of a message within a selected view, starting from 1.
///
/// The sequence number of a message is one plus the number of messages in
/// the view with a lesser UID. It is only meaningful relative to one
/// `SelectedMailbox` at one point in time.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Seqnum(pub NonZeroU32);

impl Default for Seqnum {
    fn default() -> Self {
        Seqnum::MIN
    }
}

impl Seqnum {
    // Unsafe because new() isn't const for some reason
    pub const MIN: Self = unsafe { Seqnum(NonZeroU32::new_unchecked(1)) };
    pub const MAX: Self =
        unsafe { Seqnum(NonZeroU32::new_unchecked(u32::MAX)) };

    pub fn of(seqnum: u32) -> Option<Self> {
        NonZeroU32::new(seqnum).map(Seqnum)
    }

    #[cfg(test)]
    pub fn u(seqnum: u32) -> Self {
        Seqnum::of(seqnum).unwrap()
    }

    pub fn to_index(self) -> usize {
        self.0.get() as usize - 1
    }

    pub fn from_index(ix: usize) -> Self {
        ix.checked_add(1)
            .and_then(|s| s.try_into().ok())
            .and_then(Seqnum::of)
            .unwrap_or(Seqnum::MAX)
    }
}

impl TryFrom<u32> for Seqnum {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        Self::of(v).ok_or(())
    }
}

impl Into<u32> for Seqnum {
    fn into(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Debug for Seqnum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Seqnum({})", self.0.get())
    }
}

/// A value of a mailbox's modification counter.
///
/// Every mutation of a mailbox advances its counter by one and tags the UIDs
/// it touched with the new value. The first mutation of a mailbox has
/// `Modseq::MIN`. A mailbox that has never been mutated has no `Modseq` at
/// all, which is why this is usually seen inside an `Option`.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Modseq(NonZeroU64);

impl Modseq {
    // Unsafe because NonZeroU64::new() is non-const.
    pub const MIN: Self = unsafe { Modseq(NonZeroU64::new_unchecked(1)) };

    pub fn of(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Modseq)
    }

    pub fn raw(self) -> u64 {
        self.0.get()
    }

    pub fn next(self) -> Self {
        Modseq(
            NonZeroU64::new(self.0.get().saturating_add(1)).unwrap_or(self.0),
        )
    }

    /// Return the value following `prev`, where `None` is the state before
    /// the first mutation.
    pub fn after(prev: Option<Modseq>) -> Self {
        prev.map_or(Modseq::MIN, Modseq::next)
    }
}

impl fmt::Debug for Modseq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Modseq({})", self.0.get())
    }
}

/// A "sequence set range" of sequence numbers or UIDs.
///
/// Internally, this is maintained as a minimal sorted set of inclusive ranges.
/// It does not maintain information on the original fragmentation, ordering,
/// or duplication.
///
/// The `Display` format puts this into minimal IMAP wire format.
#[derive(Clone, PartialEq, Eq)]
pub struct SeqRange<T> {
    parts: BTreeMap<u32, u32>,
    _t: PhantomData<T>,
}

impl<T> SeqRange<T> {
    /// Create a new, empty range.
    pub fn new() -> Self {
        SeqRange {
            parts: BTreeMap::new(),
            _t: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl<T: TryFrom<u32> + Into<u32> + Copy> SeqRange<T> {
    /// Create a range containing just the given item.
    pub fn just(item: T) -> Self {
        let mut this = SeqRange::new();
        this.insert(item, item);
        this
    }

    /// Create a range containing just a single, simple range.
    pub fn range(start: T, end: T) -> Self {
        let mut this = SeqRange::new();
        this.insert(start, end);
        this
    }

    /// Add `item` to the end of this range.
    ///
    /// This is fast when items arrive in ascending order, which is the common
    /// case. Out-of-order items fall back to `insert()`.
    pub fn append(&mut self, item: T) {
        let raw: u32 = item.into();

        if let Some(end) = self.parts.values_mut().next_back() {
            if raw <= *end {
                self.insert_raw(raw, raw);
                return;
            }

            if raw == *end + 1 {
                *end = raw;
                return;
            }
        }

        self.parts.insert(raw, raw);
    }

    /// Return the number of items in this set.
    pub fn len(&self) -> usize {
        self.parts
            .iter()
            .map(|(start, end)| (end - start) as usize + 1)
            .sum()
    }

    /// Insert the given inclusive range into this sequence set.
    pub fn insert(&mut self, start_incl: T, end_incl: T) {
        let start: u32 = start_incl.into();
        let end: u32 = end_incl.into();
        self.insert_raw(start.min(end), end.max(start));
    }

    fn insert_raw(&mut self, start_incl: u32, mut end_incl: u32) {
        // If this range overlaps any later ranges, fuse them.
        loop {
            let following = self
                .parts
                .range((Excluded(start_incl), Unbounded))
                .next()
                .map(|(&start, &end)| (start, end));

            if let Some((following_start, following_end)) = following {
                if following_start - 1 <= end_incl {
                    end_incl = end_incl.max(following_end);
                    self.parts.remove(&following_start);
                    continue;
                }
            }

            break;
        }

        let preceding = self
            .parts
            .range((Unbounded, Included(end_incl)))
            .next_back()
            .map(|(&start, &end)| (start, end));
        if let Some((preceding_start, preceding_end)) = preceding {
            if preceding_end.saturating_add(1) >= start_incl {
                if start_incl < preceding_start {
                    self.parts.remove(&preceding_start);
                    self.parts.insert(start_incl, end_incl.max(preceding_end));
                } else {
                    self.parts
                        .insert(preceding_start, end_incl.max(preceding_end));
                }
                return;
            }
        }

        self.parts.insert(start_incl, end_incl);
    }

    /// Return whether the given item is present in this set.
    pub fn contains(&self, v: T) -> bool {
        let v: u32 = v.into();
        self.parts
            .range(..=v)
            .next_back()
            .filter(|&(_, &end)| end >= v)
            .is_some()
    }

    /// Return an iterator to the items in this set.
    ///
    /// Invalid items and items greater than `max` are silently excluded.
    ///
    /// Items are delivered in strictly ascending order.
    pub fn items<'a>(
        &'a self,
        max: impl Into<u32>,
    ) -> impl Iterator<Item = T> + 'a {
        let max: u32 = max.into();
        self.parts
            .iter()
            .map(|(&start, &end)| (start, end))
            .filter(move |&(start, _)| start <= max)
            .flat_map(move |(start, end)| start..=end.min(max))
            .filter_map(|v| T::try_from(v).ok())
    }

    /// Parse the IMAP-format of the sequence set.
    ///
    /// `splat` is used as the value of elements which specify `*`.
    pub fn parse(raw: &str, splat: T) -> Option<Self> {
        fn do_parse(r: &str, splat: u32) -> Option<u32> {
            if "*" == r {
                Some(splat)
            } else {
                r.parse().ok()
            }
        }

        let splat = splat.into();

        let mut this = Self::new();
        for part in raw.split(',') {
            let mut subs = part.split(':');
            match (subs.next(), subs.next(), subs.next()) {
                (Some(only), None, None) => {
                    let only = do_parse(only, splat)?;
                    this.insert_raw(only, only);
                }
                (Some(start), Some(end), None) => {
                    let start = do_parse(start, splat)?;
                    let end = do_parse(end, splat)?;
                    this.insert_raw(start.min(end), end.max(start));
                }
                _ => return None,
            }
        }

        Some(this)
    }

    /// Return the maximum value in this sequence set, raw.
    pub fn max(&self) -> Option<u32> {
        self.parts.values().rev().copied().next()
    }
}

impl<T> fmt::Display for SeqRange<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (ix, (&start, &end)) in self.parts.iter().enumerate() {
            let delim = if 0 == ix { "" } else { "," };

            if start == end {
                write!(f, "{}{}", delim, start)?;
            } else {
                write!(f, "{}{}:{}", delim, start, end)?;
            }
        }

        Ok(())
    }
}

impl fmt::Debug for SeqRange<Seqnum> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[Seqnum {}]", self)
    }
}

impl fmt::Debug for SeqRange<Uid> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[Uid {}]", self)
    }
}

impl<T> Default for SeqRange<T> {
    fn default() -> Self {
        SeqRange::new()
    }
}

/// A set of messages addressed either by sequence number or by UID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SequenceSet {
    Seqnums(SeqRange<Seqnum>),
    Uids(SeqRange<Uid>),
}

/// A message flag.
///
/// System flags are represented as top-level enum values. Keywords are in the
/// `Keyword` case. Keywords compare case-insensitively (ASCII only).
///
/// `\Recent` is not represented by this enum since it isn't _really_ a flag.
/// It lives on the selected view as a session flag.
#[derive(Clone, Serialize, Deserialize)]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Seen,
    Keyword(String),
}

impl Flag {
    pub const SYSTEM: [Flag; 5] = [
        Flag::Answered,
        Flag::Deleted,
        Flag::Draft,
        Flag::Flagged,
        Flag::Seen,
    ];

    pub fn is_system(&self) -> bool {
        !matches!(*self, Flag::Keyword(..))
    }

    fn rank(&self) -> u8 {
        match *self {
            Flag::Answered => 0,
            Flag::Deleted => 1,
            Flag::Draft => 2,
            Flag::Flagged => 3,
            Flag::Seen => 4,
            Flag::Keyword(..) => 5,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            &Flag::Answered => write!(f, "\\Answered"),
            &Flag::Deleted => write!(f, "\\Deleted"),
            &Flag::Draft => write!(f, "\\Draft"),
            &Flag::Flagged => write!(f, "\\Flagged"),
            &Flag::Seen => write!(f, "\\Seen"),
            &Flag::Keyword(ref kw) => write!(f, "{}", kw),
        }
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <Flag as fmt::Display>::fmt(self, f)
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("\\answered") {
            Ok(Flag::Answered)
        } else if s.eq_ignore_ascii_case("\\deleted") {
            Ok(Flag::Deleted)
        } else if s.eq_ignore_ascii_case("\\draft") {
            Ok(Flag::Draft)
        } else if s.eq_ignore_ascii_case("\\flagged") {
            Ok(Flag::Flagged)
        } else if s.eq_ignore_ascii_case("\\seen") {
            Ok(Flag::Seen)
        } else if s.starts_with('\\') {
            Err(Error::NxFlag)
        } else if !s.is_empty()
            && s.as_bytes().iter().copied().all(is_atom_char)
        {
            Ok(Flag::Keyword(s.to_owned()))
        } else {
            Err(Error::UnsafeName)
        }
    }
}

fn is_atom_char(ch: u8) -> bool {
    match ch {
        0..=b' ' => false,
        127..=255 => false,
        b'(' | b')' | b'{' | b'*' | b'%' | b'\\' | b'"' | b']' => false,
        _ => true,
    }
}

impl PartialEq for Flag {
    fn eq(&self, other: &Flag) -> bool {
        Ordering::Equal == self.cmp(other)
    }
}

impl Eq for Flag {}

impl PartialOrd for Flag {
    fn partial_cmp(&self, other: &Flag) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Flag {
    fn cmp(&self, other: &Flag) -> Ordering {
        match (self, other) {
            // Apparently the expectation is that keywords are
            // case-insensitive. We only do ASCII case-insensitivity to limit
            // the insanity.
            (&Flag::Keyword(ref a), &Flag::Keyword(ref b)) => a
                .bytes()
                .map(|c| c.to_ascii_lowercase())
                .cmp(b.bytes().map(|c| c.to_ascii_lowercase())),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Flag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        if let Flag::Keyword(ref kw) = *self {
            for c in kw.bytes() {
                c.to_ascii_lowercase().hash(state);
            }
        }
    }
}

pub type FlagSet = BTreeSet<Flag>;

/// How a flag update combines the requested flags with the existing ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagMode {
    /// The requested set fully replaces the existing set.
    Replace,
    /// The requested flags are added to the existing set.
    Add,
    /// The requested flags are removed from the existing set.
    Remove,
}

impl FlagMode {
    /// Apply this mode to `current`, returning whether anything changed.
    pub fn apply(self, current: &mut FlagSet, requested: &FlagSet) -> bool {
        match self {
            FlagMode::Replace => {
                if current == requested {
                    false
                } else {
                    *current = requested.clone();
                    true
                }
            }
            FlagMode::Add => {
                let mut changed = false;
                for flag in requested {
                    changed |= current.insert(flag.clone());
                }
                changed
            }
            FlagMode::Remove => {
                let mut changed = false;
                for flag in requested {
                    changed |= current.remove(flag);
                }
                changed
            }
        }
    }
}

/// The flags a mailbox is able to store permanently.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermanentFlags {
    /// Flags which are always permitted, including keywords already defined
    /// in the mailbox.
    pub flags: FlagSet,
    /// Whether keywords not in `flags` may be created (IMAP `\*`).
    pub new_keywords: bool,
}

impl PermanentFlags {
    /// All system flags and any keyword.
    pub fn unrestricted() -> Self {
        PermanentFlags {
            flags: Flag::SYSTEM.iter().cloned().collect(),
            new_keywords: true,
        }
    }

    pub fn permits(&self, flag: &Flag) -> bool {
        self.flags.contains(flag)
            || (self.new_keywords && !flag.is_system())
    }

    /// Return the subset of `requested` which this mailbox can store.
    pub fn filter(&self, requested: &FlagSet) -> FlagSet {
        requested
            .iter()
            .filter(|f| self.permits(f))
            .cloned()
            .collect()
    }
}

bitflags! {
    /// Which parts of a message a caller needs.
    ///
    /// Backends may skip loading message content when only metadata is
    /// requested.
    pub struct FetchRequirement: u32 {
        const METADATA = 1 << 0;
        const HEADERS = 1 << 1;
        const BODY = 1 << 2;
        const CONTENT = Self::HEADERS.bits | Self::BODY.bits;
    }
}

impl FetchRequirement {
    pub fn needs_content(self) -> bool {
        self.intersects(FetchRequirement::CONTENT)
    }
}

/// A message to be appended to a mailbox.
#[derive(Clone, Debug, Default)]
pub struct AppendMessage {
    /// The raw RFC 5322 message.
    pub data: Vec<u8>,
    /// The flags to set on the new message.
    pub flags: Vec<Flag>,
    /// The internal date. If `None`, the time of the append is used.
    pub internal_date: Option<DateTime<Utc>>,
}

impl AppendMessage {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        AppendMessage {
            data: data.into(),
            ..AppendMessage::default()
        }
    }

    pub fn with_flags(mut self, flags: impl IntoIterator<Item = Flag>) -> Self {
        self.flags.extend(flags);
        self
    }
}

/// A message as seen through the storage engines.
///
/// A message with `expunged` set is a tombstone: the UID no longer exists,
/// and the rest of the fields are whatever the caller last knew about it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub uid: Uid,
    pub internal_date: DateTime<Utc>,
    pub flags: FlagSet,
    /// Whether no session has claimed this message as `\Recent` yet.
    pub recent: bool,
    pub email_id: String,
    pub thread_id: String,
    pub size: u64,
    /// The mod-sequence of the last change to this message, or for engines
    /// without a change log, a stamp which changes whenever the message does.
    pub modseq: u64,
    #[serde(default)]
    pub expunged: bool,
    /// The raw message, if the fetch requirement asked for it.
    #[serde(skip)]
    pub content: Option<Arc<[u8]>>,
}

impl Message {
    /// Build the stored form of `append` under `uid`.
    ///
    /// `flags` must already be filtered to what the mailbox permits. The
    /// internal date is truncated to whole seconds so that every engine can
    /// store it exactly.
    pub fn for_append(
        uid: Uid,
        append: &AppendMessage,
        flags: FlagSet,
        recent: bool,
        modseq: u64,
    ) -> Message {
        let internal_date = append.internal_date.unwrap_or_else(Utc::now);
        Message {
            uid,
            internal_date: Utc.timestamp(internal_date.timestamp(), 0),
            flags,
            recent,
            email_id: identity::email_id(&append.data),
            thread_id: identity::thread_id(&append.data),
            size: append.data.len() as u64,
            modseq,
            expunged: false,
            content: Some(Arc::from(append.data.as_slice())),
        }
    }

    /// Return a copy of this message whose content is present only if
    /// `requirement` asks for it.
    pub fn fetched(&self, requirement: FetchRequirement) -> Message {
        if requirement.needs_content() {
            self.clone()
        } else {
            self.metadata()
        }
    }

    /// Produce a tombstone carrying the metadata of `self`.
    pub fn tombstone(&self) -> Message {
        Message {
            expunged: true,
            content: None,
            ..self.clone()
        }
    }

    /// Return a copy of this message without its content.
    pub fn metadata(&self) -> Message {
        Message {
            content: None,
            ..self.clone()
        }
    }

    pub fn has_flag(&self, flag: &Flag) -> bool {
        self.flags.contains(flag)
    }

    /// Return whether `other` describes the same state as `self`, ignoring
    /// content.
    pub fn same_state(&self, other: &Message) -> bool {
        self.flags == other.flags
            && self.recent == other.recent
            && self.modseq == other.modseq
            && self.expunged == other.expunged
    }
}

/// A point-in-time summary of a mailbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxSnapshot {
    pub exists: usize,
    pub recent: usize,
    pub unseen: usize,
    /// The sequence number of the first message without `\Seen`.
    pub first_unseen: Option<Seqnum>,
    /// The UID the next appended message will probably get.
    pub uid_next: Uid,
    pub uid_validity: u32,
    pub highest_modseq: Option<Modseq>,
}

impl MailboxSnapshot {
    /// Compute a snapshot from the live messages of a mailbox, which must be
    /// in ascending UID order.
    pub fn scan<'a>(
        messages: impl IntoIterator<Item = &'a Message>,
        uid_next: Uid,
        uid_validity: u32,
        highest_modseq: Option<Modseq>,
    ) -> Self {
        let mut this = MailboxSnapshot {
            exists: 0,
            recent: 0,
            unseen: 0,
            first_unseen: None,
            uid_next,
            uid_validity,
            highest_modseq,
        };

        for message in messages {
            this.exists += 1;
            if message.recent {
                this.recent += 1;
            }
            if !message.has_flag(&Flag::Seen) {
                this.unseen += 1;
                if this.first_unseen.is_none() {
                    this.first_unseen =
                        Some(Seqnum::from_index(this.exists - 1));
                }
            }
        }

        this
    }
}
