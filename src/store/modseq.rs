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

//! The mod-sequence index: which UIDs changed at which counter value.
//!
//! Every mutation of a mailbox advances the counter by one and files the
//! UIDs it touched under the new value, either as "updated" (added or
//! changed) or "expunged". A UID is only ever filed under its newest counter;
//! recording it again removes the older entry, whichever map it was in. This
//! keeps the index proportional to the number of UIDs ever allocated rather
//! than the number of mutations.
//!
//! Nothing here does I/O; the engines that keep the index remotely store the
//! same information in their own format.

use std::collections::{BTreeSet, HashMap};

use super::model::*;
use super::selected::Changes;
use crate::support::error::Error;

/// What a UID was most recently filed as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Entry {
    Updated(Modseq),
    Expunged(Modseq),
}

impl Entry {
    fn modseq(self) -> Modseq {
        match self {
            Entry::Updated(m) | Entry::Expunged(m) => m,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ModseqIndex {
    highest: Option<Modseq>,
    updated: HashMap<Modseq, BTreeSet<Uid>>,
    expunged: HashMap<Modseq, BTreeSet<Uid>>,
    /// Every counter which currently has at least one UID under it, in
    /// ascending order.
    counters: Vec<Modseq>,
    by_uid: HashMap<Uid, Entry>,
}

/// The result of `ModseqIndex::changes_since()`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModseqChanges {
    pub updated: BTreeSet<Uid>,
    pub expunged: BTreeSet<Uid>,
    /// The counter value the changes bring the caller up to.
    pub highest: Option<Modseq>,
}

impl ModseqChanges {
    /// Convert to the input of `SelectedMailbox::apply()`.
    ///
    /// `lookup` fetches the current state of an updated UID. Updated UIDs it
    /// cannot find are treated as expunged.
    pub fn into_changes(
        self,
        mut lookup: impl FnMut(Uid) -> Result<Option<Message>, Error>,
    ) -> Result<Changes, Error> {
        let mut updated = Vec::with_capacity(self.updated.len());
        let mut expunged: Vec<Uid> = self.expunged.into_iter().collect();

        for uid in self.updated {
            match lookup(uid)? {
                Some(message) => updated.push(message),
                None => expunged.push(uid),
            }
        }

        Ok(Changes::Delta { updated, expunged })
    }
}

impl ModseqIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// The counter value of the most recent mutation, if any.
    pub fn highest(&self) -> Option<Modseq> {
        self.highest
    }

    /// Record one mutation which updated `updated` and expunged `expunged`.
    ///
    /// Returns the new counter value. The counter advances even if both sets
    /// are empty.
    pub fn record(
        &mut self,
        updated: impl IntoIterator<Item = Uid>,
        expunged: impl IntoIterator<Item = Uid>,
    ) -> Modseq {
        let modseq = Modseq::after(self.highest);
        self.highest = Some(modseq);

        for uid in updated {
            self.file(uid, Entry::Updated(modseq));
        }
        for uid in expunged {
            self.file(uid, Entry::Expunged(modseq));
        }

        modseq
    }

    /// Shorthand for `record()` with no expunges.
    pub fn record_update(
        &mut self,
        uids: impl IntoIterator<Item = Uid>,
    ) -> Modseq {
        self.record(uids, std::iter::empty())
    }

    /// Shorthand for `record()` with no updates.
    pub fn record_expunge(
        &mut self,
        uids: impl IntoIterator<Item = Uid>,
    ) -> Modseq {
        self.record(std::iter::empty(), uids)
    }

    /// Return the counter value `uid` was last filed under, if any.
    pub fn modseq_of(&self, uid: Uid) -> Option<Modseq> {
        self.by_uid.get(&uid).map(|e| e.modseq())
    }

    /// Return every UID filed under a counter strictly greater than `since`.
    ///
    /// `None` means "since the beginning of time".
    pub fn changes_since(&self, since: Option<Modseq>) -> ModseqChanges {
        let start = match since {
            None => 0,
            Some(since) => match self.counters.binary_search(&since) {
                Ok(ix) => ix + 1,
                Err(ix) => ix,
            },
        };

        let mut ret = ModseqChanges {
            highest: self.highest,
            ..ModseqChanges::default()
        };
        for counter in &self.counters[start..] {
            if let Some(uids) = self.updated.get(counter) {
                ret.updated.extend(uids.iter().copied());
            }
            if let Some(uids) = self.expunged.get(counter) {
                ret.expunged.extend(uids.iter().copied());
            }
        }

        ret
    }

    fn file(&mut self, uid: Uid, entry: Entry) {
        if let Some(old) = self.by_uid.insert(uid, entry) {
            self.unfile(uid, old);
        }

        let modseq = entry.modseq();
        let map = match entry {
            Entry::Updated(_) => &mut self.updated,
            Entry::Expunged(_) => &mut self.expunged,
        };
        map.entry(modseq).or_insert_with(BTreeSet::new).insert(uid);

        // New counters are always the highest, so this is an append
        if self.counters.last() != Some(&modseq) {
            self.counters.push(modseq);
        }
    }

    fn unfile(&mut self, uid: Uid, old: Entry) {
        let modseq = old.modseq();
        let map = match old {
            Entry::Updated(_) => &mut self.updated,
            Entry::Expunged(_) => &mut self.expunged,
        };

        if let Some(uids) = map.get_mut(&modseq) {
            uids.remove(&uid);
            if uids.is_empty() {
                map.remove(&modseq);
            }
        }

        if !self.updated.contains_key(&modseq)
            && !self.expunged.contains_key(&modseq)
        {
            if let Ok(ix) = self.counters.binary_search(&modseq) {
                self.counters.remove(ix);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn uids(raw: &[u32]) -> BTreeSet<Uid> {
        raw.iter().copied().map(Uid::u).collect()
    }

    #[test]
    fn basic_queries() {
        let mut index = ModseqIndex::new();
        assert_eq!(None, index.highest());
        assert_eq!(ModseqChanges::default(), index.changes_since(None));

        let m1 = index.record_update(vec![Uid::u(1), Uid::u(2)]);
        let m2 = index.record_update(vec![Uid::u(3)]);
        let m3 = index.record_expunge(vec![Uid::u(1)]);
        assert_eq!(Some(Modseq::MIN), Some(m1));
        assert_eq!(Some(m3), index.highest());

        let all = index.changes_since(None);
        assert_eq!(uids(&[2, 3]), all.updated);
        assert_eq!(uids(&[1]), all.expunged);
        assert_eq!(Some(m3), all.highest);

        let after1 = index.changes_since(Some(m1));
        assert_eq!(uids(&[3]), after1.updated);
        assert_eq!(uids(&[1]), after1.expunged);

        let after2 = index.changes_since(Some(m2));
        assert!(after2.updated.is_empty());
        assert_eq!(uids(&[1]), after2.expunged);

        assert_eq!(
            ModseqChanges {
                highest: Some(m3),
                ..ModseqChanges::default()
            },
            index.changes_since(Some(m3))
        );
    }

    #[test]
    fn newest_mapping_wins() {
        let mut index = ModseqIndex::new();
        let m1 = index.record_update(vec![Uid::u(1)]);
        let m2 = index.record_update(vec![Uid::u(1)]);

        assert_eq!(Some(m2), index.modseq_of(Uid::u(1)));
        // The first counter no longer has anything under it
        assert_eq!(vec![m2], index.counters);
        assert_eq!(uids(&[1]), index.changes_since(Some(m1)).updated);

        let m3 = index.record_expunge(vec![Uid::u(1)]);
        assert_eq!(vec![m3], index.counters);
        let all = index.changes_since(None);
        assert!(all.updated.is_empty());
        assert_eq!(uids(&[1]), all.expunged);
    }

    #[test]
    fn empty_mutation_still_advances() {
        let mut index = ModseqIndex::new();
        let m1 = index.record(Vec::<Uid>::new(), Vec::<Uid>::new());
        let m2 = index.record(Vec::<Uid>::new(), Vec::<Uid>::new());
        assert!(m2 > m1);
        assert!(index.counters.is_empty());
        assert_eq!(Some(m2), index.changes_since(Some(m1)).highest);
    }

    proptest! {
        #[test]
        fn index_matches_naive_log(
            ops in prop::collection::vec(
                (prop::bool::ANY, prop::collection::vec(1u32..20, 0..4)),
                1..40),
            since in 0usize..40,
        ) {
            let mut index = ModseqIndex::new();
            let mut log: Vec<(Modseq, bool, Vec<u32>)> = Vec::new();
            for (expunge, raw) in &ops {
                let uid_list = raw.iter().copied().map(Uid::u);
                let m = if *expunge {
                    index.record_expunge(uid_list)
                } else {
                    index.record_update(uid_list)
                };
                log.push((m, *expunge, raw.clone()));
            }

            let since = log.get(since).map(|&(m, _, _)| m);

            // Naive: the latest entry for each UID decides where it goes
            let mut latest: HashMap<u32, (Modseq, bool)> = HashMap::new();
            for &(m, expunge, ref raw) in &log {
                for &uid in raw {
                    latest.insert(uid, (m, expunge));
                }
            }

            let mut expected = ModseqChanges {
                highest: index.highest(),
                ..ModseqChanges::default()
            };
            for (&uid, &(m, expunge)) in &latest {
                if since.map_or(true, |s| m > s) {
                    if expunge {
                        expected.expunged.insert(Uid::u(uid));
                    } else {
                        expected.updated.insert(Uid::u(uid));
                    }
                }
            }

            prop_assert_eq!(expected, index.changes_since(since));
        }
    }
}
