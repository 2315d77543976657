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

//! One session's view of a selected mailbox.
//!
//! A `SelectedMailbox` holds the sequence-number mapping the session has
//! reported to its client, the last-known metadata of every mapped UID and
//! the changes the engine has told it about but which have not been reported
//! yet. Engines feed changes in through `apply()`; the session drains them
//! through `take_update()`.
//!
//! Changes are buffered rather than applied to the mapping immediately, since
//! sequence numbers may only shift at points where the client is told about
//! it. Between those points, expunged messages keep their sequence numbers
//! and are represented by tombstones.
//!
//! Nothing here does I/O.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use super::model::*;
use crate::support::error::Error;
use crate::support::sync::Event;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Identifies one registered view of a mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ViewHandle(u64);

impl ViewHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Tracks the open views of one mailbox and the events used to wake them.
#[derive(Debug, Default)]
pub struct ViewRegistry {
    views: HashMap<ViewHandle, Event>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self) -> ViewHandle {
        let handle = ViewHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed));
        self.views.insert(handle, Event::new());
        handle
    }

    /// Remove `handle` from the registry. Returns whether it was registered.
    pub fn deregister(&mut self, handle: ViewHandle) -> bool {
        self.views.remove(&handle).is_some()
    }

    /// Return the event which will be signalled on the next mutation.
    ///
    /// If the current event has already fired, it is replaced by a fresh one,
    /// so the caller must resynchronise after obtaining the event and before
    /// waiting on it.
    pub fn wake_event(&mut self, handle: ViewHandle) -> Option<Event> {
        let event = self.views.get_mut(&handle)?;
        if event.is_signalled() {
            *event = Event::new();
        }
        Some(event.clone())
    }

    /// Wake every registered view.
    pub fn notify(&self) {
        for event in self.views.values() {
            event.signal();
        }
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

/// The input to `SelectedMailbox::apply()`.
#[derive(Clone, Debug)]
pub enum Changes {
    /// The complete set of live messages. Anything the view knows about that
    /// is absent has been expunged.
    Full(Vec<Message>),
    /// Messages which were added or changed and UIDs which were expunged
    /// since the view's remembered mod-sequence.
    Delta {
        updated: Vec<Message>,
        expunged: Vec<Uid>,
    },
}

/// Changes to be reported to the client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollResponse {
    /// Messages which have been expunged, with the sequence numbers they had
    /// immediately before this response, highest sequence number first.
    ///
    /// Processing these in order keeps the sequence numbers of
    /// not-yet-processed entries valid.
    pub expunge: Vec<(Seqnum, Uid)>,
    /// If the mailbox size has changed, the new size.
    pub exists: Option<usize>,
    /// If the number of `\Recent` messages has changed or new messages
    /// arrived, the new count.
    pub recent: Option<usize>,
    /// Messages whose metadata changed, in ascending sequence number order.
    /// `recent` on each message reflects this session's `\Recent` flag.
    pub fetch: Vec<(Seqnum, Message)>,
    /// The mod-sequence the view is synchronised to.
    pub highest_modseq: Option<Modseq>,
}

/// A single change notice, in the order a client should receive it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delta {
    Expunge(Seqnum),
    Exists(usize),
    Recent(usize),
    Fetch(Seqnum, Message),
}

impl PollResponse {
    pub fn is_empty(&self) -> bool {
        self.expunge.is_empty()
            && self.exists.is_none()
            && self.recent.is_none()
            && self.fetch.is_empty()
    }

    /// Flatten this response into individual notices: expunges, then the
    /// size, then the recent count, then flag changes.
    pub fn deltas(&self) -> Vec<Delta> {
        let mut ret = Vec::with_capacity(
            self.expunge.len() + self.fetch.len() + 2,
        );
        ret.extend(self.expunge.iter().map(|&(s, _)| Delta::Expunge(s)));
        ret.extend(self.exists.map(Delta::Exists));
        ret.extend(self.recent.map(Delta::Recent));
        ret.extend(
            self.fetch
                .iter()
                .map(|&(s, ref m)| Delta::Fetch(s, m.clone())),
        );
        ret
    }
}

#[derive(Clone, Debug)]
pub struct SelectedMailbox {
    handle: Option<ViewHandle>,
    mailbox_id: String,
    name: String,
    readonly: bool,
    permanent_flags: PermanentFlags,
    uid_validity: u32,

    /// UIDs this session holds `\Recent` for.
    recent: BTreeSet<Uid>,
    /// The mod-sequence (or, for engines without one, the stamp) the view is
    /// synchronised to.
    mod_sequence: Option<Modseq>,
    /// Whether the initial full synchronisation has happened. This is
    /// separate from `mod_sequence` since a mailbox that has never been
    /// mutated has no mod-sequence.
    synced: bool,

    /// The sequence number mapping reported to the client. Sorted ascending.
    uids: Vec<Uid>,
    /// The last-known state of everything in `uids` and `pending_new`.
    /// Expunged messages are held as tombstones until reported.
    known: HashMap<Uid, Message>,

    pending_new: BTreeSet<Uid>,
    pending_expunge: BTreeSet<Uid>,
    pending_fetch: BTreeSet<Uid>,
    reported_exists: usize,
    reported_recent: usize,
}

impl SelectedMailbox {
    pub fn new(
        handle: ViewHandle,
        mailbox_id: String,
        name: String,
        readonly: bool,
        permanent_flags: PermanentFlags,
        uid_validity: u32,
    ) -> Self {
        SelectedMailbox {
            handle: Some(handle),
            mailbox_id,
            name,
            readonly,
            permanent_flags,
            uid_validity,
            recent: BTreeSet::new(),
            mod_sequence: None,
            synced: false,
            uids: Vec::new(),
            known: HashMap::new(),
            pending_new: BTreeSet::new(),
            pending_expunge: BTreeSet::new(),
            pending_fetch: BTreeSet::new(),
            reported_exists: 0,
            reported_recent: 0,
        }
    }

    /// Return an unregistered copy of this view.
    ///
    /// The fork shares nothing with the original and is never woken by
    /// mutations.
    pub fn fork(&self) -> Self {
        SelectedMailbox {
            handle: None,
            ..self.clone()
        }
    }

    /// The registry handle, or `None` for a fork.
    pub fn handle(&self) -> Option<ViewHandle> {
        self.handle
    }

    pub fn mailbox_id(&self) -> &str {
        &self.mailbox_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub fn uid_validity(&self) -> u32 {
        self.uid_validity
    }

    pub fn permanent_flags(&self) -> &PermanentFlags {
        &self.permanent_flags
    }

    pub fn set_permanent_flags(&mut self, permanent_flags: PermanentFlags) {
        self.permanent_flags = permanent_flags;
    }

    pub fn mod_sequence(&self) -> Option<Modseq> {
        self.mod_sequence
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// The number of messages in the reported mapping.
    pub fn exists(&self) -> usize {
        self.uids.len()
    }

    /// The UIDs in the reported mapping, in sequence number order.
    pub fn uids(&self) -> &[Uid] {
        &self.uids
    }

    /// The last-known state of `uid`, which may be a tombstone.
    pub fn known(&self, uid: Uid) -> Option<&Message> {
        self.known.get(&uid)
    }

    /// Whether this session holds `\Recent` for `uid`.
    pub fn is_recent(&self, uid: Uid) -> bool {
        self.recent.contains(&uid)
    }

    /// Give this session `\Recent` for `uids`.
    pub fn mark_recent(&mut self, uids: impl IntoIterator<Item = Uid>) {
        self.recent.extend(uids);
    }

    pub fn seqnum_to_uid(&self, seqnum: Seqnum) -> Result<Uid, Error> {
        self.uids
            .get(seqnum.to_index())
            .copied()
            .ok_or(Error::NxMessage)
    }

    pub fn uid_to_seqnum(&self, uid: Uid) -> Result<Seqnum, Error> {
        self.uids
            .binary_search(&uid)
            .map(Seqnum::from_index)
            .map_err(|_| Error::NxMessage)
    }

    /// Resolve `set` to the UIDs in the reported mapping it names.
    ///
    /// UIDs not in the mapping are silently dropped. Sequence numbers past
    /// the end of the mapping are an error.
    pub fn resolve(&self, set: &SequenceSet) -> Result<Vec<Uid>, Error> {
        match *set {
            SequenceSet::Uids(ref uids) => Ok(uids
                .items(self.uids.last().copied().unwrap_or(Uid::MIN))
                .filter(|uid| self.uids.binary_search(uid).is_ok())
                .collect()),
            SequenceSet::Seqnums(ref seqnums) => {
                if seqnums.max().map_or(false, |m| m as usize > self.uids.len())
                {
                    return Err(Error::NxMessage);
                }

                seqnums
                    .items(u32::MAX)
                    .map(|s| self.seqnum_to_uid(s))
                    .collect()
            }
        }
    }

    /// Fold `changes` from the engine into this view and advance the
    /// remembered mod-sequence to `mod_sequence`.
    pub fn apply(&mut self, changes: Changes, mod_sequence: Option<Modseq>) {
        match changes {
            Changes::Full(messages) => {
                let present: BTreeSet<Uid> =
                    messages.iter().map(|m| m.uid).collect();
                let vanished: Vec<Uid> = self
                    .known
                    .iter()
                    .filter(|&(uid, m)| !m.expunged && !present.contains(uid))
                    .map(|(&uid, _)| uid)
                    .collect();

                for uid in vanished {
                    self.expunge(uid);
                }
                for message in messages {
                    self.upsert(message);
                }
            }

            Changes::Delta { updated, expunged } => {
                for message in updated {
                    self.upsert(message);
                }
                for uid in expunged {
                    self.expunge(uid);
                }
            }
        }

        self.synced = true;
        self.mod_sequence = mod_sequence;
    }

    fn upsert(&mut self, message: Message) {
        let message = message.metadata();
        match self.known.get(&message.uid) {
            // Expunged UIDs never come back
            Some(existing) if existing.expunged => (),
            Some(existing) => {
                if !existing.same_state(&message) {
                    if !self.pending_new.contains(&message.uid) {
                        self.pending_fetch.insert(message.uid);
                    }
                    self.known.insert(message.uid, message);
                }
            }
            None => {
                if message.expunged {
                    return;
                }

                self.pending_new.insert(message.uid);
                self.known.insert(message.uid, message);
            }
        }
    }

    fn expunge(&mut self, uid: Uid) {
        let tombstone = match self.known.get(&uid) {
            Some(existing) if !existing.expunged => existing.tombstone(),
            // Never knew it, or already expunged
            _ => return,
        };

        self.pending_fetch.remove(&uid);
        if self.pending_new.remove(&uid) {
            // Never reported, so it need not be reported as gone either
            self.known.remove(&uid);
            self.recent.remove(&uid);
        } else {
            self.known.insert(uid, tombstone);
            self.pending_expunge.insert(uid);
        }
    }

    /// Whether `take_update()` would report anything.
    pub fn has_pending(&self) -> bool {
        !self.pending_new.is_empty()
            || !self.pending_expunge.is_empty()
            || !self.pending_fetch.is_empty()
            || self.reported_exists != self.uids.len()
            || self.reported_recent != self.live_recent()
    }

    fn live_recent(&self) -> usize {
        self.recent
            .iter()
            .filter(|uid| {
                self.known.get(uid).map_or(false, |m| !m.expunged)
            })
            .count()
    }

    /// Apply all pending changes to the sequence number mapping and return
    /// what must be reported to the client.
    pub fn take_update(&mut self) -> PollResponse {
        let mut response = PollResponse {
            highest_modseq: self.mod_sequence,
            ..PollResponse::default()
        };

        for uid in std::mem::take(&mut self.pending_expunge) {
            if let Ok(ix) = self.uids.binary_search(&uid) {
                response.expunge.push((Seqnum::from_index(ix), uid));
            }
            self.known.remove(&uid);
            self.recent.remove(&uid);
        }
        // Remove from the mapping only after all seqnums have been computed
        // against the old mapping.
        if !response.expunge.is_empty() {
            let expunged: BTreeSet<Uid> =
                response.expunge.iter().map(|&(_, uid)| uid).collect();
            self.uids.retain(|uid| !expunged.contains(uid));
            response.expunge.reverse();
        }

        let new = std::mem::take(&mut self.pending_new);
        let had_new = !new.is_empty();
        if had_new {
            let sorted = self.uids.last().map_or(true, |&last| {
                new.iter().next().map_or(true, |&first| first > last)
            });
            self.uids.extend(new);
            if !sorted {
                self.uids.sort_unstable();
            }
        }

        if had_new || self.uids.len() != self.reported_exists {
            response.exists = Some(self.uids.len());
            self.reported_exists = self.uids.len();
        }

        let recent = self.live_recent();
        if had_new || recent != self.reported_recent {
            response.recent = Some(recent);
            self.reported_recent = recent;
        }

        for uid in std::mem::take(&mut self.pending_fetch) {
            if let (Ok(seqnum), Some(message)) =
                (self.uid_to_seqnum(uid), self.known.get(&uid))
            {
                let mut message = message.clone();
                message.recent = self.recent.contains(&uid);
                response.fetch.push((seqnum, message));
            }
        }

        response
    }
}

#[cfg(test)]
mod test {
    use chrono::prelude::*;

    use super::*;

    fn message(uid: u32, flags: &[Flag], modseq: u64) -> Message {
        Message {
            uid: Uid::u(uid),
            internal_date: Utc.timestamp(1_600_000_000, 0),
            flags: flags.iter().cloned().collect(),
            recent: false,
            email_id: format!("M{}", uid),
            thread_id: format!("T{}", uid),
            size: 10,
            modseq,
            expunged: false,
            content: None,
        }
    }

    fn set_up() -> SelectedMailbox {
        let mut registry = ViewRegistry::new();
        SelectedMailbox::new(
            registry.register(),
            "id".to_owned(),
            "INBOX".to_owned(),
            false,
            PermanentFlags::unrestricted(),
            42,
        )
    }

    fn full(uids: &[u32]) -> Changes {
        Changes::Full(uids.iter().map(|&u| message(u, &[], 1)).collect())
    }

    #[test]
    fn initial_sync_reports_everything() {
        let mut view = set_up();
        assert!(!view.is_synced());
        view.apply(full(&[1, 2, 5]), Modseq::of(3));
        assert!(view.is_synced());
        assert_eq!(Modseq::of(3), view.mod_sequence());

        let update = view.take_update();
        assert_eq!(Some(3), update.exists);
        assert_eq!(Some(0), update.recent);
        assert!(update.expunge.is_empty());
        assert!(update.fetch.is_empty());
        assert_eq!(&[Uid::u(1), Uid::u(2), Uid::u(5)], view.uids());
        assert_eq!(Uid::u(5), view.seqnum_to_uid(Seqnum::u(3)).unwrap());
        assert_eq!(Seqnum::u(2), view.uid_to_seqnum(Uid::u(2)).unwrap());
        assert_matches!(
            Err(Error::NxMessage),
            view.seqnum_to_uid(Seqnum::u(4))
        );

        // Nothing changed, nothing to report
        view.apply(full(&[1, 2, 5]), Modseq::of(3));
        assert!(!view.has_pending());
        assert!(view.take_update().is_empty());
    }

    #[test]
    fn expunges_are_reported_highest_first() {
        let mut view = set_up();
        view.apply(full(&[1, 2, 3, 4]), Modseq::of(1));
        view.take_update();

        view.apply(
            Changes::Delta {
                updated: vec![],
                expunged: vec![Uid::u(2), Uid::u(4), Uid::u(99)],
            },
            Modseq::of(2),
        );

        // Until reported, the expunged messages keep their seqnums
        assert_eq!(4, view.exists());
        assert!(view.known(Uid::u(2)).unwrap().expunged);

        let update = view.take_update();
        assert_eq!(
            vec![(Seqnum::u(4), Uid::u(4)), (Seqnum::u(2), Uid::u(2))],
            update.expunge
        );
        assert_eq!(Some(2), update.exists);
        assert_eq!(
            vec![
                Delta::Expunge(Seqnum::u(4)),
                Delta::Expunge(Seqnum::u(2)),
                Delta::Exists(2),
            ],
            update.deltas()
        );
        assert_eq!(&[Uid::u(1), Uid::u(3)], view.uids());
        assert!(view.known(Uid::u(2)).is_none());
    }

    #[test]
    fn flag_changes_become_fetches() {
        let mut view = set_up();
        view.apply(full(&[1, 2]), Modseq::of(1));
        view.mark_recent(vec![Uid::u(2)]);
        view.take_update();

        view.apply(
            Changes::Delta {
                updated: vec![
                    message(2, &[Flag::Seen], 2),
                    // Unchanged
                    message(1, &[], 1),
                ],
                expunged: vec![],
            },
            Modseq::of(2),
        );

        let update = view.take_update();
        assert_eq!(None, update.exists);
        assert_eq!(1, update.fetch.len());
        assert_eq!(Seqnum::u(2), update.fetch[0].0);
        assert!(update.fetch[0].1.has_flag(&Flag::Seen));
        assert!(update.fetch[0].1.recent);
    }

    #[test]
    fn expunge_after_update_erases_update() {
        let mut view = set_up();
        view.apply(full(&[1, 2]), Modseq::of(1));
        view.take_update();

        view.apply(
            Changes::Delta {
                updated: vec![message(1, &[Flag::Flagged], 2)],
                expunged: vec![],
            },
            Modseq::of(2),
        );
        view.apply(
            Changes::Delta {
                updated: vec![],
                expunged: vec![Uid::u(1)],
            },
            Modseq::of(3),
        );

        let update = view.take_update();
        assert_eq!(vec![(Seqnum::u(1), Uid::u(1))], update.expunge);
        assert!(update.fetch.is_empty());
        assert_eq!(Modseq::of(3), update.highest_modseq);
    }

    #[test]
    fn stillborn_messages_are_never_reported() {
        let mut view = set_up();
        view.apply(full(&[1]), Modseq::of(1));
        view.take_update();

        view.apply(full(&[1, 2]), Modseq::of(2));
        view.mark_recent(vec![Uid::u(2)]);
        view.apply(full(&[1]), Modseq::of(3));

        let update = view.take_update();
        assert!(update.is_empty(), "Unexpected update: {:?}", update);
        assert!(!view.is_recent(Uid::u(2)));
    }

    #[test]
    fn new_messages_report_recent() {
        let mut view = set_up();
        view.apply(full(&[1]), Modseq::of(1));
        view.take_update();

        view.apply(
            Changes::Delta {
                updated: vec![message(2, &[], 2), message(3, &[], 2)],
                expunged: vec![],
            },
            Modseq::of(2),
        );
        view.mark_recent(vec![Uid::u(2), Uid::u(3)]);

        let update = view.take_update();
        assert_eq!(Some(3), update.exists);
        assert_eq!(Some(2), update.recent);
        assert!(update.fetch.is_empty());
        assert!(view.is_recent(Uid::u(3)));
    }

    #[test]
    fn pending_changes_survive_until_taken() {
        let mut view = set_up();
        view.apply(full(&[1, 2]), Modseq::of(1));
        view.take_update();

        view.apply(full(&[2]), Modseq::of(2));
        view.apply(full(&[2, 3]), Modseq::of(3));
        assert!(view.has_pending());

        let update = view.take_update();
        assert_eq!(vec![(Seqnum::u(1), Uid::u(1))], update.expunge);
        assert_eq!(Some(2), update.exists);
        assert_eq!(&[Uid::u(2), Uid::u(3)], view.uids());
    }

    #[test]
    fn resolve_sequence_sets() {
        let mut view = set_up();
        view.apply(full(&[2, 4, 6]), None);
        view.take_update();

        assert_eq!(
            vec![Uid::u(4), Uid::u(6)],
            view.resolve(&SequenceSet::Uids(SeqRange::range(
                Uid::u(3),
                Uid::u(100)
            )))
            .unwrap()
        );
        assert_eq!(
            vec![Uid::u(2), Uid::u(6)],
            view.resolve(&SequenceSet::Seqnums(
                SeqRange::parse("1,3", Seqnum::u(3)).unwrap()
            ))
            .unwrap()
        );
        assert_matches!(
            Err(Error::NxMessage),
            view.resolve(&SequenceSet::Seqnums(SeqRange::just(Seqnum::u(4))))
        );
    }

    #[test]
    fn fork_is_unregistered_copy() {
        let mut view = set_up();
        view.apply(full(&[1]), None);
        view.take_update();

        let mut fork = view.fork();
        assert!(fork.handle().is_none());
        assert!(view.handle().is_some());

        fork.apply(full(&[]), None);
        assert_eq!(1, fork.take_update().expunge.len());
        assert_eq!(1, view.exists());
    }

    #[test]
    fn registry_events() {
        let mut registry = ViewRegistry::new();
        let a = registry.register();
        let b = registry.register();
        assert_ne!(a, b);
        assert_eq!(2, registry.len());

        let ea = registry.wake_event(a).unwrap();
        assert!(!ea.is_signalled());
        registry.notify();
        assert!(ea.is_signalled());

        // A fired event is replaced on the next request
        let ea2 = registry.wake_event(a).unwrap();
        assert!(!ea2.is_signalled());

        assert!(registry.deregister(b));
        assert!(!registry.deregister(b));
        assert!(registry.wake_event(b).is_none());
        assert_eq!(1, registry.len());
    }
}
