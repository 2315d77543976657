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

//! The operations a protocol front-end performs on behalf of one logged-in
//! user.
//!
//! A `Session` holds the user's `MailboxSet` and at most one selected
//! mailbox. Every operation on the selected mailbox resynchronises the view
//! afterwards, even when the operation itself failed, so that the session
//! learns about concurrent changes. The changes are returned with the next
//! successful result; a failed operation leaves them pending.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

mod search;

pub use self::search::SearchKey;
use self::search::Program;
use crate::store::backend::Backend;
use crate::store::mailbox_name;
use crate::store::model::*;
use crate::store::selected::{PollResponse, SelectedMailbox};
use crate::store::{MailboxData, MailboxSet};
use crate::support::error::Error;
use crate::support::sync::{wait_any, Event};

/// The result of an operation on the selected mailbox, along with every
/// change to the mailbox the session has not heard about yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome<T> {
    pub value: T,
    pub update: PollResponse,
}

/// One entry of a mailbox listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListedMailbox {
    pub name: String,
    pub subscribed: bool,
    pub has_children: bool,
    /// Set for subscriptions to mailboxes which do not exist.
    pub nonexistent: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxStatus {
    pub name: String,
    pub mailbox_id: String,
    pub snapshot: MailboxSnapshot,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendResponse {
    pub uid_validity: u32,
    pub uids: Vec<Uid>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectResponse {
    /// The state of the mailbox as seen by the new view. `recent` is the
    /// number of messages this session holds `\Recent` for.
    pub snapshot: MailboxSnapshot,
    pub readonly: bool,
    pub permanent_flags: PermanentFlags,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyResponse {
    /// The UID validity of the destination.
    pub uid_validity: u32,
    /// Source and destination UID of each copied message.
    pub pairs: Vec<(Uid, Uid)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchResponse {
    /// Hits in ascending order.
    pub uids: Vec<Uid>,
    pub seqnums: Vec<Seqnum>,
    /// The highest `modseq` of any hit.
    pub max_modseq: Option<u64>,
}

struct Selection {
    mailbox: Arc<dyn MailboxData>,
    view: SelectedMailbox,
}

impl Selection {
    /// Bring the view up to date, claiming `\Recent` first for read-write
    /// views.
    fn resync(&mut self) -> Result<(), Error> {
        if !self.view.readonly() {
            self.mailbox.claim_recent(&mut self.view)?;
        }
        self.mailbox.update_selected(&mut self.view)
    }

    fn writable(&self) -> Result<(), Error> {
        if self.view.readonly() {
            Err(Error::MailboxReadOnly)
        } else {
            Ok(())
        }
    }

    fn close(self) {
        if let Some(handle) = self.view.handle() {
            self.mailbox.deselect(handle);
        }
    }
}

pub struct Session {
    set: Arc<dyn MailboxSet>,
    selected: Option<Selection>,
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(selection) = self.selected.take() {
            selection.close();
        }
    }
}

impl Session {
    pub fn new(set: Arc<dyn MailboxSet>) -> Self {
        Session {
            set,
            selected: None,
        }
    }

    /// Start a session for `user`, who must already be authenticated.
    pub fn open(backend: &Backend, user: &str) -> Result<Self, Error> {
        let set = backend.open_user(user)?;
        info!("{} Session started", user);
        Ok(Session::new(set))
    }

    pub fn user(&self) -> &str {
        self.set.user()
    }

    fn log_prefix(&self) -> String {
        match self.selected {
            Some(ref s) => format!("{}:{}", self.set.user(), s.view.name()),
            None => self.set.user().to_owned(),
        }
    }

    /// The view of the selected mailbox, if any.
    pub fn selected(&self) -> Option<&SelectedMailbox> {
        self.selected.as_ref().map(|s| &s.view)
    }

    /// The event the next change to the selected mailbox will signal.
    ///
    /// This can be combined with the events of other sessions through
    /// `wait_any()`.
    pub fn wake_event(&self) -> Option<Event> {
        let selection = self.selected.as_ref()?;
        selection
            .mailbox
            .wake_event(selection.view.handle()?)
    }

    /// List mailboxes whose names match `pattern` relative to `reference`.
    ///
    /// With `subscribed_only`, lists subscriptions instead, including those
    /// naming mailboxes which do not exist.
    pub fn list_mailboxes(
        &self,
        reference: &str,
        pattern: &str,
        subscribed_only: bool,
    ) -> Result<Vec<ListedMailbox>, Error> {
        let matches = mailbox_name::matcher(reference, pattern)?;
        let existing = self.set.list_mailboxes()?;
        let subscribed: BTreeSet<String> =
            self.set.list_subscribed()?.into_iter().collect();

        let names: Vec<&String> = if subscribed_only {
            subscribed.iter().collect()
        } else {
            existing.iter().collect()
        };

        Ok(names
            .into_iter()
            .filter(|name| matches(name))
            .map(|name| ListedMailbox {
                name: name.clone(),
                subscribed: subscribed.contains(name),
                has_children: existing
                    .iter()
                    .any(|n| mailbox_name::is_descendant(n, name)),
                nonexistent: existing.binary_search(name).is_err(),
            })
            .collect())
    }

    /// The status of a mailbox, which need not be selected.
    pub fn get_mailbox(&self, name: &str) -> Result<MailboxStatus, Error> {
        let mailbox = self.set.get_mailbox(name, false)?;
        Ok(MailboxStatus {
            name: mailbox.name(),
            mailbox_id: mailbox.mailbox_id().to_owned(),
            snapshot: mailbox.snapshot()?,
        })
    }

    /// Create a mailbox, returning its id.
    pub fn create_mailbox(&self, name: &str) -> Result<String, Error> {
        let mailbox = self.set.add_mailbox(name)?;
        Ok(mailbox.mailbox_id().to_owned())
    }

    pub fn delete_mailbox(&self, name: &str) -> Result<(), Error> {
        self.set.delete_mailbox(name)
    }

    pub fn rename_mailbox(
        &self,
        before: &str,
        after: &str,
    ) -> Result<(), Error> {
        self.set.rename_mailbox(before, after)
    }

    pub fn subscribe(&self, name: &str) -> Result<(), Error> {
        self.set.set_subscribed(name, true)
    }

    pub fn unsubscribe(&self, name: &str) -> Result<(), Error> {
        self.set.set_subscribed(name, false)
    }

    /// Append `messages` to the mailbox `name`, in order.
    ///
    /// Each message is committed on its own. If one fails, those before it
    /// stay appended and the error is returned.
    pub fn append_messages(
        &self,
        name: &str,
        messages: &[AppendMessage],
    ) -> Result<AppendResponse, Error> {
        let mailbox = self.set.get_mailbox(name, true)?;
        let uid_validity = mailbox.uid_validity()?;

        let mut uids = Vec::with_capacity(messages.len());
        for message in messages {
            uids.push(mailbox.add(message, true)?.uid);
        }

        Ok(AppendResponse { uid_validity, uids })
    }

    /// Select `name`, replacing any current selection.
    pub fn select_mailbox(
        &mut self,
        name: &str,
        readonly: bool,
    ) -> Result<SelectResponse, Error> {
        if let Some(previous) = self.selected.take() {
            previous.close();
        }

        let mailbox = self.set.get_mailbox(name, false)?;
        let view = mailbox.select(readonly)?;
        let mut selection = Selection { mailbox, view };

        let setup = selection.resync().and_then(|()| {
            let snapshot = selection.mailbox.snapshot()?;
            Ok(snapshot)
        });
        let mut snapshot = match setup {
            Ok(snapshot) => snapshot,
            Err(e) => {
                selection.close();
                return Err(e);
            }
        };

        // Report what the view sees, which may lag the snapshot
        selection.view.take_update();
        let view = &selection.view;
        snapshot.exists = view.exists();
        snapshot.recent =
            view.uids().iter().filter(|&&uid| view.is_recent(uid)).count();
        snapshot.first_unseen = view
            .uids()
            .iter()
            .position(|&uid| {
                view.known(uid).map_or(false, |m| !m.has_flag(&Flag::Seen))
            })
            .map(Seqnum::from_index);
        snapshot.highest_modseq =
            view.mod_sequence().or(snapshot.highest_modseq);

        let response = SelectResponse {
            snapshot,
            readonly,
            permanent_flags: view.permanent_flags().clone(),
        };
        self.selected = Some(selection);
        info!("{} Selected", self.log_prefix());
        Ok(response)
    }

    /// Deselect the current mailbox.
    ///
    /// With `expunge`, messages flagged `\Deleted` are silently expunged first
    /// unless the mailbox was selected read-only.
    pub fn close_mailbox(&mut self, expunge: bool) -> Result<(), Error> {
        let selection = self.selected.take().ok_or(Error::NoSelection)?;
        let result = if expunge && !selection.view.readonly() {
            deleted_uids(&selection, None)
                .and_then(|uids| selection.mailbox.delete(&uids))
                .map(|_| ())
        } else {
            Ok(())
        };

        selection.close();
        result
    }

    /// Run `f` against the selection, then resynchronise.
    fn with_selection<T>(
        &mut self,
        f: impl FnOnce(&mut Selection) -> Result<T, Error>,
    ) -> Result<Outcome<T>, Error> {
        let selection = self.selected.as_mut().ok_or(Error::NoSelection)?;
        let result = f(selection);
        let resync = selection.resync();

        let value = result?;
        resync?;
        Ok(Outcome {
            value,
            update: selection.view.take_update(),
        })
    }

    /// Poll the selected mailbox.
    ///
    /// With `wait`, blocks for up to that long for some change if there is
    /// nothing to report yet. With `housekeeping`, cleans up the mailbox
    /// first.
    pub fn check_mailbox(
        &mut self,
        wait: Option<Duration>,
        housekeeping: bool,
    ) -> Result<Outcome<()>, Error> {
        let log_prefix = self.log_prefix();
        self.with_selection(|selection| {
            if housekeeping {
                if let Err(e) = selection.mailbox.cleanup() {
                    warn!("{} Cleanup failed: {}", log_prefix, e);
                }
            }

            let wait = match wait {
                Some(wait) => wait,
                None => return Ok(()),
            };

            // Take the event before looking so nothing slips in between
            let event = selection
                .view
                .handle()
                .and_then(|h| selection.mailbox.wake_event(h));
            selection.resync()?;
            if selection.view.has_pending() {
                return Ok(());
            }

            let events: Vec<Event> = event.into_iter().collect();
            wait_any(&events, Some(wait));
            Ok(())
        })
    }

    /// Fetch the messages in `set`.
    ///
    /// Messages expunged since the session last heard about them come back
    /// as tombstones.
    pub fn fetch_messages(
        &mut self,
        set: &SequenceSet,
        requirement: FetchRequirement,
    ) -> Result<Outcome<Vec<(Seqnum, Message)>>, Error> {
        self.with_selection(|selection| {
            let view = &selection.view;
            let mut fetched = Vec::new();
            for uid in view.resolve(set)? {
                let hint = view.known(uid);
                if let Some(mut message) =
                    selection.mailbox.get(uid, hint, requirement)?
                {
                    message.recent = view.is_recent(uid);
                    fetched.push((view.uid_to_seqnum(uid)?, message));
                }
            }
            Ok(fetched)
        })
    }

    pub fn search_mailbox(
        &mut self,
        keys: &[SearchKey],
    ) -> Result<Outcome<SearchResponse>, Error> {
        self.with_selection(|selection| {
            let view = &selection.view;
            let program = Program::compile(keys, view)?;

            let mut response = SearchResponse {
                uids: Vec::new(),
                seqnums: Vec::new(),
                max_modseq: None,
            };
            for message in selection.mailbox.messages(program.requirement())? {
                let seqnum = match view.uid_to_seqnum(message.uid) {
                    Ok(seqnum) => seqnum,
                    // Not reported to the client yet
                    Err(_) => continue,
                };

                if program.eval(&message, view.is_recent(message.uid)) {
                    response.uids.push(message.uid);
                    response.seqnums.push(seqnum);
                    response.max_modseq =
                        response.max_modseq.max(Some(message.modseq));
                }
            }
            Ok(response)
        })
    }

    /// Expunge every message flagged `\Deleted`, or only those also in `set`
    /// if given. Returns the expunged UIDs.
    pub fn expunge_mailbox(
        &mut self,
        set: Option<&SequenceSet>,
    ) -> Result<Outcome<Vec<Uid>>, Error> {
        self.with_selection(|selection| {
            selection.writable()?;
            let uids = deleted_uids(selection, set)?;
            selection.mailbox.delete(&uids)
        })
    }

    /// Copy the messages in `set` to mailbox `dest`.
    ///
    /// Messages which no longer exist are skipped.
    pub fn copy_messages(
        &mut self,
        set: &SequenceSet,
        dest: &str,
    ) -> Result<Outcome<CopyResponse>, Error> {
        let dest = self.set.get_mailbox(dest, true)?;
        self.with_selection(|selection| copy(selection, set, &*dest))
    }

    /// Copy the messages in `set` to mailbox `dest`, then expunge them.
    pub fn move_messages(
        &mut self,
        set: &SequenceSet,
        dest: &str,
    ) -> Result<Outcome<CopyResponse>, Error> {
        let dest = self.set.get_mailbox(dest, true)?;
        self.with_selection(|selection| {
            selection.writable()?;
            if dest.mailbox_id() == selection.mailbox.mailbox_id() {
                return Err(Error::RenameIntoSelf);
            }

            let response = copy(selection, set, &*dest)?;
            let moved: Vec<Uid> =
                response.pairs.iter().map(|&(src, _)| src).collect();
            selection.mailbox.delete(&moved)?;
            Ok(response)
        })
    }

    /// Modify the flags of the messages in `set`, returning the UIDs which
    /// were updated.
    ///
    /// The new flags reach the client through the `fetch` part of the update.
    pub fn update_flags(
        &mut self,
        set: &SequenceSet,
        flags: &FlagSet,
        mode: FlagMode,
    ) -> Result<Outcome<Vec<Uid>>, Error> {
        self.with_selection(|selection| {
            selection.writable()?;
            let uids = selection.view.resolve(set)?;
            Ok(selection
                .mailbox
                .update_flags(&uids, flags, mode)?
                .into_iter()
                .map(|m| m.uid)
                .collect())
        })
    }
}

/// The UIDs in the view flagged `\Deleted`, limited to `set` if given.
fn deleted_uids(
    selection: &Selection,
    set: Option<&SequenceSet>,
) -> Result<Vec<Uid>, Error> {
    let limit: Option<BTreeSet<Uid>> = match set {
        Some(set) => Some(selection.view.resolve(set)?.into_iter().collect()),
        None => None,
    };

    Ok(selection
        .mailbox
        .messages(FetchRequirement::METADATA)?
        .into_iter()
        .filter(|m| m.has_flag(&Flag::Deleted))
        .map(|m| m.uid)
        .filter(|&uid| selection.view.uid_to_seqnum(uid).is_ok())
        .filter(|uid| limit.as_ref().map_or(true, |l| l.contains(uid)))
        .collect())
}

fn copy(
    selection: &Selection,
    set: &SequenceSet,
    dest: &dyn MailboxData,
) -> Result<CopyResponse, Error> {
    let uid_validity = dest.uid_validity()?;
    let mut pairs = Vec::new();

    for uid in selection.view.resolve(set)? {
        let message = match selection.mailbox.get(
            uid,
            None,
            FetchRequirement::CONTENT,
        )? {
            Some(message) => message,
            None => continue,
        };

        let append = AppendMessage {
            data: message.content.as_deref().unwrap_or(&[]).to_vec(),
            flags: message.flags.iter().cloned().collect(),
            internal_date: Some(message.internal_date),
        };
        pairs.push((uid, dest.add(&append, true)?.uid));
    }

    Ok(CopyResponse {
        uid_validity,
        pairs,
    })
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;
    use crate::store::memory::MemoryMailboxSet;

    fn msg(body: &str) -> AppendMessage {
        AppendMessage::new(format!("Subject: {}\r\n\r\n{}\r\n", body, body))
    }

    fn flags(f: &[Flag]) -> FlagSet {
        f.iter().cloned().collect()
    }

    fn all() -> SequenceSet {
        SequenceSet::Uids(SeqRange::range(Uid::MIN, Uid::MAX))
    }

    fn uids(u: &[u32]) -> SequenceSet {
        let mut range = SeqRange::new();
        for &u in u {
            range.append(Uid::u(u));
        }
        SequenceSet::Uids(range)
    }

    fn setup() -> (Arc<dyn MailboxSet>, Session) {
        let set: Arc<dyn MailboxSet> = Arc::new(MemoryMailboxSet::new("alice"));
        let session = Session::new(Arc::clone(&set));
        (set, session)
    }

    #[test]
    fn select_claims_recent() {
        let (set, mut s1) = setup();
        let mut s2 = Session::new(Arc::clone(&set));
        s1.append_messages("INBOX", &[msg("a"), msg("b")]).unwrap();

        let selected = s1.select_mailbox("INBOX", false).unwrap();
        assert_eq!(2, selected.snapshot.exists);
        assert_eq!(2, selected.snapshot.recent);
        assert_eq!(Some(Seqnum::u(1)), selected.snapshot.first_unseen);

        let selected = s2.select_mailbox("INBOX", false).unwrap();
        assert_eq!(2, selected.snapshot.exists);
        assert_eq!(0, selected.snapshot.recent);

        // A message arriving later is claimed by whoever looks first
        s1.append_messages("INBOX", &[msg("c")]).unwrap();
        let update = s2.check_mailbox(None, false).unwrap().update;
        assert_eq!(Some(3), update.exists);
        assert_eq!(Some(1), update.recent);
        let update = s1.check_mailbox(None, false).unwrap().update;
        assert_eq!(Some(3), update.exists);
        assert_eq!(Some(2), update.recent);
    }

    #[test]
    fn readonly_refuses_mutation() {
        let (_, mut session) = setup();
        session.append_messages("INBOX", &[msg("a")]).unwrap();
        let selected = session.select_mailbox("INBOX", true).unwrap();
        assert!(selected.readonly);
        assert_eq!(0, selected.snapshot.recent);

        assert_matches!(
            Err(Error::MailboxReadOnly),
            session.update_flags(&all(), &flags(&[Flag::Seen]), FlagMode::Add)
        );
        assert_matches!(
            Err(Error::MailboxReadOnly),
            session.expunge_mailbox(None)
        );
        assert_matches!(
            Err(Error::MailboxReadOnly),
            session.move_messages(&all(), "INBOX")
        );

        // Copying out is fine
        session.create_mailbox("Saved").unwrap();
        let copied = session.copy_messages(&all(), "Saved").unwrap().value;
        assert_eq!(1, copied.pairs.len());
        assert_eq!(1, session.get_mailbox("Saved").unwrap().snapshot.exists);
    }

    #[test]
    fn failures_keep_updates_pending() {
        let (set, mut s1) = setup();
        let mut s2 = Session::new(Arc::clone(&set));
        s1.append_messages("INBOX", &[msg("a"), msg("b")]).unwrap();
        s1.select_mailbox("INBOX", false).unwrap();
        s2.select_mailbox("INBOX", false).unwrap();

        s2.update_flags(&uids(&[1]), &flags(&[Flag::Deleted]), FlagMode::Add)
            .unwrap();
        s2.expunge_mailbox(None).unwrap();

        // Seqnum 3 doesn't exist, so this fails, but S1 still resyncs
        let bad = SequenceSet::Seqnums(SeqRange::just(Seqnum::u(3)));
        assert_matches!(
            Err(Error::NxMessage),
            s1.fetch_messages(&bad, FetchRequirement::METADATA)
        );

        let update = s1.check_mailbox(None, false).unwrap().update;
        assert_eq!(vec![(Seqnum::u(1), Uid::u(1))], update.expunge);
        assert_eq!(Some(1), update.exists);
        assert!(s1.check_mailbox(None, false).unwrap().update.is_empty());
    }

    #[test]
    fn fetch_returns_tombstones() {
        let (set, mut s1) = setup();
        let mut s2 = Session::new(Arc::clone(&set));
        s1.append_messages("INBOX", &[msg("a"), msg("b")]).unwrap();
        s1.select_mailbox("INBOX", false).unwrap();
        s2.select_mailbox("INBOX", false).unwrap();

        s2.update_flags(&uids(&[1]), &flags(&[Flag::Deleted]), FlagMode::Add)
            .unwrap();
        s2.expunge_mailbox(Some(&uids(&[1, 2]))).unwrap();

        let fetched = s1
            .fetch_messages(
                &SequenceSet::Seqnums(SeqRange::range(
                    Seqnum::u(1),
                    Seqnum::u(2),
                )),
                FetchRequirement::CONTENT,
            )
            .unwrap();
        assert_eq!(2, fetched.value.len());
        assert!(fetched.value[0].1.expunged);
        assert!(fetched.value[0].1.content.is_none());
        assert!(!fetched.value[1].1.expunged);
        assert!(fetched.value[1].1.content.is_some());
        assert_eq!(vec![(Seqnum::u(1), Uid::u(1))], fetched.update.expunge);
    }

    #[test]
    fn flags_search_and_move() {
        let (_, mut session) = setup();
        session
            .append_messages(
                "INBOX",
                &[msg("alpha"), msg("beta"), msg("gamma")],
            )
            .unwrap();
        session.select_mailbox("INBOX", false).unwrap();

        let outcome = session
            .update_flags(&uids(&[1, 3]), &flags(&[Flag::Seen]), FlagMode::Add)
            .unwrap();
        assert_eq!(vec![Uid::u(1), Uid::u(3)], outcome.value);
        assert_eq!(2, outcome.update.fetch.len());

        let found = session
            .search_mailbox(&[SearchKey::Unseen])
            .unwrap()
            .value;
        assert_eq!(vec![Uid::u(2)], found.uids);
        assert_eq!(vec![Seqnum::u(2)], found.seqnums);

        let found = session
            .search_mailbox(&[SearchKey::Body("GAMMA".to_owned())])
            .unwrap()
            .value;
        assert_eq!(vec![Uid::u(3)], found.uids);

        session.create_mailbox("Archive").unwrap();
        let moved = session.move_messages(&uids(&[1, 3]), "Archive").unwrap();
        assert_eq!(2, moved.value.pairs.len());
        assert_eq!(2, moved.update.expunge.len());
        assert_eq!(Some(1), moved.update.exists);

        let archive = session.get_mailbox("Archive").unwrap();
        assert_eq!(2, archive.snapshot.exists);
        assert_eq!(0, archive.snapshot.unseen);

        assert_matches!(
            Err(Error::MailboxNotFound { try_create: true }),
            session.copy_messages(&all(), "Nowhere")
        );
    }

    #[test]
    fn listing() {
        let (_, session) = setup();
        session.create_mailbox("Work/Projects").unwrap();
        session.create_mailbox("Play").unwrap();
        session.subscribe("Work").unwrap();
        session.subscribe("Gone").unwrap();

        let names = |list: Vec<ListedMailbox>| {
            list.into_iter().map(|l| l.name).collect::<Vec<_>>()
        };
        assert_eq!(
            vec!["INBOX", "Play", "Work", "Work/Projects"],
            names(session.list_mailboxes("", "*", false).unwrap())
        );
        assert_eq!(
            vec!["INBOX", "Play", "Work"],
            names(session.list_mailboxes("", "%", false).unwrap())
        );
        assert_eq!(
            vec!["Work/Projects"],
            names(session.list_mailboxes("Work", "%", false).unwrap())
        );

        let work = session.list_mailboxes("", "Work", false).unwrap();
        assert!(work[0].has_children);
        assert!(work[0].subscribed);

        let subscribed = session.list_mailboxes("", "*", true).unwrap();
        assert_eq!(2, subscribed.len());
        assert_eq!("Gone", subscribed[0].name);
        assert!(subscribed[0].nonexistent);
        assert!(!subscribed[1].nonexistent);

        session.unsubscribe("Gone").unwrap();
        assert_eq!(1, session.list_mailboxes("", "*", true).unwrap().len());
    }

    #[test]
    fn close_expunges() {
        let (_, mut session) = setup();
        session.append_messages("INBOX", &[msg("a"), msg("b")]).unwrap();
        session.select_mailbox("INBOX", false).unwrap();
        session
            .update_flags(&uids(&[2]), &flags(&[Flag::Deleted]), FlagMode::Add)
            .unwrap();
        assert!(session.wake_event().is_some());

        session.close_mailbox(true).unwrap();
        assert!(session.selected().is_none());
        assert!(session.wake_event().is_none());
        assert_eq!(1, session.get_mailbox("INBOX").unwrap().snapshot.exists);
        assert_matches!(
            Err(Error::NoSelection),
            session.check_mailbox(None, false)
        );
    }

    #[test]
    fn check_waits_for_changes() {
        let (set, mut session) = setup();
        session.select_mailbox("INBOX", false).unwrap();

        let outcome = session
            .check_mailbox(Some(Duration::from_millis(10)), true)
            .unwrap();
        assert!(outcome.update.is_empty());

        let inbox = set.get_mailbox("INBOX", false).unwrap();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            inbox.add(&msg("a"), false).unwrap();
        });
        let outcome = session
            .check_mailbox(Some(Duration::from_secs(30)), false)
            .unwrap();
        writer.join().unwrap();
        assert_eq!(Some(1), outcome.update.exists);
    }
}
