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

//! The in-memory engine.
//!
//! Every mailbox is a `Guarded` state holding the messages and the
//! mod-sequence index. Mutations take the write guard; reads take the read
//! guard. Nothing survives the process.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use log::info;

use super::mailbox_name;
use super::model::*;
use super::modseq::ModseqIndex;
use super::selected::{Changes, SelectedMailbox, ViewHandle, ViewRegistry};
use super::{MailboxData, MailboxSet};
use crate::support::error::Error;
use crate::support::sync::{lock, Event, Guarded};

#[derive(Debug)]
struct MailboxState {
    name: String,
    deleted: bool,
    uid_validity: u32,
    next_uid: Uid,
    messages: BTreeMap<Uid, Message>,
    index: ModseqIndex,
}

impl MailboxState {
    fn live(&self) -> Result<(), Error> {
        if self.deleted {
            Err(Error::MailboxNotFound { try_create: false })
        } else {
            Ok(())
        }
    }

    fn check_uid(&self, uid: Uid) -> Result<(), Error> {
        if uid < self.next_uid {
            Ok(())
        } else {
            Err(Error::InvalidUid)
        }
    }
}

#[derive(Debug)]
pub struct MemoryMailbox {
    id: String,
    user: String,
    state: Guarded<MailboxState>,
    views: Mutex<ViewRegistry>,
}

impl MemoryMailbox {
    fn new(user: &str, name: String) -> Self {
        MemoryMailbox {
            id: super::new_mailbox_id(),
            user: user.to_owned(),
            state: Guarded::new(MailboxState {
                name,
                deleted: false,
                uid_validity: super::new_uid_validity(),
                next_uid: Uid::MIN,
                messages: BTreeMap::new(),
                index: ModseqIndex::new(),
            }),
            views: Mutex::new(ViewRegistry::new()),
        }
    }

    fn notify(&self) {
        lock(&self.views).notify();
    }

    fn log_prefix(&self) -> String {
        format!("{}:{}", self.user, self.state.read().name)
    }
}

impl MailboxData for MemoryMailbox {
    fn name(&self) -> String {
        self.state.read().name.clone()
    }

    fn mailbox_id(&self) -> &str {
        &self.id
    }

    fn uid_validity(&self) -> Result<u32, Error> {
        let state = self.state.read();
        state.live()?;
        Ok(state.uid_validity)
    }

    fn next_uid(&self) -> Result<Uid, Error> {
        let state = self.state.read();
        state.live()?;
        Ok(state.next_uid)
    }

    fn permanent_flags(&self) -> Result<PermanentFlags, Error> {
        Ok(PermanentFlags::unrestricted())
    }

    fn add(
        &self,
        message: &AppendMessage,
        recent: bool,
    ) -> Result<Message, Error> {
        let requested: FlagSet = message.flags.iter().cloned().collect();
        let flags = PermanentFlags::unrestricted().filter(&requested);
        // Hash outside the lock
        let mut stored =
            Message::for_append(Uid::MIN, message, flags, recent, 0);

        {
            let mut state = self.state.write();
            state.live()?;

            let uid = state.next_uid;
            state.next_uid = uid.next().ok_or(Error::MailboxFull)?;
            stored.uid = uid;
            stored.modseq = state.index.record_update(Some(uid)).raw();
            state.messages.insert(uid, stored.clone());
        }

        self.notify();
        Ok(stored)
    }

    fn get(
        &self,
        uid: Uid,
        hint: Option<&Message>,
        requirement: FetchRequirement,
    ) -> Result<Option<Message>, Error> {
        let state = self.state.read();
        state.live()?;
        state.check_uid(uid)?;

        Ok(match state.messages.get(&uid) {
            Some(message) => Some(message.fetched(requirement)),
            None => hint.map(Message::tombstone),
        })
    }

    fn messages(
        &self,
        requirement: FetchRequirement,
    ) -> Result<Vec<Message>, Error> {
        let state = self.state.read();
        state.live()?;
        Ok(state
            .messages
            .values()
            .map(|m| m.fetched(requirement))
            .collect())
    }

    fn delete(&self, uids: &[Uid]) -> Result<Vec<Uid>, Error> {
        let removed = {
            let mut state = self.state.write();
            state.live()?;

            let removed: Vec<Uid> = uids
                .iter()
                .copied()
                .filter(|uid| state.messages.remove(uid).is_some())
                .collect();
            if !removed.is_empty() {
                state.index.record_expunge(removed.iter().copied());
            }
            removed
        };

        if !removed.is_empty() {
            self.notify();
        }
        Ok(removed)
    }

    fn update_flags(
        &self,
        uids: &[Uid],
        flags: &FlagSet,
        mode: FlagMode,
    ) -> Result<Vec<Message>, Error> {
        let permanent = PermanentFlags::unrestricted();
        let updated = {
            let mut state = self.state.write();
            state.live()?;

            let targets: BTreeSet<Uid> = uids
                .iter()
                .copied()
                .filter(|uid| state.messages.contains_key(uid))
                .collect();
            if targets.is_empty() {
                return Ok(Vec::new());
            }

            let modseq = state.index.record_update(targets.iter().copied());
            let mut updated = Vec::with_capacity(targets.len());
            for uid in targets {
                if let Some(message) = state.messages.get_mut(&uid) {
                    super::apply_flags(
                        &mut message.flags,
                        flags,
                        mode,
                        &permanent,
                    );
                    message.modseq = modseq.raw();
                    updated.push(message.metadata());
                }
            }
            updated
        };

        self.notify();
        Ok(updated)
    }

    fn claim_recent(
        &self,
        selected: &mut SelectedMailbox,
    ) -> Result<Vec<Uid>, Error> {
        let claimed = {
            let mut state = self.state.write();
            state.live()?;

            let claimed: Vec<Uid> = state
                .messages
                .values()
                .filter(|m| m.recent)
                .map(|m| m.uid)
                .collect();
            if claimed.is_empty() {
                return Ok(claimed);
            }

            let modseq = state.index.record_update(claimed.iter().copied());
            for uid in &claimed {
                if let Some(message) = state.messages.get_mut(uid) {
                    message.recent = false;
                    message.modseq = modseq.raw();
                }
            }
            claimed
        };

        selected.mark_recent(claimed.iter().copied());
        self.notify();
        Ok(claimed)
    }

    fn cleanup(&self) -> Result<(), Error> {
        Ok(())
    }

    fn update_selected(
        &self,
        selected: &mut SelectedMailbox,
    ) -> Result<(), Error> {
        let state = self.state.read();
        state.live()?;

        let changes = if selected.is_synced() {
            state
                .index
                .changes_since(selected.mod_sequence())
                .into_changes(|uid| {
                    Ok(state.messages.get(&uid).map(Message::metadata))
                })?
        } else {
            Changes::Full(
                state.messages.values().map(Message::metadata).collect(),
            )
        };

        selected.set_name(state.name.clone());
        selected.apply(changes, state.index.highest());
        Ok(())
    }

    fn snapshot(&self) -> Result<MailboxSnapshot, Error> {
        let state = self.state.read();
        state.live()?;
        Ok(MailboxSnapshot::scan(
            state.messages.values(),
            state.next_uid,
            state.uid_validity,
            state.index.highest(),
        ))
    }

    fn select(&self, readonly: bool) -> Result<SelectedMailbox, Error> {
        let (name, uid_validity) = {
            let state = self.state.read();
            state.live()?;
            (state.name.clone(), state.uid_validity)
        };

        let handle = lock(&self.views).register();
        Ok(SelectedMailbox::new(
            handle,
            self.id.clone(),
            name,
            readonly,
            PermanentFlags::unrestricted(),
            uid_validity,
        ))
    }

    fn deselect(&self, handle: ViewHandle) {
        lock(&self.views).deregister(handle);
    }

    fn wake_event(&self, handle: ViewHandle) -> Option<Event> {
        lock(&self.views).wake_event(handle)
    }
}

#[derive(Debug, Default)]
struct SetState {
    mailboxes: BTreeMap<String, Arc<MemoryMailbox>>,
    subscriptions: BTreeSet<String>,
}

impl SetState {
    /// Create `name` and any missing ancestors.
    ///
    /// Fails with `MailboxConflict` if `name` itself exists.
    fn create(
        &mut self,
        user: &str,
        name: &str,
    ) -> Result<Arc<MemoryMailbox>, Error> {
        if self.mailboxes.contains_key(name) {
            return Err(Error::MailboxConflict);
        }

        for ancestor in mailbox_name::ancestors(name) {
            if !self.mailboxes.contains_key(ancestor) {
                self.mailboxes.insert(
                    ancestor.to_owned(),
                    Arc::new(MemoryMailbox::new(user, ancestor.to_owned())),
                );
            }
        }

        let mailbox = Arc::new(MemoryMailbox::new(user, name.to_owned()));
        self.mailboxes.insert(name.to_owned(), Arc::clone(&mailbox));
        Ok(mailbox)
    }

    fn inbox(&mut self, user: &str) -> Result<Arc<MemoryMailbox>, Error> {
        match self.mailboxes.get(mailbox_name::INBOX) {
            Some(inbox) => Ok(Arc::clone(inbox)),
            None => self.create(user, mailbox_name::INBOX),
        }
    }
}

/// The mailboxes of one user, held in memory.
#[derive(Debug)]
pub struct MemoryMailboxSet {
    user: String,
    state: Guarded<SetState>,
}

impl MemoryMailboxSet {
    pub fn new(user: impl Into<String>) -> Self {
        MemoryMailboxSet {
            user: user.into(),
            state: Guarded::new(SetState::default()),
        }
    }
}

impl MailboxSet for MemoryMailboxSet {
    fn user(&self) -> &str {
        &self.user
    }

    fn get_mailbox(
        &self,
        name: &str,
        try_create: bool,
    ) -> Result<Arc<dyn MailboxData>, Error> {
        let name = mailbox_name::normalise(name)?;
        if let Some(mailbox) = self.state.read().mailboxes.get(&name) {
            return Ok(Arc::clone(mailbox) as Arc<dyn MailboxData>);
        }

        if mailbox_name::is_inbox(&name) {
            let inbox = self.state.write().inbox(&self.user)?;
            return Ok(inbox);
        }

        Err(Error::MailboxNotFound { try_create })
    }

    fn add_mailbox(&self, name: &str) -> Result<Arc<dyn MailboxData>, Error> {
        let name = mailbox_name::normalise(name)?;
        let mailbox = self.state.write().create(&self.user, &name)?;
        info!("{} Created mailbox {}", self.user, name);
        Ok(mailbox)
    }

    fn delete_mailbox(&self, name: &str) -> Result<(), Error> {
        let name = mailbox_name::normalise(name)?;
        if mailbox_name::is_inbox(&name) {
            return Err(Error::BadOperationOnInbox);
        }

        let mailbox = {
            let mut state = self.state.write();
            if !state.mailboxes.contains_key(&name) {
                return Err(Error::MailboxNotFound { try_create: false });
            }
            if state
                .mailboxes
                .keys()
                .any(|n| mailbox_name::is_descendant(n, &name))
            {
                return Err(Error::MailboxHasChildren);
            }

            state
                .mailboxes
                .remove(&name)
                .ok_or(Error::MailboxNotFound { try_create: false })?
        };

        mailbox.state.write().deleted = true;
        mailbox.notify();
        info!("{} Deleted mailbox {}", mailbox.log_prefix(), mailbox.id);
        Ok(())
    }

    fn rename_mailbox(&self, before: &str, after: &str) -> Result<(), Error> {
        let before = mailbox_name::normalise(before)?;
        let after = mailbox_name::normalise(after)?;
        if before == after || mailbox_name::is_descendant(&after, &before) {
            return Err(Error::RenameIntoSelf);
        }

        let mut state = self.state.write();
        if mailbox_name::is_inbox(&before) {
            // Make sure there's something to rename
            state.inbox(&self.user)?;
        }

        if !state.mailboxes.contains_key(&before) {
            return Err(Error::MailboxNotFound { try_create: false });
        }
        if state.mailboxes.contains_key(&after) {
            return Err(Error::MailboxConflict);
        }

        let moving: Vec<String> = if mailbox_name::is_inbox(&before) {
            vec![before.clone()]
        } else {
            state
                .mailboxes
                .keys()
                .filter(|n| {
                    **n == before || mailbox_name::is_descendant(n, &before)
                })
                .cloned()
                .collect()
        };

        // Create missing ancestors of the destination; `create` would refuse
        // `after` itself, so do that part by hand.
        for ancestor in mailbox_name::ancestors(&after) {
            if !state.mailboxes.contains_key(ancestor) {
                state.create(&self.user, ancestor)?;
            }
        }

        for old_name in moving {
            let new_name =
                match mailbox_name::rebase(&old_name, &before, &after) {
                    Some(n) => n,
                    None => continue,
                };

            if let Some(mailbox) = state.mailboxes.remove(&old_name) {
                mailbox.state.write().name = new_name.clone();
                mailbox.notify();
                state.mailboxes.insert(new_name, mailbox);
            }
        }

        if mailbox_name::is_inbox(&before) {
            state.inbox(&self.user)?;
        }

        info!("{} Renamed mailbox {} to {}", self.user, before, after);
        Ok(())
    }

    fn set_subscribed(
        &self,
        name: &str,
        subscribed: bool,
    ) -> Result<(), Error> {
        let name = mailbox_name::normalise(name)?;
        let mut state = self.state.write();
        if subscribed {
            state.subscriptions.insert(name);
        } else {
            state.subscriptions.remove(&name);
        }
        Ok(())
    }

    fn list_subscribed(&self) -> Result<Vec<String>, Error> {
        Ok(self.state.read().subscriptions.iter().cloned().collect())
    }

    fn list_mailboxes(&self) -> Result<Vec<String>, Error> {
        let mut state = self.state.write();
        state.inbox(&self.user)?;
        Ok(state.mailboxes.keys().cloned().collect())
    }
}
