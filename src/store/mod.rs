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

//! The storage engines and the contracts they implement.
//!
//! A `MailboxSet` is the collection of mailboxes belonging to one user, and a
//! `MailboxData` is one mailbox within it. Sessions never see which engine is
//! behind either; `backend` resolves the configuration to one of them.
//!
//! All engines share the same observable semantics, which is verified by
//! running the suite in `conformance` against each of them.

use std::fmt;
use std::sync::Arc;

use crate::support::error::Error;
use crate::support::sync::Event;

pub mod backend;
pub mod identity;
pub mod kv;
pub mod mailbox_name;
pub mod maildir;
pub mod memory;
pub mod model;
pub mod modseq;
pub mod selected;

#[cfg(test)]
mod conformance;

use self::model::*;
use self::selected::{SelectedMailbox, ViewHandle};

/// One mailbox of one user.
///
/// Methods take `&self`; every engine handles its own synchronisation, and a
/// single instance is shared by all sessions of the user within the process.
pub trait MailboxData: fmt::Debug + Send + Sync {
    /// The current normalised name. This changes when the mailbox is renamed.
    fn name(&self) -> String;

    /// An opaque identifier that survives renames.
    fn mailbox_id(&self) -> &str;

    fn uid_validity(&self) -> Result<u32, Error>;

    /// One above the highest UID ever assigned in this mailbox.
    fn next_uid(&self) -> Result<Uid, Error>;

    fn permanent_flags(&self) -> Result<PermanentFlags, Error>;

    /// Add a message, assigning it the next UID.
    ///
    /// Flags the mailbox cannot store permanently are dropped. If `recent`
    /// is set, the message is `\Recent` until some session claims it.
    fn add(&self, message: &AppendMessage, recent: bool)
        -> Result<Message, Error>;

    /// Return the current state of `uid`.
    ///
    /// If the message no longer exists, returns a tombstone built from
    /// `hint` if given, and `None` otherwise. Fails with `InvalidUid` if
    /// `uid` was never assigned.
    fn get(
        &self,
        uid: Uid,
        hint: Option<&Message>,
        requirement: FetchRequirement,
    ) -> Result<Option<Message>, Error>;

    /// All live messages in ascending UID order.
    fn messages(
        &self,
        requirement: FetchRequirement,
    ) -> Result<Vec<Message>, Error>;

    /// Expunge `uids`, ignoring any which do not exist.
    ///
    /// Returns the UIDs which were actually removed.
    fn delete(&self, uids: &[Uid]) -> Result<Vec<Uid>, Error>;

    /// Modify the flags of every message in `uids` which exists.
    ///
    /// Returns the updated messages.
    fn update_flags(
        &self,
        uids: &[Uid],
        flags: &FlagSet,
        mode: FlagMode,
    ) -> Result<Vec<Message>, Error>;

    /// Consume the storage-level `\Recent` marker of every message still
    /// carrying it, giving the session `\Recent` for those messages instead.
    ///
    /// Returns the claimed UIDs.
    fn claim_recent(
        &self,
        selected: &mut SelectedMailbox,
    ) -> Result<Vec<Uid>, Error>;

    /// Perform housekeeping. Problems are logged rather than returned where
    /// possible.
    fn cleanup(&self) -> Result<(), Error>;

    /// Feed every change since the last call into `selected`.
    fn update_selected(&self, selected: &mut SelectedMailbox)
        -> Result<(), Error>;

    fn snapshot(&self) -> Result<MailboxSnapshot, Error>;

    /// Register and return a new, not-yet-synchronised view.
    fn select(&self, readonly: bool) -> Result<SelectedMailbox, Error>;

    /// Remove a view from the registry. Unknown handles are ignored.
    fn deselect(&self, handle: ViewHandle);

    /// Return the event the next mutation will signal for `handle`.
    fn wake_event(&self, handle: ViewHandle) -> Option<Event>;
}

/// The mailboxes of one user.
pub trait MailboxSet: fmt::Debug + Send + Sync {
    fn user(&self) -> &str;

    /// Look up a mailbox by name.
    ///
    /// INBOX is created on first reference. Anything else which does not
    /// exist fails with `MailboxNotFound`, carrying `try_create` to indicate
    /// whether the caller should suggest creating it.
    fn get_mailbox(
        &self,
        name: &str,
        try_create: bool,
    ) -> Result<Arc<dyn MailboxData>, Error>;

    /// Create a mailbox, along with any missing parents.
    fn add_mailbox(&self, name: &str) -> Result<Arc<dyn MailboxData>, Error>;

    fn delete_mailbox(&self, name: &str) -> Result<(), Error>;

    /// Rename a mailbox and everything beneath it.
    ///
    /// Renaming INBOX instead moves the INBOX to the new name and creates a
    /// fresh INBOX in its place; children of INBOX stay where they are.
    fn rename_mailbox(&self, before: &str, after: &str) -> Result<(), Error>;

    fn set_subscribed(&self, name: &str, subscribed: bool)
        -> Result<(), Error>;

    fn list_subscribed(&self) -> Result<Vec<String>, Error>;

    /// The names of all mailboxes, sorted.
    fn list_mailboxes(&self) -> Result<Vec<String>, Error>;

    /// Run `MailboxData::cleanup()` on every mailbox.
    fn cleanup(&self) -> Result<(), Error> {
        for name in self.list_mailboxes()? {
            match self.get_mailbox(&name, false) {
                Ok(mailbox) => mailbox.cleanup()?,
                // Deleted concurrently
                Err(Error::MailboxNotFound { .. }) => (),
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

/// Generate a new UID validity.
pub(crate) fn new_uid_validity() -> u32 {
    loop {
        let v = rand::random::<u32>();
        if 0 != v {
            return v;
        }
    }
}

/// Generate a new opaque mailbox identifier.
pub(crate) fn new_mailbox_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Apply `mode` with the permitted subset of `requested` to `flags`,
/// returning whether anything changed.
pub(crate) fn apply_flags(
    flags: &mut FlagSet,
    requested: &FlagSet,
    mode: FlagMode,
    permanent: &PermanentFlags,
) -> bool {
    mode.apply(flags, &permanent.filter(requested))
}
