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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Mailbox does not exist")]
    MailboxNotFound {
        /// Whether creating the mailbox first would let the operation
        /// succeed (the `[TRYCREATE]` hint).
        try_create: bool,
    },
    #[error("Mailbox already exists")]
    MailboxConflict,
    #[error("Mailbox has child mailboxes")]
    MailboxHasChildren,
    #[error("Mailbox is selected read-only")]
    MailboxReadOnly,
    #[error("UID out of range")]
    InvalidUid,
    #[error("Timed out waiting for lock")]
    LockTimeout,
    #[error("Lock was broken as stale while still held")]
    LockLost,
    #[error("Transaction aborted; mailbox is being deleted")]
    Aborted,
    #[error("Unsafe mailbox name")]
    UnsafeName,
    #[error("Operation not allowed on INBOX")]
    BadOperationOnInbox,
    #[error("Cannot rename mailbox into itself")]
    RenameIntoSelf,
    #[error("No mailbox selected")]
    NoSelection,
    #[error("No such message")]
    NxMessage,
    #[error("Unknown system flag")]
    NxFlag,
    #[error("Corrupt index file: {0}")]
    CorruptIndex(String),
    #[error("Mailbox full; no more UIDs can be allocated")]
    MailboxFull,
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    Cbor(#[from] serde_cbor::error::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[cfg(feature = "redis-backend")]
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

impl Error {
    /// Return whether this error only reflects contention, i.e., retrying the
    /// same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(*self, Error::LockTimeout | Error::LockLost)
    }
}
