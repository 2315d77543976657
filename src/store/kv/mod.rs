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

//! The key-value engine.
//!
//! Mailboxes live in a store with Redis semantics: plain values, hashes and
//! sorted sets, plus optimistic transactions through `WATCH`/`MULTI`/`EXEC`.
//! The same code runs against a real Redis server (with the `redis-backend`
//! feature) or against `MemoryKv`.
//!
//! Keys, where `<p>` is `<namespace>:<user>` and `<m>` is
//! `<p>:mbox:<mailbox-id>`:
//!
//! - `<p>:mailboxes`: hash of mailbox name to mailbox id.
//! - `<p>:subscriptions`: hash whose fields are the subscribed names.
//! - `<m>:info`: CBOR of the UID validity and next UID.
//! - `<m>:modseq`: the mod-sequence counter, in decimal. Every mutation of
//!   the mailbox writes this key, so watching it detects any concurrent
//!   mutation.
//! - `<m>:abort`: set when the mailbox is deleted. Transactions watch it, and
//!   any in flight at the time of deletion fail with `Aborted`.
//! - `<m>:messages`: hash of UID to CBOR message metadata.
//! - `<m>:content:<blob>`: raw message content.
//! - `<m>:pending`: hash of content blobs written ahead of the transaction
//!   that will reference them, with the time they were written.
//! - `<m>:updated`, `<m>:expunged`: sorted sets of UID scored by the counter
//!   value at which the UID was last updated or expunged. A UID is in at
//!   most one of the two.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

mod mailbox;
mod memory_kv;
#[cfg(feature = "redis-backend")]
mod redis_kv;

pub use self::mailbox::KvMailbox;
pub use self::memory_kv::MemoryKv;
#[cfg(feature = "redis-backend")]
pub use self::redis_kv::RedisKv;

use super::mailbox_name::{self, INBOX};
use super::model::Uid;
use super::{MailboxData, MailboxSet};
use crate::support::error::Error;
use crate::support::sync::Guarded;
use crate::support::system_config::KvConfig;

/// A write within a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Set(String, Vec<u8>),
    Del(String),
    HSet(String, String, Vec<u8>),
    HDel(String, String),
    ZAdd(String, String, u64),
    ZRem(String, String),
}

impl Op {
    pub fn key(&self) -> &str {
        match *self {
            Op::Set(ref k, _)
            | Op::Del(ref k)
            | Op::HSet(ref k, _, _)
            | Op::HDel(ref k, _)
            | Op::ZAdd(ref k, _, _)
            | Op::ZRem(ref k, _) => k,
        }
    }
}

/// A connection to the store.
///
/// Watches belong to the connection, which is why each transaction needs a
/// connection of its own.
pub trait KvConnection {
    /// Add `keys` to the watched set.
    fn watch(&mut self, keys: &[String]) -> Result<(), Error>;
    fn unwatch(&mut self) -> Result<(), Error>;

    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, Error>;
    fn hget(&mut self, key: &str, field: &str)
        -> Result<Option<Vec<u8>>, Error>;
    fn hgetall(&mut self, key: &str) -> Result<Vec<(String, Vec<u8>)>, Error>;

    /// Members of the sorted set at `key` whose score is strictly greater
    /// than `after`, in ascending score order.
    fn zrange_after(
        &mut self,
        key: &str,
        after: u64,
    ) -> Result<Vec<(String, u64)>, Error>;

    /// Apply `ops` atomically and clear the watched set.
    ///
    /// Returns `false`, having applied nothing, if any watched key was
    /// written since it was watched.
    fn exec(&mut self, ops: &[Op]) -> Result<bool, Error>;
}

pub trait KvStore: Send + Sync + fmt::Debug {
    fn connect(&self) -> Result<Box<dyn KvConnection>, Error>;
}

pub(super) enum Tx<R> {
    Commit(Vec<Op>, R),
    NoChanges(R),
}

/// Run `body` as an optimistic transaction watching `watch`.
///
/// `body` is told which attempt it is on, starting from 0, and must compute
/// everything from scratch each time. Returns the result and whether
/// anything was committed.
pub(super) fn transact<R>(
    store: &dyn KvStore,
    config: &KvConfig,
    log_prefix: &str,
    watch: &[String],
    mut body: impl FnMut(&mut dyn KvConnection, u32) -> Result<Tx<R>, Error>,
) -> Result<(R, bool), Error> {
    let mut conn = store.connect()?;

    for attempt in 0..=config.max_retries {
        conn.watch(watch)?;
        match body(&mut *conn, attempt) {
            Ok(Tx::NoChanges(r)) => {
                conn.unwatch()?;
                return Ok((r, false));
            }
            Ok(Tx::Commit(ops, r)) => {
                if conn.exec(&ops)? {
                    if attempt > 0 {
                        debug!(
                            "{} Committed after {} collisions",
                            log_prefix, attempt
                        );
                    }
                    return Ok((r, true));
                }
            }
            Err(e) => {
                let _ = conn.unwatch();
                return Err(e);
            }
        }
    }

    warn!(
        "{} Giving up after {} transaction collisions",
        log_prefix,
        config.max_retries + 1
    );
    Err(Error::LockTimeout)
}

#[derive(Clone, Debug)]
struct UserKeys {
    prefix: String,
}

impl UserKeys {
    fn mailboxes(&self) -> String {
        format!("{}:mailboxes", self.prefix)
    }

    fn subscriptions(&self) -> String {
        format!("{}:subscriptions", self.prefix)
    }

    fn mailbox(&self, id: &str) -> MailboxKeys {
        MailboxKeys {
            base: format!("{}:mbox:{}", self.prefix, id),
        }
    }
}

#[derive(Clone, Debug)]
pub(super) struct MailboxKeys {
    base: String,
}

impl MailboxKeys {
    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.base, suffix)
    }

    pub(super) fn info(&self) -> String {
        self.key("info")
    }

    pub(super) fn modseq(&self) -> String {
        self.key("modseq")
    }

    pub(super) fn abort(&self) -> String {
        self.key("abort")
    }

    pub(super) fn messages(&self) -> String {
        self.key("messages")
    }

    pub(super) fn pending(&self) -> String {
        self.key("pending")
    }

    pub(super) fn updated(&self) -> String {
        self.key("updated")
    }

    pub(super) fn expunged(&self) -> String {
        self.key("expunged")
    }

    pub(super) fn content(&self, blob: &str) -> String {
        self.key(&format!("content:{}", blob))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub(super) struct MailboxInfo {
    pub uid_validity: u32,
    pub next_uid: Uid,
}

impl MailboxInfo {
    fn create_ops(keys: &MailboxKeys) -> Result<Vec<Op>, Error> {
        let info = MailboxInfo {
            uid_validity: super::new_uid_validity(),
            next_uid: Uid::MIN,
        };
        Ok(vec![Op::Set(keys.info(), serde_cbor::to_vec(&info)?)])
    }
}

/// The mailboxes of one user, stored in a key-value store.
#[derive(Debug)]
pub struct KvMailboxSet {
    user: String,
    keys: UserKeys,
    store: Arc<dyn KvStore>,
    config: KvConfig,
    /// Instances handed out so far, by mailbox id.
    mailboxes: Guarded<HashMap<String, Arc<KvMailbox>>>,
}

impl KvMailboxSet {
    pub fn new(
        store: Arc<dyn KvStore>,
        namespace: &str,
        user: &str,
        config: KvConfig,
    ) -> Result<Self, Error> {
        if !mailbox_name::is_safe_segment(user) || user.contains(':') {
            return Err(Error::UnsafeName);
        }

        Ok(KvMailboxSet {
            user: user.to_owned(),
            keys: UserKeys {
                prefix: format!("{}:{}", namespace, user),
            },
            store,
            config,
            mailboxes: Guarded::new(HashMap::new()),
        })
    }

    fn transact<R>(
        &self,
        body: impl FnMut(&mut dyn KvConnection, u32) -> Result<Tx<R>, Error>,
    ) -> Result<R, Error> {
        transact(
            &*self.store,
            &self.config,
            &self.user,
            &[self.keys.mailboxes()],
            body,
        )
        .map(|(r, _)| r)
    }

    fn directory(
        &self,
        conn: &mut dyn KvConnection,
    ) -> Result<BTreeMap<String, String>, Error> {
        conn.hgetall(&self.keys.mailboxes())?
            .into_iter()
            .map(|(name, id)| {
                String::from_utf8(id)
                    .map(|id| (name, id))
                    .map_err(|_| Error::CorruptIndex("mailbox id".to_owned()))
            })
            .collect()
    }

    /// Create `names` (which must be in order, parents first) as needed.
    ///
    /// If `strict`, fails with `MailboxConflict` if the last one exists.
    fn create(&self, names: &[&str], strict: bool) -> Result<(), Error> {
        let created = self.transact(|conn, _| {
            let directory = self.directory(conn)?;
            let mut ops = Vec::new();
            let mut created = Vec::new();

            for (ix, &name) in names.iter().enumerate() {
                if directory.contains_key(name) {
                    if strict && ix + 1 == names.len() {
                        return Err(Error::MailboxConflict);
                    }
                    continue;
                }

                let id = super::new_mailbox_id();
                ops.extend(MailboxInfo::create_ops(&self.keys.mailbox(&id))?);
                ops.push(Op::HSet(
                    self.keys.mailboxes(),
                    name.to_owned(),
                    id.into_bytes(),
                ));
                created.push(name.to_owned());
            }

            Ok(if ops.is_empty() {
                Tx::NoChanges(created)
            } else {
                Tx::Commit(ops, created)
            })
        })?;

        for name in created {
            info!("{} Created mailbox {}", self.user, name);
        }
        Ok(())
    }

    /// Return the shared instance for mailbox `id`, now named `name`.
    fn instance(&self, id: &str, name: &str) -> Arc<KvMailbox> {
        let mut mailboxes = self.mailboxes.write();
        let mailbox = mailboxes.entry(id.to_owned()).or_insert_with(|| {
            Arc::new(KvMailbox::new(
                id.to_owned(),
                &self.user,
                name.to_owned(),
                self.keys.mailbox(id),
                Arc::clone(&self.store),
                self.config,
            ))
        });
        mailbox.rename(name.to_owned());
        Arc::clone(mailbox)
    }
}

impl MailboxSet for KvMailboxSet {
    fn user(&self) -> &str {
        &self.user
    }

    fn get_mailbox(
        &self,
        name: &str,
        try_create: bool,
    ) -> Result<Arc<dyn MailboxData>, Error> {
        let name = mailbox_name::normalise(name)?;
        let mut conn = self.store.connect()?;
        let mut id = conn.hget(&self.keys.mailboxes(), &name)?;
        if id.is_none() && mailbox_name::is_inbox(&name) {
            self.create(&[INBOX], false)?;
            id = conn.hget(&self.keys.mailboxes(), &name)?;
        }

        match id {
            Some(id) => {
                let id = String::from_utf8(id).map_err(|_| {
                    Error::CorruptIndex("mailbox id".to_owned())
                })?;
                Ok(self.instance(&id, &name))
            }
            None => Err(Error::MailboxNotFound { try_create }),
        }
    }

    fn add_mailbox(&self, name: &str) -> Result<Arc<dyn MailboxData>, Error> {
        let name = mailbox_name::normalise(name)?;
        let mut names = mailbox_name::ancestors(&name);
        names.push(&name);
        self.create(&names, true)?;
        self.get_mailbox(&name, false)
    }

    fn delete_mailbox(&self, name: &str) -> Result<(), Error> {
        let name = mailbox_name::normalise(name)?;
        if mailbox_name::is_inbox(&name) {
            return Err(Error::BadOperationOnInbox);
        }

        let not_found = || Error::MailboxNotFound { try_create: false };
        let id = {
            let mut conn = self.store.connect()?;
            self.directory(&mut *conn)?
                .remove(&name)
                .ok_or_else(not_found)?
        };
        let keys = self.keys.mailbox(&id);

        transact(
            &*self.store,
            &self.config,
            &self.user,
            &[self.keys.mailboxes(), keys.modseq()],
            |conn, _| {
                let directory = self.directory(conn)?;
                if Some(&id) != directory.get(&name) {
                    return Err(not_found());
                }
                if directory
                    .keys()
                    .any(|n| mailbox_name::is_descendant(n, &name))
                {
                    return Err(Error::MailboxHasChildren);
                }

                let mut ops = vec![
                    Op::Set(keys.abort(), b"1".to_vec()),
                    Op::HDel(self.keys.mailboxes(), name.clone()),
                ];
                for (_, data) in conn.hgetall(&keys.messages())? {
                    let stored: mailbox::StoredMessage =
                        serde_cbor::from_slice(&data)?;
                    ops.push(Op::Del(keys.content(&stored.blob)));
                }
                for (blob, _) in conn.hgetall(&keys.pending())? {
                    ops.push(Op::Del(keys.content(&blob)));
                }
                for key in &[
                    keys.info(),
                    keys.modseq(),
                    keys.messages(),
                    keys.pending(),
                    keys.updated(),
                    keys.expunged(),
                ] {
                    ops.push(Op::Del(key.clone()));
                }

                Ok(Tx::Commit(ops, ()))
            },
        )?;

        if let Some(mailbox) = self.mailboxes.write().remove(&id) {
            mailbox.mark_deleted();
        }
        info!("{} Deleted mailbox {} ({})", self.user, name, id);
        Ok(())
    }

    fn rename_mailbox(&self, before: &str, after: &str) -> Result<(), Error> {
        let before = mailbox_name::normalise(before)?;
        let after = mailbox_name::normalise(after)?;
        if before == after || mailbox_name::is_descendant(&after, &before) {
            return Err(Error::RenameIntoSelf);
        }

        let renaming_inbox = mailbox_name::is_inbox(&before);
        if renaming_inbox {
            // Make sure there's something to rename
            self.create(&[INBOX], false)?;
        }

        let moved = self.transact(|conn, _| {
            let directory = self.directory(conn)?;
            if !directory.contains_key(&before) {
                return Err(Error::MailboxNotFound { try_create: false });
            }
            if directory.contains_key(&after) {
                return Err(Error::MailboxConflict);
            }

            let mut ops = Vec::new();
            let mut moved = Vec::new();
            for (name, id) in &directory {
                let new_name = if renaming_inbox {
                    Some(after.clone()).filter(|_| *name == before)
                } else {
                    mailbox_name::rebase(name, &before, &after)
                };

                if let Some(new_name) = new_name {
                    ops.push(Op::HDel(self.keys.mailboxes(), name.clone()));
                    moved.push((id.clone(), new_name));
                }
            }
            for &(ref id, ref new_name) in &moved {
                ops.push(Op::HSet(
                    self.keys.mailboxes(),
                    new_name.clone(),
                    id.clone().into_bytes(),
                ));
            }

            let mut fresh: Vec<&str> = mailbox_name::ancestors(&after)
                .into_iter()
                .filter(|a| !directory.contains_key(*a))
                .collect();
            if renaming_inbox {
                fresh.push(INBOX);
            }
            for name in fresh {
                let id = super::new_mailbox_id();
                ops.extend(MailboxInfo::create_ops(&self.keys.mailbox(&id))?);
                ops.push(Op::HSet(
                    self.keys.mailboxes(),
                    name.to_owned(),
                    id.into_bytes(),
                ));
            }

            Ok(Tx::Commit(ops, moved))
        })?;

        let mailboxes = self.mailboxes.read();
        for (id, new_name) in moved {
            if let Some(mailbox) = mailboxes.get(&id) {
                mailbox.rename(new_name);
            }
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
        let key = self.keys.subscriptions();
        let op = if subscribed {
            Op::HSet(key, name, Vec::new())
        } else {
            Op::HDel(key, name)
        };

        // A single write needs no watch, so this always goes through
        self.store.connect()?.exec(&[op])?;
        Ok(())
    }

    fn list_subscribed(&self) -> Result<Vec<String>, Error> {
        let mut names: Vec<String> = self
            .store
            .connect()?
            .hgetall(&self.keys.subscriptions())?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        names.sort();
        Ok(names)
    }

    fn list_mailboxes(&self) -> Result<Vec<String>, Error> {
        self.create(&[INBOX], false)?;
        let mut conn = self.store.connect()?;
        Ok(self.directory(&mut *conn)?.into_iter().map(|(n, _)| n).collect())
    }
}
