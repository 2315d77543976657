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

//! One mailbox in the key-value store.
//!
//! Every operation runs as an optimistic transaction watching the counter
//! and abort keys of the mailbox, so it either sees and modifies a single
//! consistent state or retries from scratch. Reads use the same mechanism
//! with an empty write set.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use chrono::prelude::*;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{
    transact, KvConnection, KvStore, MailboxInfo, MailboxKeys, Op, Tx,
};
use crate::store::model::*;
use crate::store::modseq::ModseqChanges;
use crate::store::selected::{
    Changes, SelectedMailbox, ViewHandle, ViewRegistry,
};
use crate::store::MailboxData;
use crate::support::error::Error;
use crate::support::sync::{lock, Event, Guarded};
use crate::support::system_config::KvConfig;

/// Pending content older than this belongs to an append which died.
const PENDING_STALE_SECS: i64 = 3600;

/// The value of a field of the `messages` hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(super) struct StoredMessage {
    pub message: Message,
    /// The suffix of the key holding the content.
    pub blob: String,
}

#[derive(Debug)]
struct Local {
    name: String,
    deleted: bool,
}

#[derive(Debug)]
pub struct KvMailbox {
    id: String,
    user: String,
    local: Guarded<Local>,
    keys: MailboxKeys,
    store: Arc<dyn KvStore>,
    config: KvConfig,
    views: Mutex<ViewRegistry>,
}

fn uid_field(uid: Uid) -> String {
    uid.get().to_string()
}

fn decode(data: &[u8]) -> Result<StoredMessage, Error> {
    Ok(serde_cbor::from_slice(data)?)
}

fn encode(message: &Message, blob: &str) -> Result<Vec<u8>, Error> {
    Ok(serde_cbor::to_vec(&StoredMessage {
        message: message.metadata(),
        blob: blob.to_owned(),
    })?)
}

impl KvMailbox {
    pub(super) fn new(
        id: String,
        user: &str,
        name: String,
        keys: MailboxKeys,
        store: Arc<dyn KvStore>,
        config: KvConfig,
    ) -> Self {
        KvMailbox {
            id,
            user: user.to_owned(),
            local: Guarded::new(Local {
                name,
                deleted: false,
            }),
            keys,
            store,
            config,
            views: Mutex::new(ViewRegistry::new()),
        }
    }

    pub(super) fn rename(&self, name: String) {
        {
            let mut local = self.local.write();
            if local.name == name {
                return;
            }
            local.name = name;
        }
        self.notify();
    }

    pub(super) fn mark_deleted(&self) {
        self.local.write().deleted = true;
        self.notify();
    }

    fn notify(&self) {
        lock(&self.views).notify();
    }

    fn log_prefix(&self) -> String {
        format!("{}:{}", self.user, self.local.read().name)
    }

    fn live(&self) -> Result<(), Error> {
        if self.local.read().deleted {
            Err(Error::MailboxNotFound { try_create: false })
        } else {
            Ok(())
        }
    }

    /// Read the info record, failing if the mailbox is gone.
    ///
    /// A mailbox which disappears after the first attempt was deleted while
    /// the transaction was in flight, which is reported as `Aborted`.
    fn info(
        &self,
        conn: &mut dyn KvConnection,
        attempt: u32,
    ) -> Result<MailboxInfo, Error> {
        let gone = || {
            if attempt > 0 {
                Error::Aborted
            } else {
                Error::MailboxNotFound { try_create: false }
            }
        };

        if conn.get(&self.keys.abort())?.is_some() {
            return Err(gone());
        }
        match conn.get(&self.keys.info())? {
            Some(data) => Ok(serde_cbor::from_slice(&data)?),
            None => Err(gone()),
        }
    }

    fn highest_modseq(
        &self,
        conn: &mut dyn KvConnection,
    ) -> Result<Option<Modseq>, Error> {
        match conn.get(&self.keys.modseq())? {
            None => Ok(None),
            Some(raw) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Modseq::of)
                .ok_or_else(|| Error::CorruptIndex("modseq".to_owned())),
        }
    }

    fn stored(
        &self,
        conn: &mut dyn KvConnection,
        uid: Uid,
    ) -> Result<Option<StoredMessage>, Error> {
        conn.hget(&self.keys.messages(), &uid_field(uid))?
            .map(|data| decode(&data))
            .transpose()
    }

    /// All stored messages, in ascending UID order.
    fn all_stored(
        &self,
        conn: &mut dyn KvConnection,
    ) -> Result<Vec<StoredMessage>, Error> {
        let mut all = conn
            .hgetall(&self.keys.messages())?
            .into_iter()
            .map(|(_, data)| decode(&data))
            .collect::<Result<Vec<_>, Error>>()?;
        all.sort_by_key(|s| s.message.uid);
        Ok(all)
    }

    fn load(
        &self,
        conn: &mut dyn KvConnection,
        stored: StoredMessage,
        requirement: FetchRequirement,
    ) -> Result<Message, Error> {
        let mut message = stored.message;
        if requirement.needs_content() {
            let content = conn
                .get(&self.keys.content(&stored.blob))?
                .ok_or_else(|| {
                    Error::CorruptIndex(format!(
                        "content of {} missing",
                        message.uid.get()
                    ))
                })?;
            message.content = Some(Arc::from(content));
        }
        Ok(message)
    }

    fn watch_keys(&self) -> [String; 2] {
        [self.keys.modseq(), self.keys.abort()]
    }

    /// Run `body` against a consistent state of the mailbox.
    fn read<R>(
        &self,
        mut body: impl FnMut(
            &mut dyn KvConnection,
            &MailboxInfo,
        ) -> Result<R, Error>,
    ) -> Result<R, Error> {
        self.live()?;
        let (r, _) = transact(
            &*self.store,
            &self.config,
            &self.log_prefix(),
            &self.watch_keys(),
            |conn, _| {
                let info = self.info(conn, 0)?;
                body(conn, &info).map(|r| Tx::Commit(Vec::new(), r))
            },
        )?;
        Ok(r)
    }

    /// Run `body` as a mutation of the mailbox.
    ///
    /// `body` is passed the info record and the counter value the mutation
    /// will be filed under if it commits.
    fn write<R>(
        &self,
        mut body: impl FnMut(
            &mut dyn KvConnection,
            &MailboxInfo,
            Modseq,
        ) -> Result<Tx<R>, Error>,
    ) -> Result<R, Error> {
        self.live()?;
        let (r, committed) = transact(
            &*self.store,
            &self.config,
            &self.log_prefix(),
            &self.watch_keys(),
            |conn, attempt| {
                let info = self.info(conn, attempt)?;
                let modseq = Modseq::after(self.highest_modseq(conn)?);
                Ok(match body(conn, &info, modseq)? {
                    Tx::Commit(mut ops, r) => {
                        ops.push(Op::Set(
                            self.keys.modseq(),
                            modseq.raw().to_string().into_bytes(),
                        ));
                        Tx::Commit(ops, r)
                    }
                    no_changes => no_changes,
                })
            },
        )?;

        if committed {
            self.notify();
        }
        Ok(r)
    }

    /// Write `data` under a fresh blob, recorded as pending.
    fn stage(&self, data: &[u8]) -> Result<String, Error> {
        let blob = format!("{:032x}", rand::random::<u128>());
        let pending = Utc::now().timestamp().to_string().into_bytes();
        transact(
            &*self.store,
            &self.config,
            &self.log_prefix(),
            &[self.keys.abort()],
            |conn, attempt| {
                self.info(conn, attempt)?;
                Ok(Tx::Commit(
                    vec![
                        Op::Set(self.keys.content(&blob), data.to_vec()),
                        Op::HSet(
                            self.keys.pending(),
                            blob.clone(),
                            pending.clone(),
                        ),
                    ],
                    (),
                ))
            },
        )?;
        Ok(blob)
    }

    fn unstage(&self, blob: &str) {
        let result = self.store.connect().and_then(|mut conn| {
            conn.exec(&[
                Op::Del(self.keys.content(blob)),
                Op::HDel(self.keys.pending(), blob.to_owned()),
            ])
        });
        if let Err(e) = result {
            warn!(
                "{} Failed to remove staged content {}: {}",
                self.log_prefix(),
                blob,
                e
            );
        }
    }
}

impl MailboxData for KvMailbox {
    fn name(&self) -> String {
        self.local.read().name.clone()
    }

    fn mailbox_id(&self) -> &str {
        &self.id
    }

    fn uid_validity(&self) -> Result<u32, Error> {
        self.read(|_, info| Ok(info.uid_validity))
    }

    fn next_uid(&self) -> Result<Uid, Error> {
        self.read(|_, info| Ok(info.next_uid))
    }

    fn permanent_flags(&self) -> Result<PermanentFlags, Error> {
        Ok(PermanentFlags::unrestricted())
    }

    fn add(
        &self,
        message: &AppendMessage,
        recent: bool,
    ) -> Result<Message, Error> {
        self.live()?;
        let requested: FlagSet = message.flags.iter().cloned().collect();
        let flags = PermanentFlags::unrestricted().filter(&requested);
        let template = Message::for_append(Uid::MIN, message, flags, recent, 0);
        let blob = self.stage(&message.data)?;

        let result = self.write(|_, info, modseq| {
            let mut stored = template.clone();
            stored.uid = info.next_uid;
            stored.modseq = modseq.raw();
            let next_uid = info.next_uid.next().ok_or(Error::MailboxFull)?;
            let info = MailboxInfo { next_uid, ..*info };

            let ops = vec![
                Op::Set(self.keys.info(), serde_cbor::to_vec(&info)?),
                Op::HSet(
                    self.keys.messages(),
                    uid_field(stored.uid),
                    encode(&stored, &blob)?,
                ),
                Op::HDel(self.keys.pending(), blob.clone()),
                Op::ZAdd(
                    self.keys.updated(),
                    uid_field(stored.uid),
                    modseq.raw(),
                ),
            ];
            Ok(Tx::Commit(ops, stored))
        });

        match result {
            Ok(stored) => {
                debug!("{} Added {}", self.log_prefix(), stored.uid.get());
                Ok(stored)
            }
            Err(e) => {
                self.unstage(&blob);
                Err(e)
            }
        }
    }

    fn get(
        &self,
        uid: Uid,
        hint: Option<&Message>,
        requirement: FetchRequirement,
    ) -> Result<Option<Message>, Error> {
        self.read(|conn, info| {
            if uid >= info.next_uid {
                return Err(Error::InvalidUid);
            }

            match self.stored(conn, uid)? {
                Some(stored) => {
                    self.load(conn, stored, requirement).map(Some)
                }
                None => Ok(hint.map(Message::tombstone)),
            }
        })
    }

    fn messages(
        &self,
        requirement: FetchRequirement,
    ) -> Result<Vec<Message>, Error> {
        self.read(|conn, _| {
            self.all_stored(conn)?
                .into_iter()
                .map(|stored| self.load(conn, stored, requirement))
                .collect()
        })
    }

    fn delete(&self, uids: &[Uid]) -> Result<Vec<Uid>, Error> {
        let removed = self.write(|conn, _, modseq| {
            let mut ops = Vec::new();
            let mut removed = Vec::new();
            let targets: BTreeSet<Uid> = uids.iter().copied().collect();

            for uid in targets {
                if let Some(stored) = self.stored(conn, uid)? {
                    let field = uid_field(uid);
                    ops.push(Op::HDel(self.keys.messages(), field.clone()));
                    ops.push(Op::Del(self.keys.content(&stored.blob)));
                    ops.push(Op::ZRem(self.keys.updated(), field.clone()));
                    ops.push(Op::ZAdd(
                        self.keys.expunged(),
                        field,
                        modseq.raw(),
                    ));
                    removed.push(uid);
                }
            }

            Ok(if removed.is_empty() {
                Tx::NoChanges(removed)
            } else {
                Tx::Commit(ops, removed)
            })
        })?;

        if !removed.is_empty() {
            debug!("{} Expunged {} messages", self.log_prefix(), removed.len());
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
        self.write(|conn, _, modseq| {
            let mut ops = Vec::new();
            let mut updated = Vec::new();
            let targets: BTreeSet<Uid> = uids.iter().copied().collect();

            for uid in targets {
                let stored = match self.stored(conn, uid)? {
                    Some(stored) => stored,
                    None => continue,
                };

                let mut message = stored.message;
                crate::store::apply_flags(
                    &mut message.flags,
                    flags,
                    mode,
                    &permanent,
                );
                message.modseq = modseq.raw();

                let field = uid_field(uid);
                ops.push(Op::HSet(
                    self.keys.messages(),
                    field.clone(),
                    encode(&message, &stored.blob)?,
                ));
                ops.push(Op::ZAdd(self.keys.updated(), field, modseq.raw()));
                updated.push(message);
            }

            Ok(if updated.is_empty() {
                Tx::NoChanges(updated)
            } else {
                Tx::Commit(ops, updated)
            })
        })
    }

    fn claim_recent(
        &self,
        selected: &mut SelectedMailbox,
    ) -> Result<Vec<Uid>, Error> {
        let claimed = self.write(|conn, _, modseq| {
            let mut ops = Vec::new();
            let mut claimed = Vec::new();

            for stored in self.all_stored(conn)? {
                if !stored.message.recent {
                    continue;
                }

                let mut message = stored.message;
                message.recent = false;
                message.modseq = modseq.raw();

                let field = uid_field(message.uid);
                ops.push(Op::HSet(
                    self.keys.messages(),
                    field.clone(),
                    encode(&message, &stored.blob)?,
                ));
                ops.push(Op::ZAdd(self.keys.updated(), field, modseq.raw()));
                claimed.push(message.uid);
            }

            Ok(if claimed.is_empty() {
                Tx::NoChanges(claimed)
            } else {
                Tx::Commit(ops, claimed)
            })
        })?;

        selected.mark_recent(claimed.iter().copied());
        Ok(claimed)
    }

    fn cleanup(&self) -> Result<(), Error> {
        let pending = self.read(|conn, _| conn.hgetall(&self.keys.pending()))?;
        let threshold = Utc::now().timestamp() - PENDING_STALE_SECS;

        let mut removed = 0;
        for (blob, written) in pending {
            let written = std::str::from_utf8(&written)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0);
            if written < threshold {
                self.unstage(&blob);
                removed += 1;
            }
        }

        if removed > 0 {
            info!(
                "{} Removed {} abandoned message blobs",
                self.log_prefix(),
                removed
            );
        }
        Ok(())
    }

    fn update_selected(
        &self,
        selected: &mut SelectedMailbox,
    ) -> Result<(), Error> {
        let synced = selected.is_synced();
        let since = selected.mod_sequence().map_or(0, Modseq::raw);

        let (changes, highest) = self.read(|conn, _| {
            let highest = self.highest_modseq(conn)?;
            let changes = if synced {
                let members = |conn: &mut dyn KvConnection, key: &str| {
                    conn.zrange_after(key, since).and_then(|members| {
                        members
                            .into_iter()
                            .map(|(field, _)| {
                                field.parse::<u32>().ok().and_then(Uid::of)
                            })
                            .collect::<Option<BTreeSet<Uid>>>()
                            .ok_or_else(|| {
                                Error::CorruptIndex("change log".to_owned())
                            })
                    })
                };

                ModseqChanges {
                    updated: members(conn, &self.keys.updated())?,
                    expunged: members(conn, &self.keys.expunged())?,
                    highest,
                }
                .into_changes(|uid| {
                    Ok(self.stored(conn, uid)?.map(|s| s.message))
                })?
            } else {
                Changes::Full(
                    self.all_stored(conn)?
                        .into_iter()
                        .map(|s| s.message)
                        .collect(),
                )
            };

            Ok((changes, highest))
        })?;

        selected.set_name(self.name());
        selected.apply(changes, highest);
        Ok(())
    }

    fn snapshot(&self) -> Result<MailboxSnapshot, Error> {
        self.read(|conn, info| {
            let highest = self.highest_modseq(conn)?;
            let messages: Vec<Message> = self
                .all_stored(conn)?
                .into_iter()
                .map(|s| s.message)
                .collect();
            Ok(MailboxSnapshot::scan(
                &messages,
                info.next_uid,
                info.uid_validity,
                highest,
            ))
        })
    }

    fn select(&self, readonly: bool) -> Result<SelectedMailbox, Error> {
        let uid_validity = self.uid_validity()?;
        let handle = lock(&self.views).register();
        Ok(SelectedMailbox::new(
            handle,
            self.id.clone(),
            self.name(),
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
