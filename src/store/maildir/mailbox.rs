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

//! One maildir mailbox.
//!
//! Message flags live in the info suffix of each file name, and storage-level
//! `\Recent` is whether the file is still in `new/`. Everything else about a
//! message is in its `uidlist` record. The `uidlist` and `keywords` files are
//! only ever replaced atomically, and only while holding the `lock` file.
//!
//! Readers do not take the lock unless it is already held. A lock-free read
//! can race with a writer renaming a file, in which case some `uidlist`
//! record appears to have no file. Such a read is discarded and repeated
//! under the lock, where a missing file really means the message is gone.
//!
//! There is no change log. Views are resynchronised by rescanning the whole
//! mailbox and diffing against what they last saw, which is why a message's
//! `modseq` is the modification time of its file.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::prelude::*;
use log::{debug, info, warn};

use super::keywords::{split_filename, Keywords, INFO_PREFIX};
use super::uid_list::{UidList, UidRecord};
use super::{KEYWORDS, LOCK, TMP, UIDLIST};
use crate::store::model::*;
use crate::store::selected::{
    Changes, SelectedMailbox, ViewHandle, ViewRegistry,
};
use crate::store::MailboxData;
use crate::support::error::Error;
use crate::support::file_lock::FileLock;
use crate::support::file_ops::{self, ErrorTransforms, IgnoreKinds};
use crate::support::sync::{lock, Event, Guarded};
use crate::support::system_config::LockingConfig;

/// Files in `tmp/` older than this are assumed abandoned.
const TMP_STALE: Duration = Duration::from_secs(36 * 3600);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Subdir {
    New,
    Cur,
}

impl Subdir {
    fn name(self) -> &'static str {
        match self {
            Subdir::New => "new",
            Subdir::Cur => "cur",
        }
    }
}

#[derive(Clone, Debug)]
struct MessageFile {
    subdir: Subdir,
    filename: String,
    info: String,
    stamp: u64,
}

impl MessageFile {
    fn path(&self, dir: &Path) -> PathBuf {
        dir.join(self.subdir.name()).join(&self.filename)
    }

    /// Rename the file into `subdir` with the given info letters.
    fn move_to(
        &mut self,
        dir: &Path,
        basename: &str,
        subdir: Subdir,
        info: String,
    ) -> io::Result<()> {
        let filename = format!("{}{}{}", basename, INFO_PREFIX, info);
        if subdir == self.subdir && filename == self.filename {
            return Ok(());
        }

        fs::rename(self.path(dir), dir.join(subdir.name()).join(&filename))?;
        self.subdir = subdir;
        self.filename = filename;
        self.info = info;
        Ok(())
    }
}

fn stamp(md: &fs::Metadata) -> u64 {
    md.modified()
        .ok()
        .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos() as u64)
}

enum Write<R> {
    Commit(R),
    NoChanges(R),
}

/// The state of the maildir as read from disk.
struct Scan {
    uid_list: UidList,
    keywords: Keywords,
    keywords_dirty: bool,
    /// Message files in `new/` and `cur/`, by basename.
    files: HashMap<String, MessageFile>,
}

impl Scan {
    fn load(dir: &Path) -> Result<Self, Error> {
        let uid_list = match file_ops::slurp_opt(dir.join(UIDLIST))? {
            Some(data) => UidList::parse(&String::from_utf8_lossy(&data))?,
            None => return Err(Error::MailboxNotFound { try_create: false }),
        };
        let keywords = match file_ops::slurp_opt(dir.join(KEYWORDS))? {
            Some(data) => Keywords::parse(&String::from_utf8_lossy(&data))?,
            None => Keywords::default(),
        };

        let mut files = HashMap::with_capacity(uid_list.records.len());
        for &subdir in &[Subdir::New, Subdir::Cur] {
            let entries = fs::read_dir(dir.join(subdir.name()))
                .on_not_found(Error::MailboxNotFound { try_create: false })?;
            for entry in entries {
                let entry = entry?;
                let filename = match entry.file_name().into_string() {
                    Ok(name) if !name.starts_with('.') => name,
                    _ => continue,
                };
                let md = match entry.metadata() {
                    Ok(md) => md,
                    // Renamed or deleted since listing
                    Err(e) if io::ErrorKind::NotFound == e.kind() => continue,
                    Err(e) => return Err(e.into()),
                };

                let (basename, info) = split_filename(&filename);
                files.insert(
                    basename.to_owned(),
                    MessageFile {
                        subdir,
                        info: info.to_owned(),
                        stamp: stamp(&md),
                        filename: filename.clone(),
                    },
                );
            }
        }

        Ok(Scan {
            uid_list,
            keywords,
            keywords_dirty: false,
            files,
        })
    }

    /// Whether every record has a file.
    fn is_consistent(&self) -> bool {
        self.uid_list
            .records
            .iter()
            .all(|r| self.files.contains_key(&r.basename))
    }

    /// Assign letters to any new keywords in `flags`.
    fn intern(&mut self, flags: &FlagSet) {
        for flag in flags.iter().filter(|f| !f.is_system()) {
            let before = self.keywords.len();
            self.keywords.intern(flag);
            self.keywords_dirty |= before != self.keywords.len();
        }
    }

    fn save_keywords(&mut self, dir: &Path) -> Result<(), Error> {
        if self.keywords_dirty {
            file_ops::spit(
                dir.join(TMP),
                dir.join(KEYWORDS),
                true,
                0o600,
                self.keywords.to_string().as_bytes(),
            )?;
            self.keywords_dirty = false;
        }
        Ok(())
    }

    /// Fetch `uid` along with whatever content `requirement` needs.
    ///
    /// If `locked` is false and the file has disappeared, `Fetched::Moved`
    /// is returned since a writer may just have renamed it. With the lock
    /// held, a missing file means the message is gone.
    fn message(
        &self,
        dir: &Path,
        uid: Uid,
        requirement: FetchRequirement,
        locked: bool,
    ) -> Result<Fetched<Option<Message>>, Error> {
        let record = match self.uid_list.find(uid) {
            Some(record) => record,
            None => return Ok(Fetched::Done(None)),
        };
        let file = match self.files.get(&record.basename) {
            Some(file) => file,
            None => return Ok(Fetched::Done(None)),
        };

        let message = build(record, file, &self.keywords);
        Ok(match load_content(dir, message, file, requirement)? {
            Some(message) => Fetched::Done(Some(message)),
            None if locked => Fetched::Done(None),
            None => Fetched::Moved,
        })
    }

    /// All messages with a file, without content.
    fn metadata(&self) -> Vec<Message> {
        self.uid_list
            .records
            .iter()
            .filter_map(|record| {
                self.files
                    .get(&record.basename)
                    .map(|file| build(record, file, &self.keywords))
            })
            .collect()
    }

    fn messages(
        &self,
        dir: &Path,
        requirement: FetchRequirement,
        locked: bool,
    ) -> Result<Fetched<Vec<Message>>, Error> {
        let mut messages = Vec::with_capacity(self.uid_list.records.len());
        for record in &self.uid_list.records {
            if let Some(file) = self.files.get(&record.basename) {
                let message = build(record, file, &self.keywords);
                match load_content(dir, message, file, requirement)? {
                    Some(message) => messages.push(message),
                    None if locked => (),
                    None => return Ok(Fetched::Moved),
                }
            }
        }
        Ok(Fetched::Done(messages))
    }
}

/// The result of reading message content against a `Scan`.
enum Fetched<T> {
    Done(T),
    /// A file listed by the scan was no longer there when its content was
    /// read. Without the lock, this usually means a writer renamed it.
    Moved,
}

fn build(
    record: &UidRecord,
    file: &MessageFile,
    keywords: &Keywords,
) -> Message {
    Message {
        uid: record.uid,
        internal_date: record
            .internal_date()
            .unwrap_or_else(|| Utc.timestamp(0, 0)),
        flags: keywords.from_info(&file.info),
        recent: Subdir::New == file.subdir,
        email_id: record.email_id().unwrap_or_default().to_owned(),
        thread_id: record.thread_id().unwrap_or_default().to_owned(),
        size: record.size().unwrap_or(0),
        modseq: file.stamp,
        expunged: false,
        content: None,
    }
}

/// Attach the content of `file` to `message` if `requirement` needs it.
///
/// Returns `None` if the file is no longer where the scan saw it.
fn load_content(
    dir: &Path,
    message: Message,
    file: &MessageFile,
    requirement: FetchRequirement,
) -> Result<Option<Message>, Error> {
    if !requirement.needs_content() {
        return Ok(Some(message));
    }

    match fs::read(file.path(dir)) {
        Ok(data) => Ok(Some(Message {
            content: Some(Arc::from(data)),
            ..message
        })),
        Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug)]
struct Location {
    name: String,
    /// The maildir proper, i.e., the `%` directory.
    dir: PathBuf,
    deleted: bool,
}

/// A mailbox stored as a maildir.
///
/// The `MaildirMailboxSet` keeps one instance per mailbox id so that views in
/// the same process share a registry, and moves it when the mailbox is
/// renamed.
#[derive(Debug)]
pub struct MaildirMailbox {
    id: String,
    user: String,
    location: Guarded<Location>,
    locking: LockingConfig,
    views: Mutex<ViewRegistry>,
}

impl MaildirMailbox {
    pub(super) fn new(
        id: String,
        user: &str,
        name: String,
        dir: PathBuf,
        locking: LockingConfig,
    ) -> Self {
        MaildirMailbox {
            id,
            user: user.to_owned(),
            location: Guarded::new(Location {
                name,
                dir,
                deleted: false,
            }),
            locking,
            views: Mutex::new(ViewRegistry::new()),
        }
    }

    /// Update where this mailbox lives after a rename.
    pub(super) fn relocate(&self, name: String, dir: PathBuf) {
        {
            let mut location = self.location.write();
            if location.name == name && location.dir == dir {
                return;
            }
            location.name = name;
            location.dir = dir;
        }
        self.notify();
    }

    pub(super) fn mark_deleted(&self) {
        self.location.write().deleted = true;
        self.notify();
    }

    fn notify(&self) {
        lock(&self.views).notify();
    }

    fn log_prefix(&self) -> String {
        format!("{}:{}", self.user, self.location.read().name)
    }

    fn dir(&self) -> Result<PathBuf, Error> {
        let location = self.location.read();
        if location.deleted {
            Err(Error::MailboxNotFound { try_create: false })
        } else {
            Ok(location.dir.clone())
        }
    }

    fn lock(&self, dir: &Path) -> Result<FileLock, Error> {
        FileLock::acquire(dir.join(LOCK), &self.locking)
            .on_not_found(Error::MailboxNotFound { try_create: false })
    }

    fn read(&self) -> Result<(PathBuf, Scan), Error> {
        let dir = self.dir()?;
        if !FileLock::is_held(&dir.join(LOCK)) {
            let scan = Scan::load(&dir)?;
            if scan.is_consistent() {
                return Ok((dir, scan));
            }

            debug!(
                "{} Raced with a writer; reading again under lock",
                self.log_prefix()
            );
        }

        let _lock = self.lock(&dir)?;
        let scan = Scan::load(&dir)?;
        Ok((dir, scan))
    }

    /// Run `f` against the current state.
    ///
    /// Like `read()`, but `f` may also report that a file moved while it
    /// was loading content, in which case everything is repeated under the
    /// lock. The last argument to `f` is whether the lock is held.
    fn read_content<R>(
        &self,
        f: impl Fn(&Path, &Scan, bool) -> Result<Fetched<R>, Error>,
    ) -> Result<R, Error> {
        let (dir, scan) = self.read()?;
        if let Fetched::Done(r) = f(&dir, &scan, false)? {
            return Ok(r);
        }

        debug!(
            "{} Message file moved while reading; reading again under lock",
            self.log_prefix()
        );
        let _lock = self.lock(&dir)?;
        let scan = Scan::load(&dir)?;
        match f(&dir, &scan, true)? {
            Fetched::Done(r) => Ok(r),
            // Not returned while the lock is held
            Fetched::Moved => {
                Err(io::Error::from(io::ErrorKind::NotFound).into())
            }
        }
    }

    /// Run `f` on the current state while holding the lock.
    ///
    /// If `f` returns `Write::Commit`, the `uidlist` (with its modseq
    /// advanced) and `keywords` files are written back and views are
    /// notified once the lock is released.
    fn write<R>(
        &self,
        f: impl FnOnce(&Path, &mut Scan) -> Result<Write<R>, Error>,
    ) -> Result<R, Error> {
        let dir = self.dir()?;
        let lock = self.lock(&dir)?;
        let mut scan = Scan::load(&dir)?;

        match f(&dir, &mut scan)? {
            Write::NoChanges(r) => Ok(r),
            Write::Commit(r) => {
                lock.refresh()?;
                scan.save_keywords(&dir)?;
                scan.uid_list.modseq += 1;
                file_ops::spit(
                    dir.join(TMP),
                    dir.join(UIDLIST),
                    true,
                    0o600,
                    scan.uid_list.to_string().as_bytes(),
                )?;
                drop(lock);
                self.notify();
                Ok(r)
            }
        }
    }
}

impl MailboxData for MaildirMailbox {
    fn name(&self) -> String {
        self.location.read().name.clone()
    }

    fn mailbox_id(&self) -> &str {
        &self.id
    }

    fn uid_validity(&self) -> Result<u32, Error> {
        Ok(self.read()?.1.uid_list.uid_validity)
    }

    fn next_uid(&self) -> Result<Uid, Error> {
        Ok(self.read()?.1.uid_list.next_uid)
    }

    fn permanent_flags(&self) -> Result<PermanentFlags, Error> {
        Ok(self.read()?.1.keywords.permanent_flags())
    }

    fn add(
        &self,
        message: &AppendMessage,
        recent: bool,
    ) -> Result<Message, Error> {
        let dir = self.dir()?;
        let mut staged = tempfile::NamedTempFile::new_in(dir.join(TMP))
            .on_not_found(Error::MailboxNotFound { try_create: false })?;
        staged.as_file_mut().write_all(&message.data)?;
        staged.as_file_mut().sync_all()?;

        let requested: FlagSet = message.flags.iter().cloned().collect();
        let mut stored = Message::for_append(
            Uid::MIN,
            message,
            FlagSet::new(),
            recent,
            0,
        );
        let basename = super::unique_basename();

        let stored = self.write(move |dir, scan| {
            scan.intern(&requested);
            scan.save_keywords(dir)?;
            let flags = scan.keywords.permanent_flags().filter(&requested);
            let info = scan.keywords.to_info(&flags);
            stored.flags = scan.keywords.from_info(&info);

            let record = scan.uid_list.push(basename.clone())?;
            record.set_field('W', stored.size);
            record.set_field('D', stored.internal_date.timestamp());
            record.set_field('E', &stored.email_id);
            record.set_field('H', &stored.thread_id);
            stored.uid = record.uid;

            let subdir = if recent { Subdir::New } else { Subdir::Cur };
            let path = dir
                .join(subdir.name())
                .join(format!("{}{}{}", basename, INFO_PREFIX, info));
            staged.persist_noclobber(&path).map_err(|e| e.error)?;
            stored.modseq = stamp(&fs::metadata(&path)?);

            Ok(Write::Commit(stored))
        })?;

        debug!("{} Added {}", self.log_prefix(), stored.uid);
        Ok(stored)
    }

    fn get(
        &self,
        uid: Uid,
        hint: Option<&Message>,
        requirement: FetchRequirement,
    ) -> Result<Option<Message>, Error> {
        let message = self.read_content(|dir, scan, locked| {
            if uid >= scan.uid_list.next_uid {
                return Err(Error::InvalidUid);
            }
            scan.message(dir, uid, requirement, locked)
        })?;

        Ok(message.or_else(|| hint.map(Message::tombstone)))
    }

    fn messages(
        &self,
        requirement: FetchRequirement,
    ) -> Result<Vec<Message>, Error> {
        self.read_content(|dir, scan, locked| {
            scan.messages(dir, requirement, locked)
        })
    }

    fn delete(&self, uids: &[Uid]) -> Result<Vec<Uid>, Error> {
        let targets: HashSet<Uid> = uids.iter().copied().collect();
        let (removed, doomed) = self.write(|dir, scan| {
            let mut removed = Vec::new();
            let mut doomed = Vec::new();
            let files = &scan.files;
            scan.uid_list.records.retain(|record| {
                if !targets.contains(&record.uid) {
                    return true;
                }

                removed.push(record.uid);
                if let Some(file) = files.get(&record.basename) {
                    doomed.push(file.path(dir));
                }
                false
            });

            Ok(if removed.is_empty() {
                Write::NoChanges((removed, doomed))
            } else {
                Write::Commit((removed, doomed))
            })
        })?;

        // The records are gone, so the files are orphans now. If this fails
        // cleanup() will get them later.
        for path in doomed {
            if let Err(e) = fs::remove_file(&path).ignore_not_found() {
                warn!(
                    "{} Failed to remove {}: {}",
                    self.log_prefix(),
                    path.display(),
                    e
                );
            }
        }

        Ok(removed)
    }

    fn update_flags(
        &self,
        uids: &[Uid],
        flags: &FlagSet,
        mode: FlagMode,
    ) -> Result<Vec<Message>, Error> {
        self.write(|dir, scan| {
            let targets: BTreeSet<Uid> = uids
                .iter()
                .copied()
                .filter(|&uid| {
                    scan.uid_list
                        .find(uid)
                        .map_or(false, |r| scan.files.contains_key(&r.basename))
                })
                .collect();
            if targets.is_empty() {
                return Ok(Write::NoChanges(Vec::new()));
            }

            if !matches!(mode, FlagMode::Remove) {
                scan.intern(flags);
                scan.save_keywords(dir)?;
            }
            let permanent = scan.keywords.permanent_flags();

            let Scan {
                ref uid_list,
                ref keywords,
                ref mut files,
                ..
            } = *scan;
            let mut updated = Vec::with_capacity(targets.len());
            for uid in targets {
                let record = match uid_list.find(uid) {
                    Some(record) => record,
                    None => continue,
                };
                let file = match files.get_mut(&record.basename) {
                    Some(file) => file,
                    None => continue,
                };

                let mut current = keywords.from_info(&file.info);
                crate::store::apply_flags(
                    &mut current,
                    flags,
                    mode,
                    &permanent,
                );
                let subdir = file.subdir;
                file.move_to(
                    dir,
                    &record.basename,
                    subdir,
                    keywords.to_info(&current),
                )?;
                updated.push(build(record, file, keywords));
            }

            Ok(Write::Commit(updated))
        })
    }

    fn claim_recent(
        &self,
        selected: &mut SelectedMailbox,
    ) -> Result<Vec<Uid>, Error> {
        let claimed = self.write(|dir, scan| {
            let Scan {
                ref uid_list,
                ref mut files,
                ..
            } = *scan;

            let mut claimed = Vec::new();
            for record in &uid_list.records {
                if let Some(file) = files.get_mut(&record.basename) {
                    if Subdir::New == file.subdir {
                        let info = file.info.clone();
                        file.move_to(dir, &record.basename, Subdir::Cur, info)?;
                        claimed.push(record.uid);
                    }
                }
            }

            Ok(if claimed.is_empty() {
                Write::NoChanges(claimed)
            } else {
                Write::Commit(claimed)
            })
        })?;

        selected.mark_recent(claimed.iter().copied());
        Ok(claimed)
    }

    /// Remove stale files from `tmp/`, files in `cur/` and `new/` which no
    /// `uidlist` record refers to, and records whose file has vanished.
    ///
    /// Unreferenced files are never imported, since a file `delete()` has
    /// just dropped the record of is indistinguishable from a new one.
    fn cleanup(&self) -> Result<(), Error> {
        let dir = self.dir()?;
        let prefix = self.log_prefix();
        let now = SystemTime::now();

        let entries = fs::read_dir(dir.join(TMP))
            .on_not_found(Error::MailboxNotFound { try_create: false })?;
        for entry in entries {
            let entry = entry?;
            let stale = entry
                .metadata()
                .and_then(|md| md.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .map_or(false, |age| age > TMP_STALE);
            if stale {
                info!(
                    "{} Removing stale temporary file {:?}",
                    prefix,
                    entry.file_name()
                );
                if let Err(e) = fs::remove_file(entry.path()).ignore_not_found()
                {
                    warn!("{} Failed to remove temporary file: {}", prefix, e);
                }
            }
        }

        self.write(|dir, scan| {
            let referenced: HashSet<&str> = scan
                .uid_list
                .records
                .iter()
                .map(|r| r.basename.as_str())
                .collect();
            for (basename, file) in &scan.files {
                if !referenced.contains(basename.as_str()) {
                    info!(
                        "{} Removing orphaned file {}",
                        prefix, file.filename
                    );
                    if let Err(e) =
                        fs::remove_file(file.path(dir)).ignore_not_found()
                    {
                        warn!("{} Failed to remove orphan: {}", prefix, e);
                    }
                }
            }

            let files = &scan.files;
            let before = scan.uid_list.records.len();
            scan.uid_list.records.retain(|r| files.contains_key(&r.basename));
            let lost = before - scan.uid_list.records.len();

            Ok(if 0 == lost {
                Write::NoChanges(())
            } else {
                warn!("{} {} messages lost their files", prefix, lost);
                Write::Commit(())
            })
        })
    }

    fn update_selected(
        &self,
        selected: &mut SelectedMailbox,
    ) -> Result<(), Error> {
        let (_, scan) = self.read()?;
        let messages = scan.metadata();

        selected.set_name(self.name());
        selected.set_permanent_flags(scan.keywords.permanent_flags());
        selected.apply(
            Changes::Full(messages),
            Modseq::of(scan.uid_list.modseq),
        );
        Ok(())
    }

    fn snapshot(&self) -> Result<MailboxSnapshot, Error> {
        let (_, scan) = self.read()?;
        let messages = scan.metadata();
        Ok(MailboxSnapshot::scan(
            &messages,
            scan.uid_list.next_uid,
            scan.uid_list.uid_validity,
            Modseq::of(scan.uid_list.modseq),
        ))
    }

    fn select(&self, readonly: bool) -> Result<SelectedMailbox, Error> {
        let (_, scan) = self.read()?;
        let handle = lock(&self.views).register();
        Ok(SelectedMailbox::new(
            handle,
            self.id.clone(),
            self.name(),
            readonly,
            scan.keywords.permanent_flags(),
            scan.uid_list.uid_validity,
        ))
    }

    fn deselect(&self, handle: ViewHandle) {
        lock(&self.views).deregister(handle);
    }

    fn wake_event(&self, handle: ViewHandle) -> Option<Event> {
        lock(&self.views).wake_event(handle)
    }
}
