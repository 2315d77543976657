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

//! The maildir engine.
//!
//! Each user has a directory under the configured root:
//!
//! ```text
//! <root>/<user>/
//!   mail/                     The mailbox hierarchy
//!     INBOX/
//!       %/                    The maildir proper of INBOX
//!         cur/ new/ tmp/
//!         uidlist keywords lock
//!       Child/%/...           INBOX/Child
//!   subscriptions             One mailbox name per line
//!   subscriptions.lock
//!   tmp/                      Staging for new mailboxes and subscriptions
//!   garbage/                  Trees awaiting asynchronous deletion
//! ```
//!
//! `%` cannot appear in a mailbox name, so the maildir of a mailbox never
//! collides with its children. A new maildir is built in `tmp/` and renamed
//! into place, so a `%` directory which exists always has a `uidlist`.
//!
//! Deleting a mailbox moves its directory into `garbage/`; renaming moves the
//! whole subtree with one `rename()`. Either operation racing with another
//! process simply makes that process's next access to the old location fail
//! with `MailboxNotFound`.
//!
//! The maildirs are private to this engine. Only files with a `uidlist`
//! record are messages, and `cleanup()` deletes anything else it finds in
//! `cur/` or `new/`. Mail must therefore be delivered through the engine
//! (e.g., `mailstore append`), never by dropping files into `new/`.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use log::{info, warn};

mod keywords;
mod mailbox;
mod uid_list;

pub use self::mailbox::MaildirMailbox;

use self::uid_list::UidList;
use super::mailbox_name::{self, DELIMITER, INBOX};
use super::{MailboxData, MailboxSet};
use crate::support::error::Error;
use crate::support::file_lock::FileLock;
use crate::support::file_ops::{self, ErrorTransforms, IgnoreKinds};
use crate::support::sync::Guarded;
use crate::support::system_config::LockingConfig;

const MAIL: &str = "mail";
const MAILDIR: &str = "%";
const GARBAGE: &str = "garbage";
const TMP: &str = "tmp";
const UIDLIST: &str = "uidlist";
const KEYWORDS: &str = "keywords";
const LOCK: &str = "lock";
const SUBSCRIPTIONS: &str = "subscriptions";
const SUBSCRIPTIONS_LOCK: &str = "subscriptions.lock";

/// Staging directories older than this are assumed abandoned.
const STAGING_STALE: Duration = Duration::from_secs(36 * 3600);

lazy_static! {
    static ref HOSTNAME: String = {
        let mut buf = [0u8; 256];
        let name = nix::unistd::gethostname(&mut buf)
            .map(|cstr| cstr.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_owned());
        name.replace('/', "\\057").replace(':', "\\072")
    };
}

static SEQUENCE: AtomicUsize = AtomicUsize::new(0);

/// Generate a maildir basename unique across processes and hosts.
fn unique_basename() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!(
        "{}.M{}P{}Q{}.{}",
        now.as_secs(),
        now.subsec_micros(),
        nix::unistd::getpid(),
        SEQUENCE.fetch_add(1, Ordering::Relaxed),
        *HOSTNAME
    )
}

/// The mailboxes of one user, stored as maildirs.
#[derive(Debug)]
pub struct MaildirMailboxSet {
    user: String,
    root: PathBuf,
    locking: LockingConfig,
    /// Instances handed out so far, by mailbox id.
    mailboxes: Guarded<HashMap<String, Arc<MaildirMailbox>>>,
}

impl MaildirMailboxSet {
    /// Open the mail of `user` under `root`, creating the directory
    /// structure if needed.
    pub fn open(
        root: &Path,
        user: &str,
        locking: LockingConfig,
    ) -> Result<Self, Error> {
        if !mailbox_name::is_safe_segment(user) {
            return Err(Error::UnsafeName);
        }

        let root = root.join(user);
        for sub in &[MAIL, TMP, GARBAGE] {
            fs::create_dir_all(root.join(sub))?;
        }

        Ok(MaildirMailboxSet {
            user: user.to_owned(),
            root,
            locking,
            mailboxes: Guarded::new(HashMap::new()),
        })
    }

    fn mail_dir(&self, name: &str) -> PathBuf {
        let mut path = self.root.join(MAIL);
        path.extend(name.split(DELIMITER));
        path
    }

    fn maildir(&self, name: &str) -> PathBuf {
        self.mail_dir(name).join(MAILDIR)
    }

    fn exists(&self, name: &str) -> bool {
        self.maildir(name).join(UIDLIST).is_file()
    }

    /// Create an empty maildir for `name`, whose parent must exist.
    ///
    /// Fails with `MailboxConflict` if there already is one.
    fn create_one(&self, name: &str) -> Result<(), Error> {
        fs::create_dir_all(self.mail_dir(name))?;

        let staging = tempfile::TempDir::new_in(self.root.join(TMP))?;
        for sub in &["cur", "new", TMP] {
            fs::create_dir(staging.path().join(sub))?;
        }
        let uid_list =
            UidList::new(super::new_uid_validity(), super::new_mailbox_id());
        fs::write(staging.path().join(UIDLIST), uid_list.to_string())?;

        fs::rename(staging.path(), self.maildir(name))
            .on_exists(Error::MailboxConflict)?;
        // The directory has a new owner now
        let _ = staging.into_path();

        info!("{} Created mailbox {} ({})", self.user, name, uid_list.guid);
        Ok(())
    }

    fn create_if_missing(&self, name: &str) -> Result<(), Error> {
        if self.exists(name) {
            return Ok(());
        }

        match self.create_one(name) {
            Ok(()) | Err(Error::MailboxConflict) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Return the shared instance for the mailbox currently at `name`.
    fn open_mailbox(&self, name: &str) -> Result<Arc<MaildirMailbox>, Error> {
        let dir = self.maildir(name);
        let data = file_ops::slurp_opt(dir.join(UIDLIST))?
            .ok_or(Error::MailboxNotFound { try_create: false })?;
        let guid = UidList::parse(&String::from_utf8_lossy(&data))?.guid;

        let mut mailboxes = self.mailboxes.write();
        let mailbox = mailboxes.entry(guid.clone()).or_insert_with(|| {
            Arc::new(MaildirMailbox::new(
                guid,
                &self.user,
                name.to_owned(),
                dir.clone(),
                self.locking,
            ))
        });
        // Another process may have renamed it
        mailbox.relocate(name.to_owned(), dir);
        Ok(Arc::clone(mailbox))
    }

    fn read_subscriptions(&self) -> Result<BTreeSet<String>, Error> {
        Ok(file_ops::slurp_opt(self.root.join(SUBSCRIPTIONS))?
            .map(|data| {
                String::from_utf8_lossy(&data)
                    .lines()
                    .filter(|l| !l.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Remove `path`, whatever it is, logging failures.
    fn remove_tree(&self, path: &Path) {
        let result = if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };

        if let Err(e) = result.ignore_not_found() {
            warn!("{} Failed to remove {}: {}", self.user, path.display(), e);
        }
    }
}

/// Add the names of all mailboxes beneath `dir` to `out`.
fn walk(
    dir: &Path,
    prefix: Option<&str>,
    out: &mut Vec<String>,
) -> Result<(), Error> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        // Concurrently deleted
        Err(e) if io::ErrorKind::NotFound == e.kind() => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let segment = match entry.file_name().into_string() {
            Ok(s) if mailbox_name::is_safe_segment(&s) => s,
            _ => continue,
        };
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let name = match prefix {
            Some(prefix) => format!("{}{}{}", prefix, DELIMITER, segment),
            None => segment,
        };
        let path = entry.path();
        if path.join(MAILDIR).join(UIDLIST).is_file() {
            out.push(name.clone());
        }
        walk(&path, Some(&name), out)?;
    }

    Ok(())
}

impl MailboxSet for MaildirMailboxSet {
    fn user(&self) -> &str {
        &self.user
    }

    fn get_mailbox(
        &self,
        name: &str,
        try_create: bool,
    ) -> Result<Arc<dyn MailboxData>, Error> {
        let name = mailbox_name::normalise(name)?;
        if mailbox_name::is_inbox(&name) {
            self.create_if_missing(&name)?;
        }

        match self.open_mailbox(&name) {
            Ok(mailbox) => Ok(mailbox),
            Err(Error::MailboxNotFound { .. }) => {
                Err(Error::MailboxNotFound { try_create })
            }
            Err(e) => Err(e),
        }
    }

    fn add_mailbox(&self, name: &str) -> Result<Arc<dyn MailboxData>, Error> {
        let name = mailbox_name::normalise(name)?;
        if self.exists(&name) {
            return Err(Error::MailboxConflict);
        }

        for ancestor in mailbox_name::ancestors(&name) {
            self.create_if_missing(ancestor)?;
        }
        self.create_one(&name)?;
        Ok(self.open_mailbox(&name)?)
    }

    fn delete_mailbox(&self, name: &str) -> Result<(), Error> {
        let name = mailbox_name::normalise(name)?;
        if mailbox_name::is_inbox(&name) {
            return Err(Error::BadOperationOnInbox);
        }
        if !self.exists(&name) {
            return Err(Error::MailboxNotFound { try_create: false });
        }

        let mail_dir = self.mail_dir(&name);
        for entry in fs::read_dir(&mail_dir)? {
            let entry = entry?;
            if entry.file_name() != MAILDIR && entry.file_type()?.is_dir() {
                return Err(Error::MailboxHasChildren);
            }
        }

        let doomed = self.open_mailbox(&name)?;
        file_ops::delete_async(&mail_dir, self.root.join(GARBAGE))
            .on_not_found(Error::MailboxNotFound { try_create: false })?;

        self.mailboxes.write().remove(doomed.mailbox_id());
        doomed.mark_deleted();
        info!(
            "{} Deleted mailbox {} ({})",
            self.user,
            name,
            doomed.mailbox_id()
        );
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
            self.create_if_missing(&before)?;
        }
        if !self.exists(&before) {
            return Err(Error::MailboxNotFound { try_create: false });
        }
        if self.exists(&after) {
            return Err(Error::MailboxConflict);
        }

        for ancestor in mailbox_name::ancestors(&after) {
            self.create_if_missing(ancestor)?;
        }

        if renaming_inbox {
            fs::create_dir_all(self.mail_dir(&after))?;
            fs::rename(self.maildir(&before), self.maildir(&after))
                .on_exists(Error::MailboxConflict)
                .on_not_found(Error::MailboxNotFound { try_create: false })?;
            self.create_if_missing(&before)?;
        } else {
            fs::rename(self.mail_dir(&before), self.mail_dir(&after))
                .on_exists(Error::MailboxConflict)
                .on_not_found(Error::MailboxNotFound { try_create: false })?;
        }

        for mailbox in self.mailboxes.read().values() {
            let name = mailbox.name();
            let new_name = if renaming_inbox {
                Some(after.clone()).filter(|_| name == before)
            } else {
                mailbox_name::rebase(&name, &before, &after)
            };

            if let Some(new_name) = new_name {
                let dir = self.maildir(&new_name);
                mailbox.relocate(new_name, dir);
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
        let _lock = FileLock::acquire(
            self.root.join(SUBSCRIPTIONS_LOCK),
            &self.locking,
        )?;

        let mut subscriptions = self.read_subscriptions()?;
        let changed = if subscribed {
            subscriptions.insert(name)
        } else {
            subscriptions.remove(&name)
        };

        if changed {
            let mut data = String::new();
            for name in &subscriptions {
                data.push_str(name);
                data.push('\n');
            }
            file_ops::spit(
                self.root.join(TMP),
                self.root.join(SUBSCRIPTIONS),
                true,
                0o600,
                data.as_bytes(),
            )?;
        }

        Ok(())
    }

    fn list_subscribed(&self) -> Result<Vec<String>, Error> {
        let lock_path = self.root.join(SUBSCRIPTIONS_LOCK);
        let _lock = if FileLock::is_held(&lock_path) {
            Some(FileLock::acquire(lock_path, &self.locking)?)
        } else {
            None
        };

        Ok(self.read_subscriptions()?.into_iter().collect())
    }

    fn list_mailboxes(&self) -> Result<Vec<String>, Error> {
        self.create_if_missing(INBOX)?;

        let mut names = Vec::new();
        walk(&self.root.join(MAIL), None, &mut names)?;
        names.sort();
        Ok(names)
    }

    fn cleanup(&self) -> Result<(), Error> {
        for entry in fs::read_dir(self.root.join(GARBAGE))? {
            let path = entry?.path();
            info!(
                "{} Removing leftover garbage {}",
                self.user,
                path.display()
            );
            self.remove_tree(&path);
        }

        let now = SystemTime::now();
        for entry in fs::read_dir(self.root.join(TMP))? {
            let entry = entry?;
            let stale = entry
                .metadata()
                .and_then(|md| md.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .map_or(false, |age| age > STAGING_STALE);
            if stale {
                self.remove_tree(&entry.path());
            }
        }

        for name in self.list_mailboxes()? {
            match self.get_mailbox(&name, false) {
                Ok(mailbox) => mailbox.cleanup()?,
                Err(Error::MailboxNotFound { .. }) => (),
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}
