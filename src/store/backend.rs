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

//! Resolution of the configured engine to per-user mailbox sets.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use super::kv::{KvMailboxSet, KvStore, MemoryKv};
use super::maildir::MaildirMailboxSet;
use super::memory::MemoryMailboxSet;
use super::MailboxSet;
use crate::support::error::Error;
use crate::support::sync::Guarded;
use crate::support::system_config::{
    BackendConfig, KvConfig, LockingConfig, StoreConfig,
};

#[derive(Debug)]
enum Engine {
    Memory,
    Maildir {
        root: PathBuf,
        locking: LockingConfig,
    },
    Kv {
        store: Arc<dyn KvStore>,
        namespace: String,
        config: KvConfig,
    },
}

/// The configured storage engine and the mailbox sets opened through it.
///
/// Every session of one user gets the same `MailboxSet`, which is what lets
/// the engines notify sessions of each other's changes without going through
/// storage.
pub struct Backend {
    engine: Engine,
    users: Guarded<HashMap<String, Arc<dyn MailboxSet>>>,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Backend({})", self.kind())
    }
}

impl Backend {
    pub fn new(config: &StoreConfig) -> Result<Self, Error> {
        let engine = match config.backend {
            BackendConfig::Memory => Engine::Memory,
            BackendConfig::Maildir { ref root } => Engine::Maildir {
                root: root.clone(),
                locking: config.locking,
            },
            BackendConfig::Kv {
                ref url,
                ref namespace,
            } => Engine::Kv {
                store: open_kv(url.as_deref())?,
                namespace: namespace.clone(),
                config: config.kv,
            },
        };

        Ok(Backend {
            engine,
            users: Guarded::new(HashMap::new()),
        })
    }

    /// Return the mailbox set of `user`, opening it if this is the first
    /// reference.
    pub fn open_user(&self, user: &str) -> Result<Arc<dyn MailboxSet>, Error> {
        if let Some(set) = self.users.read().get(user) {
            return Ok(Arc::clone(set));
        }

        let mut users = self.users.write();
        if let Some(set) = users.get(user) {
            return Ok(Arc::clone(set));
        }

        let set: Arc<dyn MailboxSet> = match self.engine {
            Engine::Memory => Arc::new(MemoryMailboxSet::new(user)),
            Engine::Maildir { ref root, locking } => Arc::new(
                MaildirMailboxSet::open(root, user, locking)?,
            ),
            Engine::Kv {
                ref store,
                ref namespace,
                config,
            } => Arc::new(KvMailboxSet::new(
                Arc::clone(store),
                namespace,
                user,
                config,
            )?),
        };

        info!("{} Opened mailbox set ({})", user, self.kind());
        users.insert(user.to_owned(), Arc::clone(&set));
        Ok(set)
    }

    /// The name of the engine, as used in the configuration.
    pub fn kind(&self) -> &'static str {
        match self.engine {
            Engine::Memory => "memory",
            Engine::Maildir { .. } => "maildir",
            Engine::Kv { .. } => "kv",
        }
    }
}

#[cfg(feature = "redis-backend")]
fn open_kv(url: Option<&str>) -> Result<Arc<dyn KvStore>, Error> {
    match url {
        None => Ok(Arc::new(MemoryKv::new())),
        Some(url) => Ok(Arc::new(super::kv::RedisKv::open(url)?)),
    }
}

#[cfg(not(feature = "redis-backend"))]
fn open_kv(url: Option<&str>) -> Result<Arc<dyn KvStore>, Error> {
    match url {
        None => Ok(Arc::new(MemoryKv::new())),
        Some(_) => Err(Error::Unsupported(
            "kv backend URLs require the redis-backend feature".to_owned(),
        )),
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn sets_are_shared_per_user() {
        let backend = Backend::new(&StoreConfig::default()).unwrap();
        assert_eq!("memory", backend.kind());

        let a = backend.open_user("alice").unwrap();
        let b = backend.open_user("alice").unwrap();
        let c = backend.open_user("bob").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        a.add_mailbox("Shared").unwrap();
        assert!(b.get_mailbox("Shared", false).is_ok());
        assert!(c.get_mailbox("Shared", false).is_err());
    }

    #[test]
    fn maildir_backend() {
        let root = TempDir::new().unwrap();
        let config = StoreConfig {
            backend: BackendConfig::Maildir {
                root: root.path().to_owned(),
            },
            ..StoreConfig::default()
        };
        let backend = Backend::new(&config).unwrap();
        assert_eq!("maildir", backend.kind());

        let set = backend.open_user("alice").unwrap();
        set.add_mailbox("Archive").unwrap();
        assert!(root.path().join("alice/mail/Archive").is_dir());

        assert_matches!(Err(Error::UnsafeName), backend.open_user("../x"));
    }

    #[test]
    fn kv_backend() {
        let config = StoreConfig {
            backend: BackendConfig::Kv {
                url: None,
                namespace: "ns".to_owned(),
            },
            ..StoreConfig::default()
        };
        let backend = Backend::new(&config).unwrap();
        assert_eq!("kv", backend.kind());

        let set = backend.open_user("alice").unwrap();
        assert_eq!(vec!["INBOX"], set.list_mailboxes().unwrap());
    }

    #[cfg(not(feature = "redis-backend"))]
    #[test]
    fn kv_url_needs_feature() {
        let config = StoreConfig {
            backend: BackendConfig::Kv {
                url: Some("redis://localhost/".to_owned()),
                namespace: "ns".to_owned(),
            },
            ..StoreConfig::default()
        };
        assert_matches!(Err(Error::Unsupported(_)), Backend::new(&config));
    }
}
