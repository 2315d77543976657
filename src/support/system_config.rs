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

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::support::error::Error;

/// The configuration for a mail store.
///
/// This is stored in a file named `mailstore.toml`, typically under
/// `/etc/mailstore` or `/usr/local/etc/mailstore`.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct StoreConfig {
    /// Which storage engine holds the mail.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Tuning for the advisory file locks used by the maildir backend.
    #[serde(default)]
    pub locking: LockingConfig,

    /// Tuning for the optimistic transactions of the `kv` backend.
    #[serde(default)]
    pub kv: KvConfig,
}

impl StoreConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read(path)?;
        Ok(toml::from_slice(&data)?)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Everything is kept in process memory and lost on exit.
    Memory,
    /// Maildirs with a sidecar UID index under `root/<user>`.
    Maildir { root: PathBuf },
    /// A key-value store with `WATCH`/`MULTI`/`EXEC` semantics.
    ///
    /// If `url` is unset, an in-process store is used, which is mostly useful
    /// for testing. Otherwise, `url` is a `redis://` URL, which requires the
    /// `redis-backend` feature.
    Kv {
        #[serde(default)]
        url: Option<String>,
        /// Prefix for every key this store writes.
        #[serde(default = "default_namespace")]
        namespace: String,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Memory
    }
}

fn default_namespace() -> String {
    "mailstore".to_owned()
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockingConfig {
    /// A lock file older than this many seconds is assumed to have been
    /// abandoned by a dead process and is removed.
    pub stale_after_secs: u64,
    /// How long to sleep between attempts to take a held lock.
    pub poll_interval_ms: u64,
    /// How many attempts to make before failing with a lock timeout.
    pub max_attempts: u32,
}

impl Default for LockingConfig {
    fn default() -> Self {
        LockingConfig {
            stale_after_secs: 30,
            poll_interval_ms: 10,
            max_attempts: 500,
        }
    }
}

impl LockingConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct KvConfig {
    /// How many times a transaction which collided with a concurrent writer
    /// is retried before failing with a lock timeout. Retries are immediate.
    pub max_retries: u32,
}

impl Default for KvConfig {
    fn default() -> Self {
        KvConfig { max_retries: 64 }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_full_config() {
        let config: StoreConfig = toml::from_str(
            r#"
[backend]
kind = "maildir"
root = "/var/mail"

[locking]
stale_after_secs = 5
max_attempts = 7

[kv]
max_retries = 3
"#,
        )
        .unwrap();

        assert_eq!(
            BackendConfig::Maildir {
                root: "/var/mail".into()
            },
            config.backend
        );
        assert_eq!(5, config.locking.stale_after_secs);
        assert_eq!(10, config.locking.poll_interval_ms);
        assert_eq!(7, config.locking.max_attempts);
        assert_eq!(3, config.kv.max_retries);
    }

    #[test]
    fn parse_minimal_config() {
        let config: StoreConfig = toml::from_str("").unwrap();
        assert_eq!(BackendConfig::Memory, config.backend);
        assert_eq!(LockingConfig::default(), config.locking);
        assert_eq!(64, config.kv.max_retries);

        let config: StoreConfig =
            toml::from_str("[backend]\nkind = \"kv\"\n").unwrap();
        assert_eq!(
            BackendConfig::Kv {
                url: None,
                namespace: "mailstore".to_owned(),
            },
            config.backend
        );
    }
}
