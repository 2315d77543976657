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

//! In-process concurrency primitives shared by the storage engines.
//!
//! `Guarded` owns the state it protects; the only way to reach the state is
//! through one of its guards. Lock poisoning is not propagated: a panicking
//! writer can at worst leave the state half-updated, which every user of this
//! type already has to tolerate since none of the engines roll back.
//!
//! `Event` is a one-shot signal. Once signalled it stays signalled, and every
//! waiter (current or future) observes it. `wait_any` waits on several events
//! at once, which is how a session idles on more than one mailbox.
//!
//! Events are channels nothing is ever sent on. Signalling drops the only
//! sender, which disconnects the channel and wakes every receiver.

use std::sync::{
    Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Select, Sender, TryRecvError};

/// A value protected by a many-readers/one-writer lock.
#[derive(Debug, Default)]
pub struct Guarded<T> {
    lock: RwLock<T>,
}

impl<T> Guarded<T> {
    pub fn new(value: T) -> Self {
        Guarded {
            lock: RwLock::new(value),
        }
    }

    /// Obtain shared access. Concurrent readers do not block each other.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        match self.lock.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Obtain exclusive access.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        match self.lock.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Lock a plain mutex, ignoring poisoning.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A one-shot, clonable signal.
///
/// Clones share the same underlying state.
#[derive(Clone, Debug)]
pub struct Event {
    sender: Arc<Mutex<Option<Sender<()>>>>,
    receiver: Receiver<()>,
}

impl Default for Event {
    fn default() -> Self {
        let (sender, receiver) = channel::bounded(0);
        Event {
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
        }
    }
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal this event, waking everything waiting on it.
    ///
    /// Signalling an already-signalled event has no effect.
    pub fn signal(&self) {
        lock(&self.sender).take();
    }

    pub fn is_signalled(&self) -> bool {
        matches!(self.receiver.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Block until this event is signalled or `timeout` elapses.
    ///
    /// Returns whether the event was signalled.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        wait_any(std::slice::from_ref(self), timeout).is_some()
    }
}

/// Block until any of `events` is signalled or `timeout` elapses.
///
/// Returns the index of an event that was signalled, or `None` on timeout.
/// With no events and no timeout, this returns `None` immediately rather than
/// blocking forever.
pub fn wait_any(events: &[Event], timeout: Option<Duration>) -> Option<usize> {
    if events.is_empty() {
        if let Some(timeout) = timeout {
            std::thread::sleep(timeout);
        }
        return None;
    }

    let mut select = Select::new();
    for event in events {
        select.recv(&event.receiver);
    }

    let op = match timeout {
        None => select.select(),
        Some(timeout) => select.select_timeout(timeout).ok()?,
    };
    let ix = op.index();
    // Nothing is ever sent, so this can only observe the disconnect
    let _ = op.recv(&events[ix].receiver);
    Some(ix)
}
