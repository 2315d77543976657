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

//! An in-process key-value store with Redis transaction semantics.
//!
//! Every key carries a version which changes whenever anything writes to it,
//! including deletion. `WATCH` remembers the versions of the watched keys and
//! `EXEC` refuses to apply anything if any of them moved.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::{KvConnection, KvStore, Op};
use crate::support::error::Error;
use crate::support::sync::Guarded;

#[derive(Clone, Debug, Default)]
pub struct MemoryKv {
    state: Arc<Guarded<KvState>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        MemoryKv::default()
    }
}

#[derive(Debug, Default)]
struct KvState {
    values: HashMap<String, Value>,
    versions: HashMap<String, u64>,
    clock: u64,
}

#[derive(Clone, Debug)]
enum Value {
    Bytes(Vec<u8>),
    Hash(BTreeMap<String, Vec<u8>>),
    Sorted(HashMap<String, u64>),
}

fn wrong_type(key: &str) -> Error {
    Error::CorruptIndex(format!("{} holds the wrong kind of value", key))
}

impl KvState {
    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn touch(&mut self, key: &str) {
        self.clock += 1;
        self.versions.insert(key.to_owned(), self.clock);
    }

    fn hash_mut(
        &mut self,
        key: &str,
    ) -> Result<&mut BTreeMap<String, Vec<u8>>, Error> {
        match self
            .values
            .entry(key.to_owned())
            .or_insert_with(|| Value::Hash(BTreeMap::new()))
        {
            Value::Hash(hash) => Ok(hash),
            _ => Err(wrong_type(key)),
        }
    }

    fn sorted_mut(
        &mut self,
        key: &str,
    ) -> Result<&mut HashMap<String, u64>, Error> {
        match self
            .values
            .entry(key.to_owned())
            .or_insert_with(|| Value::Sorted(HashMap::new()))
        {
            Value::Sorted(set) => Ok(set),
            _ => Err(wrong_type(key)),
        }
    }

    /// Drop `key` if it is an empty collection, as Redis does.
    fn prune(&mut self, key: &str) {
        let empty = match self.values.get(key) {
            Some(Value::Hash(hash)) => hash.is_empty(),
            Some(Value::Sorted(set)) => set.is_empty(),
            _ => false,
        };
        if empty {
            self.values.remove(key);
        }
    }

    fn apply(&mut self, op: &Op) -> Result<(), Error> {
        let key = op.key();
        match *op {
            Op::Set(_, ref value) => {
                self.values
                    .insert(key.to_owned(), Value::Bytes(value.clone()));
            }
            Op::Del(_) => {
                self.values.remove(key);
            }
            Op::HSet(_, ref field, ref value) => {
                self.hash_mut(key)?.insert(field.clone(), value.clone());
            }
            Op::HDel(_, ref field) => {
                self.hash_mut(key)?.remove(field);
            }
            Op::ZAdd(_, ref member, score) => {
                self.sorted_mut(key)?.insert(member.clone(), score);
            }
            Op::ZRem(_, ref member) => {
                self.sorted_mut(key)?.remove(member);
            }
        }

        self.prune(key);
        self.touch(key);
        Ok(())
    }
}

impl KvStore for MemoryKv {
    fn connect(&self) -> Result<Box<dyn KvConnection>, Error> {
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            watched: HashMap::new(),
        }))
    }
}

#[derive(Debug)]
struct MemoryConnection {
    state: Arc<Guarded<KvState>>,
    watched: HashMap<String, u64>,
}

impl KvConnection for MemoryConnection {
    fn watch(&mut self, keys: &[String]) -> Result<(), Error> {
        let state = self.state.read();
        for key in keys {
            self.watched
                .entry(key.clone())
                .or_insert_with(|| state.version(key));
        }
        Ok(())
    }

    fn unwatch(&mut self) -> Result<(), Error> {
        self.watched.clear();
        Ok(())
    }

    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        match self.state.read().values.get(key) {
            None => Ok(None),
            Some(Value::Bytes(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hget(
        &mut self,
        key: &str,
        field: &str,
    ) -> Result<Option<Vec<u8>>, Error> {
        match self.state.read().values.get(key) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hgetall(&mut self, key: &str) -> Result<Vec<(String, Vec<u8>)>, Error> {
        match self.state.read().values.get(key) {
            None => Ok(Vec::new()),
            Some(Value::Hash(hash)) => Ok(hash
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn zrange_after(
        &mut self,
        key: &str,
        after: u64,
    ) -> Result<Vec<(String, u64)>, Error> {
        match self.state.read().values.get(key) {
            None => Ok(Vec::new()),
            Some(Value::Sorted(set)) => {
                let mut members: Vec<(String, u64)> = set
                    .iter()
                    .filter(|&(_, &score)| score > after)
                    .map(|(m, &score)| (m.clone(), score))
                    .collect();
                members.sort_by(|a, b| (a.1, &a.0).cmp(&(b.1, &b.0)));
                Ok(members)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn exec(&mut self, ops: &[Op]) -> Result<bool, Error> {
        let watched = std::mem::take(&mut self.watched);
        let mut state = self.state.write();
        if watched.iter().any(|(key, &v)| state.version(key) != v) {
            return Ok(false);
        }

        for op in ops {
            state.apply(op)?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn s(v: &str) -> String {
        v.to_owned()
    }

    #[test]
    fn watch_detects_writes() {
        let kv = MemoryKv::new();
        let mut a = kv.connect().unwrap();
        let mut b = kv.connect().unwrap();

        a.watch(&[s("k")]).unwrap();
        assert!(b.exec(&[Op::Set(s("k"), b"b".to_vec())]).unwrap());
        assert!(!a.exec(&[Op::Set(s("k"), b"a".to_vec())]).unwrap());
        assert_eq!(Some(b"b".to_vec()), a.get("k").unwrap());

        // Watches are consumed by exec
        assert!(a.exec(&[Op::Set(s("k"), b"a".to_vec())]).unwrap());
        assert_eq!(Some(b"a".to_vec()), b.get("k").unwrap());

        // Deletion counts as a write
        a.watch(&[s("k")]).unwrap();
        b.exec(&[Op::Del(s("k"))]).unwrap();
        assert!(!a.exec(&[]).unwrap());

        // Unwatched keys don't matter
        a.watch(&[s("other")]).unwrap();
        b.exec(&[Op::Set(s("k"), vec![])]).unwrap();
        assert!(a.exec(&[]).unwrap());
    }

    #[test]
    fn collections() {
        let kv = MemoryKv::new();
        let mut c = kv.connect().unwrap();

        c.exec(&[
            Op::HSet(s("h"), s("a"), b"1".to_vec()),
            Op::HSet(s("h"), s("b"), b"2".to_vec()),
            Op::HDel(s("h"), s("a")),
            Op::ZAdd(s("z"), s("x"), 5),
            Op::ZAdd(s("z"), s("y"), 3),
            Op::ZAdd(s("z"), s("w"), 1),
            Op::ZAdd(s("z"), s("x"), 2),
            Op::ZRem(s("z"), s("w")),
        ])
        .unwrap();

        assert_eq!(vec![(s("b"), b"2".to_vec())], c.hgetall("h").unwrap());
        assert_eq!(None, c.hget("h", "a").unwrap());
        assert_eq!(
            vec![(s("x"), 2), (s("y"), 3)],
            c.zrange_after("z", 1).unwrap()
        );
        assert_eq!(vec![(s("y"), 3)], c.zrange_after("z", 2).unwrap());

        assert_matches!(Err(Error::CorruptIndex(_)), c.get("h"));
        assert_matches!(
            Err(Error::CorruptIndex(_)),
            c.exec(&[Op::ZAdd(s("h"), s("m"), 1)])
        );

        c.exec(&[Op::HDel(s("h"), s("b"))]).unwrap();
        assert!(c.hgetall("h").unwrap().is_empty());
        c.exec(&[Op::Set(s("h"), vec![])]).unwrap();
    }
}
