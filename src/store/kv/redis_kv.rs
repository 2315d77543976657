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

//! The key-value store backed by a Redis server.

use std::collections::HashMap;
use std::fmt;

use super::{KvConnection, KvStore, Op};
use crate::support::error::Error;

pub struct RedisKv {
    client: redis::Client,
}

impl fmt::Debug for RedisKv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RedisKv")
    }
}

impl RedisKv {
    /// Prepare to connect to the server at `url`, such as
    /// `redis://127.0.0.1/`. Nothing is contacted until the first
    /// `connect()`.
    pub fn open(url: &str) -> Result<Self, Error> {
        Ok(RedisKv {
            client: redis::Client::open(url)?,
        })
    }
}

impl KvStore for RedisKv {
    fn connect(&self) -> Result<Box<dyn KvConnection>, Error> {
        Ok(Box::new(RedisConnection(self.client.get_connection()?)))
    }
}

struct RedisConnection(redis::Connection);

fn command(op: &Op) -> redis::Cmd {
    let mut cmd;
    match *op {
        Op::Set(ref k, ref v) => {
            cmd = redis::cmd("SET");
            cmd.arg(k).arg(&v[..]);
        }
        Op::Del(ref k) => {
            cmd = redis::cmd("DEL");
            cmd.arg(k);
        }
        Op::HSet(ref k, ref f, ref v) => {
            cmd = redis::cmd("HSET");
            cmd.arg(k).arg(f).arg(&v[..]);
        }
        Op::HDel(ref k, ref f) => {
            cmd = redis::cmd("HDEL");
            cmd.arg(k).arg(f);
        }
        Op::ZAdd(ref k, ref m, score) => {
            cmd = redis::cmd("ZADD");
            cmd.arg(k).arg(score).arg(m);
        }
        Op::ZRem(ref k, ref m) => {
            cmd = redis::cmd("ZREM");
            cmd.arg(k).arg(m);
        }
    }
    cmd
}

impl KvConnection for RedisConnection {
    fn watch(&mut self, keys: &[String]) -> Result<(), Error> {
        redis::cmd("WATCH").arg(keys).query::<()>(&mut self.0)?;
        Ok(())
    }

    fn unwatch(&mut self) -> Result<(), Error> {
        redis::cmd("UNWATCH").query::<()>(&mut self.0)?;
        Ok(())
    }

    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(redis::cmd("GET").arg(key).query(&mut self.0)?)
    }

    fn hget(
        &mut self,
        key: &str,
        field: &str,
    ) -> Result<Option<Vec<u8>>, Error> {
        Ok(redis::cmd("HGET").arg(key).arg(field).query(&mut self.0)?)
    }

    fn hgetall(&mut self, key: &str) -> Result<Vec<(String, Vec<u8>)>, Error> {
        let all: HashMap<String, Vec<u8>> =
            redis::cmd("HGETALL").arg(key).query(&mut self.0)?;
        let mut all: Vec<(String, Vec<u8>)> = all.into_iter().collect();
        all.sort();
        Ok(all)
    }

    fn zrange_after(
        &mut self,
        key: &str,
        after: u64,
    ) -> Result<Vec<(String, u64)>, Error> {
        Ok(redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(format!("({}", after))
            .arg("+inf")
            .arg("WITHSCORES")
            .query(&mut self.0)?)
    }

    fn exec(&mut self, ops: &[Op]) -> Result<bool, Error> {
        redis::cmd("MULTI").query::<()>(&mut self.0)?;
        for op in ops {
            if let Err(e) = command(op).query::<()>(&mut self.0) {
                let _ = redis::cmd("DISCARD").query::<()>(&mut self.0);
                return Err(e.into());
            }
        }

        // Nil if a watched key changed
        let result: Option<redis::Value> =
            redis::cmd("EXEC").query(&mut self.0)?;
        Ok(result.is_some())
    }
}
