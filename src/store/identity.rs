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

//! Derivation of the opaque identity tokens carried by every message, and the
//! minimal header access needed to compute them.
//!
//! The email id depends only on the raw bytes of the message, so identical
//! copies of a message (for example after `COPY`) share it. The thread id is
//! derived from the root of the message's reference chain, so replies land
//! in the same thread as what they reply to as long as they carry the usual
//! headers.

use std::fmt::Write as _;

use tiny_keccak::{Hasher, Sha3};

/// Number of digest octets kept in identity tokens.
const TOKEN_OCTETS: usize = 16;

/// Compute the email id of the given raw message.
pub fn email_id(data: &[u8]) -> String {
    token('M', data)
}

/// Compute the thread id of the given raw message.
///
/// The thread root is the first message id in `References`, or failing that
/// the first one in `In-Reply-To`, or failing that the message's own
/// `Message-ID`. A message with none of these is its own thread, keyed by its
/// email id.
pub fn thread_id(data: &[u8]) -> String {
    let root = ["References", "In-Reply-To", "Message-ID"]
        .iter()
        .filter_map(|name| header_value(data, name))
        .filter_map(|value| first_message_id(&value).map(str::to_owned))
        .next();

    match root {
        Some(root) => token('T', root.as_bytes()),
        None => token('T', email_id(data).as_bytes()),
    }
}

fn token(prefix: char, data: &[u8]) -> String {
    let mut sha3 = Sha3::v256();
    sha3.update(data);
    let mut hash = [0u8; 32];
    sha3.finalize(&mut hash);

    let mut s = String::with_capacity(1 + 2 * TOKEN_OCTETS);
    s.push(prefix);
    for &b in &hash[..TOKEN_OCTETS] {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn first_message_id(value: &str) -> Option<&str> {
    let start = value.find('<')?;
    let len = value[start..].find('>')?;
    let id = &value[start..=start + len];
    if id.len() > 2 {
        Some(id)
    } else {
        None
    }
}

/// Split a raw message into its header block and body.
///
/// A message without a blank line is all headers.
pub fn split_message(data: &[u8]) -> (&[u8], &[u8]) {
    let mut line_start = 0;
    while line_start < data.len() {
        let rest = &data[line_start..];
        if rest.starts_with(b"\r\n") {
            return (&data[..line_start], &data[line_start + 2..]);
        } else if rest.starts_with(b"\n") {
            return (&data[..line_start], &data[line_start + 1..]);
        }

        match rest.iter().position(|&b| b'\n' == b) {
            Some(eol) => line_start += eol + 1,
            None => break,
        }
    }

    (data, &[])
}

/// Iterate over the unfolded `(name, value)` pairs in the header block of
/// `data`. Values have surrounding whitespace trimmed.
pub fn headers(data: &[u8]) -> Vec<(String, String)> {
    let (header_block, _) = split_message(data);
    let text = String::from_utf8_lossy(header_block);

    let mut ret: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(&mut (_, ref mut value)) = ret.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }

        if let Some(colon) = line.find(':') {
            ret.push((
                line[..colon].trim().to_owned(),
                line[colon + 1..].trim().to_owned(),
            ));
        }
    }

    ret
}

/// Return the value of the first header named `name` (case-insensitive).
pub fn header_value(data: &[u8], name: &str) -> Option<String> {
    headers(data)
        .into_iter()
        .find(|&(ref n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}
