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

//! Mailbox name handling shared by all engines.
//!
//! Names are hierarchical with `/` as the delimiter. The top-level `INBOX` is
//! case-insensitive and always normalised to upper case; nothing else is.
//! Empty path segments are dropped, so `/foo//bar/` names `foo/bar`.

use regex::Regex;

use crate::support::error::Error;

pub const INBOX: &str = "INBOX";
pub const DELIMITER: char = '/';

/// Split a raw mailbox name into its path segments.
///
/// This accounts for the delimiter, empty segments, and the
/// case-insensitivity of the root `INBOX`. It does not check safety.
pub fn segments(name: &str) -> impl Iterator<Item = &str> + '_ {
    name.split(DELIMITER)
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(ix, s)| {
            if 0 == ix && INBOX.eq_ignore_ascii_case(s) {
                INBOX
            } else {
                s
            }
        })
}

/// Determine whether `segment` is usable as one segment of a mailbox name.
///
/// Names become file system elements for the maildir engine and key
/// components for the KV engine, so this blocks empty names, directory
/// traversal, hidden files, anything with special meaning in IMAP and control
/// characters.
pub fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.starts_with('.')
        && !segment.starts_with('#')
        && !segment.contains(DELIMITER)
        && !segment.contains('\\')
        && !segment.contains(|c| c < ' ' || '\x7F' == c)
        && !segment.contains(|c| '*' == c || '%' == c)
}

/// Normalise and validate `name`.
///
/// Fails with `UnsafeName` if the name is empty or any segment is unsafe.
pub fn normalise(name: &str) -> Result<String, Error> {
    let mut normalised = String::with_capacity(name.len());
    for segment in segments(name) {
        if !is_safe_segment(segment) {
            return Err(Error::UnsafeName);
        }

        if !normalised.is_empty() {
            normalised.push(DELIMITER);
        }
        normalised.push_str(segment);
    }

    if normalised.is_empty() {
        Err(Error::UnsafeName)
    } else {
        Ok(normalised)
    }
}

/// Whether the normalised `name` is the INBOX itself.
pub fn is_inbox(name: &str) -> bool {
    INBOX == name
}

/// Return the normalised names of every proper ancestor of the normalised
/// `name`, outermost first.
pub fn ancestors(name: &str) -> Vec<&str> {
    name.match_indices(DELIMITER)
        .map(|(ix, _)| &name[..ix])
        .collect()
}

/// Whether normalised `name` is strictly beneath normalised `parent`.
pub fn is_descendant(name: &str, parent: &str) -> bool {
    name.len() > parent.len()
        && name.starts_with(parent)
        && name[parent.len()..].starts_with(DELIMITER)
}

/// Return the name `name` would have after its ancestor `from` is renamed to
/// `to`, or `None` if `name` is neither `from` nor beneath it.
pub fn rebase(name: &str, from: &str, to: &str) -> Option<String> {
    if name == from {
        Some(to.to_owned())
    } else if is_descendant(name, from) {
        Some(format!("{}{}", to, &name[from.len()..]))
    } else {
        None
    }
}

/// Create a predicate identifying which normalised mailbox names match
/// `pattern` interpreted relative to `reference`, with `*` matching anything
/// and `%` matching anything but the delimiter.
///
/// Listing therefore fetches every mailbox and narrows the result down. `*`
/// is permitted mid-path, which rules out any sane recursive filtering.
pub fn matcher(
    reference: &str,
    pattern: &str,
) -> Result<impl Fn(&str) -> bool, Error> {
    let full = if reference.is_empty() {
        pattern.to_owned()
    } else {
        format!("{}{}{}", reference, DELIMITER, pattern)
    };

    let mut rx = "^".to_owned();
    for (ix, segment) in segments(&full).enumerate() {
        if ix > 0 {
            rx.push(DELIMITER);
        }

        let mut literal = String::new();
        for ch in segment.chars() {
            match ch {
                '*' | '%' => {
                    rx.push_str(&regex::escape(&literal));
                    literal.clear();
                    rx.push_str(if '*' == ch { ".*" } else { "[^/]*" });
                }
                _ => literal.push(ch),
            }
        }
        rx.push_str(&regex::escape(&literal));
    }
    rx.push('$');

    let rx = Regex::new(&rx).map_err(|_| Error::UnsafeName)?;
    Ok(move |name: &str| rx.is_match(name))
}
