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

//! Translation between flags and the maildir info suffix.
//!
//! System flags have fixed letters. Keywords are assigned the letters `a`
//! through `z` in the order they are first used, with the assignment recorded
//! in the `keywords` file as `<index> <keyword>` lines. Once all 26 letters
//! are taken, further keywords cannot be stored in the mailbox.

use std::fmt;

use crate::store::model::{Flag, FlagSet, PermanentFlags};
use crate::support::error::Error;

pub const MAX_KEYWORDS: usize = 26;

/// The prefix of the info part of a maildir file name.
pub const INFO_PREFIX: &str = ":2,";

const SYSTEM_LETTERS: [(char, Flag); 5] = [
    ('D', Flag::Draft),
    ('F', Flag::Flagged),
    ('R', Flag::Answered),
    ('S', Flag::Seen),
    ('T', Flag::Deleted),
];

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Keywords {
    slots: Vec<Option<String>>,
}

impl Keywords {
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut this = Keywords::default();
        for line in text.lines().filter(|l| !l.is_empty()) {
            let mut parts = line.splitn(2, ' ');
            let index = parts
                .next()
                .and_then(|ix| ix.parse::<usize>().ok())
                .filter(|&ix| ix < MAX_KEYWORDS)
                .ok_or_else(|| corrupt("bad index"))?;
            let name = parts
                .next()
                .filter(|n| !n.is_empty())
                .ok_or_else(|| corrupt("missing keyword"))?;

            if this.slots.len() <= index {
                this.slots.resize(index + 1, None);
            }
            this.slots[index] = Some(name.to_owned());
        }

        Ok(this)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= MAX_KEYWORDS
    }

    fn letter_of(&self, keyword: &Flag) -> Option<char> {
        self.slots
            .iter()
            .position(|slot| {
                slot.as_ref().map_or(false, |name| {
                    *keyword == Flag::Keyword(name.clone())
                })
            })
            .map(index_letter)
    }

    /// Return the letter for `keyword`, assigning a free one if it has none
    /// yet. Returns `None` if the table is full.
    pub fn intern(&mut self, keyword: &Flag) -> Option<char> {
        let name = match *keyword {
            Flag::Keyword(ref name) => name,
            _ => return None,
        };

        if let Some(letter) = self.letter_of(keyword) {
            return Some(letter);
        }

        let index = match self.slots.iter().position(Option::is_none) {
            Some(ix) => ix,
            None if self.slots.len() < MAX_KEYWORDS => {
                self.slots.push(None);
                self.slots.len() - 1
            }
            None => return None,
        };
        self.slots[index] = Some(name.clone());
        Some(index_letter(index))
    }

    /// The flags a mailbox with this table can store.
    pub fn permanent_flags(&self) -> PermanentFlags {
        let mut flags: FlagSet = Flag::SYSTEM.iter().cloned().collect();
        flags.extend(
            self.slots
                .iter()
                .flatten()
                .map(|name| Flag::Keyword(name.clone())),
        );
        PermanentFlags {
            flags,
            new_keywords: !self.is_full(),
        }
    }

    /// Encode `flags` as maildir info letters, in ASCII order.
    ///
    /// Keywords which have no letter are dropped; call `intern()` first to
    /// keep them.
    pub fn to_info(&self, flags: &FlagSet) -> String {
        let mut letters: Vec<char> = flags
            .iter()
            .filter_map(|flag| {
                SYSTEM_LETTERS
                    .iter()
                    .find(|(_, f)| f == flag)
                    .map(|&(l, _)| l)
                    .or_else(|| self.letter_of(flag))
            })
            .collect();
        letters.sort_unstable();
        letters.dedup();
        letters.into_iter().collect()
    }

    /// Decode maildir info letters. Unknown letters are ignored.
    pub fn from_info(&self, info: &str) -> FlagSet {
        info.chars()
            .filter_map(|letter| match letter {
                'a'..='z' => self
                    .slots
                    .get(letter as usize - 'a' as usize)
                    .and_then(Option::as_ref)
                    .map(|name| Flag::Keyword(name.clone())),
                _ => SYSTEM_LETTERS
                    .iter()
                    .find(|&&(l, _)| l == letter)
                    .map(|(_, f)| f.clone()),
            })
            .collect()
    }
}

impl fmt::Display for Keywords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (ix, slot) in self.slots.iter().enumerate() {
            if let Some(name) = slot.as_ref() {
                writeln!(f, "{} {}", ix, name)?;
            }
        }
        Ok(())
    }
}

fn index_letter(index: usize) -> char {
    (b'a' + index as u8) as char
}

fn corrupt(what: &str) -> Error {
    Error::CorruptIndex(format!("keywords: {}", what))
}

/// Split a maildir file name into its basename and info letters.
pub fn split_filename(name: &str) -> (&str, &str) {
    match name.find(INFO_PREFIX) {
        Some(ix) => (&name[..ix], &name[ix + INFO_PREFIX.len()..]),
        None => (name, ""),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn kw(s: &str) -> Flag {
        Flag::Keyword(s.to_owned())
    }

    #[test]
    fn info_letters() {
        let mut keywords = Keywords::default();
        assert_eq!(Some('a'), keywords.intern(&kw("$Junk")));
        assert_eq!(Some('b'), keywords.intern(&kw("work")));
        assert_eq!(Some('a'), keywords.intern(&kw("$JUNK")));
        assert_eq!(None, keywords.intern(&Flag::Seen));

        let flags: FlagSet =
            vec![Flag::Seen, Flag::Answered, kw("WORK"), kw("nx")]
                .into_iter()
                .collect();
        assert_eq!("RSb", keywords.to_info(&flags));

        let decoded = keywords.from_info("RSbq?");
        assert_eq!(
            vec![Flag::Answered, Flag::Seen, kw("work")]
                .into_iter()
                .collect::<FlagSet>(),
            decoded
        );
    }

    #[test]
    fn table_fills_up() {
        let mut keywords = Keywords::default();
        for i in 0..MAX_KEYWORDS {
            assert!(keywords.intern(&kw(&format!("k{}", i))).is_some());
        }
        assert!(keywords.is_full());
        assert!(!keywords.permanent_flags().new_keywords);
        assert_eq!(None, keywords.intern(&kw("extra")));
        assert_eq!(Some('z'), keywords.intern(&kw("K25")));

        let permanent = keywords.permanent_flags();
        assert!(permanent.permits(&kw("k3")));
        assert!(!permanent.permits(&kw("extra")));
    }

    #[test]
    fn file_round_trip() {
        let keywords = Keywords::parse("0 $Junk\n2 work\n").unwrap();
        assert_eq!(2, keywords.len());
        assert_eq!("0 $Junk\n2 work\n", keywords.to_string());
        assert_eq!(
            vec![kw("work")].into_iter().collect::<FlagSet>(),
            keywords.from_info("c")
        );

        assert_matches!(
            Err(Error::CorruptIndex(_)),
            Keywords::parse("26 overflow\n")
        );
        assert_matches!(Err(Error::CorruptIndex(_)), Keywords::parse("1\n"));
    }

    #[test]
    fn filename_split() {
        assert_eq!(("123.M1.host", "FS"), split_filename("123.M1.host:2,FS"));
        assert_eq!(("123.M1.host", ""), split_filename("123.M1.host"));
    }
}
