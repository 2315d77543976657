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

use std::fs;
use std::io::{self, Read};
use std::path::Path;

use log::{error, info};

use super::main::AppendSubcommand;
use crate::session::Session;
use crate::store::model::{AppendMessage, Flag};
use crate::support::error::Error;

pub(super) fn append(
    session: &Session,
    cmd: AppendSubcommand,
) -> Result<(), Error> {
    if cmd.create {
        match session.create_mailbox(&cmd.mailbox) {
            Ok(_) | Err(Error::MailboxConflict) => (),
            Err(e) => return Err(e),
        }
    }

    let stdin = io::stdin();
    let mut stdin = stdin.lock();
    for input in &cmd.inputs {
        let message = match read_input(&cmd, input, &mut stdin) {
            Ok(message) => message,
            Err(e) => {
                error!("Unable to process {}: {}", input.display(), e);
                return Err(e);
            }
        };

        let response = session.append_messages(&cmd.mailbox, &[message])?;
        info!(
            "{} Appended {} to {} as UID {}",
            session.user(),
            input.display(),
            cmd.mailbox,
            response.uids.first().map_or(0, |u| u.get())
        );
    }

    Ok(())
}

fn read_input(
    cmd: &AppendSubcommand,
    input: &Path,
    stdin: &mut impl Read,
) -> Result<AppendMessage, Error> {
    let mut data = Vec::new();
    if Path::new("-") == input {
        stdin.read_to_end(&mut data)?;
    } else {
        fs::File::open(input)?.read_to_end(&mut data)?;
    }

    let mut flags = cmd.flag.clone();
    if cmd.maildir_flags {
        flags.extend(extract_maildir_flags(input));
    }

    Ok(AppendMessage::new(normalise_line_endings(data)).with_flags(flags))
}

/// Extract the flags from the info suffix (`:2,FRS`) of a maildir file name.
fn extract_maildir_flags(path: &Path) -> impl Iterator<Item = Flag> + '_ {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.rfind(":2,").map(|ix| &name[ix + 3..]))
        .unwrap_or("")
        .chars()
        .filter_map(|ch| match ch {
            'D' => Some(Flag::Draft),
            'F' => Some(Flag::Flagged),
            'R' => Some(Flag::Answered),
            'S' => Some(Flag::Seen),
            'T' => Some(Flag::Deleted),
            _ => None,
        })
}

/// If the first line of `data` ends with a bare line feed, convert every bare
/// line feed into CR LF. Otherwise return `data` unchanged.
fn normalise_line_endings(data: Vec<u8>) -> Vec<u8> {
    let first_lf = match data.iter().position(|&b| b'\n' == b) {
        Some(ix) => ix,
        None => return data,
    };
    if first_lf > 0 && b'\r' == data[first_lf - 1] {
        return data;
    }

    let mut converted = Vec::with_capacity(data.len() + data.len() / 32);
    let mut prev = 0u8;
    for b in data {
        if b'\n' == b && b'\r' != prev {
            converted.push(b'\r');
        }
        converted.push(b);
        prev = b;
    }
    converted
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_extract_maildir_flags() {
        fn extract(s: &str) -> Vec<Flag> {
            extract_maildir_flags(Path::new(s)).collect()
        }

        assert_eq!(Vec::<Flag>::new(), extract("foo"));
        assert_eq!(Vec::<Flag>::new(), extract("cur/1234.host:1,S"));
        assert_eq!(vec![Flag::Seen], extract("cur/1234.host:2,S"));
        assert_eq!(
            vec![
                Flag::Draft,
                Flag::Flagged,
                Flag::Answered,
                Flag::Seen,
                Flag::Deleted
            ],
            extract("/maildir/cur/1234.host,S=42:2,DFRSTa")
        );
    }

    fn normalised(s: &str) -> String {
        String::from_utf8(normalise_line_endings(s.as_bytes().to_vec()))
            .unwrap()
    }

    #[test]
    fn line_endings() {
        assert_eq!("a\r\nb\nc", normalised("a\r\nb\nc"));
        assert_eq!("a\r\nb\r\nc\r\n", normalised("a\nb\r\nc\n"));
        assert_eq!("\r\n\r\n", normalised("\n\n"));
        assert_eq!("no newline", normalised("no newline"));
        assert_eq!("", normalised(""));
    }

    proptest! {
        #[test]
        fn dos_input_is_verbatim(content in "[a-f\r\n\t]{0,100}") {
            let input = format!("Header\r\n{}", content);
            prop_assert_eq!(input.clone(), normalised(&input));
        }

        #[test]
        fn unix_conversion_preserves_content(
            content in "[a-f\r\n\t]{0,100}"
        ) {
            let input = format!("Header\n{}", content);
            let output = normalised(&input);
            prop_assert_eq!(input.replace('\r', ""), output.replace('\r', ""));
            prop_assert!(!output.replace("\r\n", "").contains('\n'));
        }
    }

    #[test]
    fn append_from_files() {
        use crate::store::backend::Backend;
        use crate::support::system_config::StoreConfig;
        use std::path::PathBuf;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("1234.host:2,FS");
        fs::write(&path, "Subject: hi\n\nbody\n").unwrap();

        let session = Session::open(
            &Backend::new(&StoreConfig::default()).unwrap(),
            "alice",
        )
        .unwrap();
        let cmd = AppendSubcommand {
            user: "alice".to_owned(),
            mailbox: "Imported".to_owned(),
            create: true,
            flag: vec![Flag::Keyword("Work".to_owned())],
            maildir_flags: true,
            inputs: vec![PathBuf::from(&path)],
        };
        append(&session, cmd).unwrap();

        let status = session.get_mailbox("Imported").unwrap();
        assert_eq!(1, status.snapshot.exists);
        assert_eq!(0, status.snapshot.unseen);

        let cmd = AppendSubcommand {
            user: "alice".to_owned(),
            mailbox: "Imported".to_owned(),
            create: false,
            flag: vec![],
            maildir_flags: false,
            inputs: vec![dir.path().join("missing")],
        };
        assert_matches!(Err(Error::Io(_)), append(&session, cmd));
    }
}
