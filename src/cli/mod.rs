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

macro_rules! die {
    ($ex:expr, $($stuff:tt)*) => {{
        eprintln!($($stuff)*);
        $ex.exit()
    }}
}

mod admin;
mod deliver;
mod main;

pub use self::main::main;

use crate::support::error::Error;
use crate::support::sysexits::*;

/// Choose the exit status for a failed operation.
fn exit_code(e: &Error) -> Sysexit {
    match *e {
        _ if e.is_transient() => EX_TEMPFAIL,
        Error::MailboxNotFound { .. } => EX_NOINPUT,
        Error::MailboxConflict
        | Error::MailboxHasChildren
        | Error::UnsafeName
        | Error::BadOperationOnInbox
        | Error::RenameIntoSelf
        | Error::NxFlag => EX_DATAERR,
        Error::Aborted => EX_TEMPFAIL,
        Error::MailboxFull => EX_CANTCREAT,
        Error::Io(_) | Error::Nix(_) => EX_IOERR,
        Error::Toml(_) | Error::Unsupported(_) => EX_CONFIG,
        _ => EX_SOFTWARE,
    }
}
