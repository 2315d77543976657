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

use std::io::{self, Write};

use log::error;

use super::exit_code;
use super::main::Action;
use crate::session::{ListedMailbox, MailboxStatus, Session};
use crate::store::backend::Backend;
use crate::support::error::Error;
use crate::support::sysexits::*;
use crate::support::system_config::StoreConfig;

pub(super) fn run(config: &StoreConfig, action: Action) {
    let backend = match Backend::new(config) {
        Ok(backend) => backend,
        Err(e) => die!(exit_code(&e), "Failed to open storage: {}", e),
    };

    let user = match action {
        Action::List(ref c) => &c.user,
        Action::Create(ref c)
        | Action::Delete(ref c)
        | Action::Status(ref c) => &c.user,
        Action::Rename(ref c) => &c.user,
        Action::Append(ref c) => &c.user,
        Action::Cleanup(ref c) => &c.user,
    };

    let session = match Session::open(&backend, user) {
        Ok(session) => session,
        Err(Error::UnsafeName) => die!(EX_NOUSER, "Bad user name: {}", user),
        Err(e) => die!(exit_code(&e), "Failed to open {}: {}", user, e),
    };

    let stdout = io::stdout();
    let result = match action {
        Action::List(c) => session
            .list_mailboxes("", &c.pattern, c.subscribed)
            .and_then(|list| {
                let mut out = stdout.lock();
                for entry in list {
                    writeln!(out, "{}", format_listed(&entry))?;
                }
                Ok(())
            }),
        Action::Create(c) => session
            .create_mailbox(&c.mailbox)
            .map(|id| println!("Created {} ({})", c.mailbox, id)),
        Action::Delete(c) => session.delete_mailbox(&c.mailbox),
        Action::Rename(c) => session.rename_mailbox(&c.from, &c.to),
        Action::Append(c) => super::deliver::append(&session, c),
        Action::Status(c) => session.get_mailbox(&c.mailbox).and_then(|s| {
            write!(stdout.lock(), "{}", format_status(&s))?;
            Ok(())
        }),
        Action::Cleanup(_) => cleanup(&session, &backend),
    };

    if let Err(e) = result {
        error!("{} Command failed: {}", session.user(), e);
        die!(exit_code(&e), "{}", e);
    }
}

fn cleanup(session: &Session, backend: &Backend) -> Result<(), Error> {
    backend.open_user(session.user())?.cleanup()
}

fn format_listed(entry: &ListedMailbox) -> String {
    let mut attributes = Vec::new();
    if entry.has_children {
        attributes.push("\\HasChildren");
    }
    if entry.nonexistent {
        attributes.push("\\NonExistent");
    }
    if entry.subscribed {
        attributes.push("\\Subscribed");
    }

    if attributes.is_empty() {
        entry.name.clone()
    } else {
        format!("{} ({})", entry.name, attributes.join(" "))
    }
}

fn format_status(status: &MailboxStatus) -> String {
    let s = &status.snapshot;
    format!(
        "name: {}\n\
         id: {}\n\
         messages: {}\n\
         recent: {}\n\
         unseen: {}\n\
         uid-next: {}\n\
         uid-validity: {}\n\
         highest-modseq: {}\n",
        status.name,
        status.mailbox_id,
        s.exists,
        s.recent,
        s.unseen,
        s.uid_next.get(),
        s.uid_validity,
        s.highest_modseq.map_or(0, |m| m.raw()),
    )
}
