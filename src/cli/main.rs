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

use log::LevelFilter;
use structopt::clap;
use structopt::StructOpt;

use crate::store::model::Flag;
use crate::support::sysexits::*;
use crate::support::system_config::StoreConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
pub(super) struct Command {
    /// The configuration file
    /// [default: /etc/mailstore/mailstore.toml or
    /// /usr/local/etc/mailstore/mailstore.toml]
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    #[structopt(subcommand)]
    pub(super) action: Action,
}

#[derive(StructOpt)]
pub(super) enum Action {
    /// List the mailboxes of a user.
    List(ListSubcommand),
    /// Create a mailbox, along with any missing parents.
    Create(MailboxSubcommand),
    /// Delete a mailbox. It must not have children.
    Delete(MailboxSubcommand),
    /// Rename a mailbox and everything beneath it.
    ///
    /// Renaming INBOX moves its messages to the new mailbox and leaves an
    /// empty INBOX behind.
    Rename(RenameSubcommand),
    Append(AppendSubcommand),
    /// Show the message counts and UID state of a mailbox.
    Status(MailboxSubcommand),
    /// Clean up temporary and orphaned data in every mailbox of a user.
    Cleanup(UserSubcommand),
}

#[derive(StructOpt)]
pub(super) struct UserSubcommand {
    /// The user whose mail to operate on.
    pub(super) user: String,
}

#[derive(StructOpt)]
pub(super) struct ListSubcommand {
    /// The user whose mail to operate on.
    pub(super) user: String,

    /// Only mailboxes matching this pattern, where `*` matches anything and
    /// `%` matches anything but the hierarchy delimiter.
    #[structopt(default_value = "*")]
    pub(super) pattern: String,

    /// List subscriptions instead.
    #[structopt(long)]
    pub(super) subscribed: bool,
}

#[derive(StructOpt)]
pub(super) struct MailboxSubcommand {
    /// The user whose mail to operate on.
    pub(super) user: String,
    /// The mailbox name.
    pub(super) mailbox: String,
}

#[derive(StructOpt)]
pub(super) struct RenameSubcommand {
    /// The user whose mail to operate on.
    pub(super) user: String,
    pub(super) from: String,
    pub(super) to: String,
}

/// Append messages to a mailbox.
///
/// Each input is one RFC 5322 message. If the first line of an input ends
/// with a UNIX line ending, all bare line feeds in that input are converted
/// into DOS line endings. Otherwise the input is stored bit-for-bit.
///
/// A maildir can be imported by passing its files individually:
///
/// ls Maildir/cur/* | xargs -d'\n' mailstore append alice --maildir-flags
#[derive(StructOpt)]
pub(super) struct AppendSubcommand {
    /// The user whose mail to operate on.
    pub(super) user: String,

    /// Append to this mailbox.
    #[structopt(short, long, default_value = "INBOX")]
    pub(super) mailbox: String,

    /// Create the destination mailbox if it does not already exist.
    #[structopt(short, long)]
    pub(super) create: bool,

    /// Add this IMAP flag (e.g., '\Flagged') or keyword to the appended
    /// message(s). Can be passed multiple times.
    #[structopt(parse(try_from_str), short, long, number_of_values(1))]
    pub(super) flag: Vec<Flag>,

    /// Extract maildir-style flags from the file name(s).
    #[structopt(long)]
    pub(super) maildir_flags: bool,

    /// The files to append. "-" reads from stdin.
    #[structopt(parse(from_os_str), default_value = "-")]
    pub(super) inputs: Vec<PathBuf>,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let cmd = Command::from_clap(&match Command::clap().get_matches_safe() {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        }
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        }
    });

    let config_path = cmd.config.clone().unwrap_or_else(|| {
        if Path::new("/etc/mailstore/mailstore.toml").is_file() {
            "/etc/mailstore/mailstore.toml".to_owned().into()
        } else if Path::new("/usr/local/etc/mailstore/mailstore.toml").is_file()
        {
            "/usr/local/etc/mailstore/mailstore.toml".to_owned().into()
        } else {
            die!(
                EX_CONFIG,
                "Neither /etc/mailstore nor /usr/local/etc/mailstore contains\n\
                 mailstore.toml; use --config=/path/to/mailstore.toml if your\n\
                 configuration is elsewhere."
            )
        }
    });

    let config = match StoreConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => die!(
            EX_CONFIG,
            "Error in config file at '{}': {}",
            config_path.display(),
            e
        ),
    };

    init_log(config_path.parent().unwrap_or_else(|| Path::new(".")));
    super::admin::run(&config, cmd.action);
}

fn init_log(config_dir: &Path) {
    if Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; ignore logging configuration and just write
        // to stderr.
        init_simple_log();
        return;
    }

    let log_config_file = config_dir.join("logging.toml");
    if log_config_file.is_file() {
        if let Err(e) = log4rs::init_file(
            &log_config_file,
            log4rs::file::Deserializers::new(),
        ) {
            die!(
                EX_CONFIG,
                "Failed to initialise logging from '{}': {}",
                log_config_file.display(),
                e
            );
        }
    } else {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_MAIL,
            hostname: None,
            process: env!("CARGO_PKG_NAME").to_owned(),
            pid: nix::unistd::getpid().as_raw(),
        };

        let logger = match syslog::unix(formatter) {
            Ok(logger) => logger,
            Err(e) => die!(EX_OSERR, "Failed to connect to syslog: {}", e),
        };
        if let Err(e) =
            log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
                .map(|_| log::set_max_level(LevelFilter::Info))
        {
            die!(EX_SOFTWARE, "Failed to initialise logging: {}", e);
        }
    }
}

fn init_simple_log() {
    use log4rs::append::console::{ConsoleAppender, Target};
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(
            "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}",
        )))
        .build();

    let config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(LevelFilter::Info));
    let result = match config {
        Ok(config) => log4rs::init_config(config).map(|_| ()),
        Err(e) => die!(EX_SOFTWARE, "Bad logging configuration: {}", e),
    };
    if let Err(e) = result {
        die!(EX_SOFTWARE, "Failed to initialise logging: {}", e);
    }
}
