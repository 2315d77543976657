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

//! Behaviour every engine must share.
//!
//! Each engine's tests call `run_all()` with a factory producing a fresh
//! `MailboxSet` for a given user name.

use std::sync::Arc;
use std::time::Duration;

use chrono::prelude::*;

use super::model::*;
use super::selected::PollResponse;
use super::{MailboxData, MailboxSet};
use crate::support::error::Error;

type Factory<'a> = &'a dyn Fn(&str) -> Arc<dyn MailboxSet>;

pub fn run_all(factory: impl Fn(&str) -> Arc<dyn MailboxSet>) {
    let tests: &[(&str, fn(Factory))] = &[
        ("uids_strictly_increase", uids_strictly_increase),
        ("get_and_tombstones", get_and_tombstones),
        ("flag_updates", flag_updates),
        ("resync_is_idempotent", resync_is_idempotent),
        ("expunge_seen_by_other_session", expunge_seen_by_other_session),
        ("claim_recent_once", claim_recent_once),
        ("inbox_from_uid_100", inbox_from_uid_100),
        ("mailbox_lifecycle", mailbox_lifecycle),
        ("rename_hierarchy", rename_hierarchy),
        ("rename_inbox", rename_inbox),
        ("subscriptions", subscriptions),
        ("concurrent_mutations", concurrent_mutations),
        ("mutations_wake_views", mutations_wake_views),
        ("deleted_mailbox_vanishes", deleted_mailbox_vanishes),
    ];

    for &(name, test) in tests {
        eprintln!("conformance: {}", name);
        test(&|user| factory(&format!("{}-{}", name, user)));
    }
}

fn msg(body: &str) -> AppendMessage {
    AppendMessage::new(format!(
        "Message-ID: <{}@example.com>\r\nSubject: {}\r\n\r\n{}\r\n",
        body, body, body
    ))
}

fn flags(f: &[Flag]) -> FlagSet {
    f.iter().cloned().collect()
}

fn kw(s: &str) -> Flag {
    Flag::Keyword(s.to_owned())
}

fn inbox(set: &dyn MailboxSet) -> Arc<dyn MailboxData> {
    set.get_mailbox("INBOX", false).unwrap()
}

fn sync(
    mailbox: &dyn MailboxData,
    view: &mut super::selected::SelectedMailbox,
) -> PollResponse {
    mailbox.update_selected(view).unwrap();
    view.take_update()
}

fn uids_strictly_increase(factory: Factory) {
    let set = factory("alice");
    let mailbox = inbox(&*set);
    let start = mailbox.next_uid().unwrap();

    let mut last = None;
    for i in 0..10 {
        let added = mailbox.add(&msg(&format!("m{}", i)), false).unwrap();
        if let Some(last) = last {
            assert!(added.uid > last);
        }
        last = Some(added.uid);

        if 0 == i % 3 {
            assert_eq!(
                vec![added.uid],
                mailbox.delete(&[added.uid]).unwrap()
            );
        }
    }

    assert_eq!(start.get() + 10, mailbox.next_uid().unwrap().get());
    assert_eq!(
        6,
        mailbox.messages(FetchRequirement::METADATA).unwrap().len()
    );

    // Deleting again is a no-op
    assert!(mailbox.delete(&[start]).unwrap().is_empty());
}

fn get_and_tombstones(factory: Factory) {
    let set = factory("alice");
    let mailbox = inbox(&*set);

    let message = AppendMessage {
        internal_date: Some(chrono::Utc.timestamp(1_500_000_000, 0)),
        ..msg("hello")
    };
    let added = mailbox.add(&message, false).unwrap();
    assert_eq!(message.data.len() as u64, added.size);
    assert!(added.email_id.starts_with('M'));

    let meta = mailbox
        .get(added.uid, None, FetchRequirement::METADATA)
        .unwrap()
        .unwrap();
    assert!(meta.content.is_none());
    assert_eq!(added.internal_date, meta.internal_date);
    assert_eq!(1_500_000_000, meta.internal_date.timestamp());
    assert_eq!(added.email_id, meta.email_id);
    assert_eq!(added.thread_id, meta.thread_id);

    let full = mailbox
        .get(added.uid, None, FetchRequirement::CONTENT)
        .unwrap()
        .unwrap();
    assert_eq!(Some(&message.data[..]), full.content.as_deref());

    // Identical content shares an email id
    let copy = mailbox.add(&message, false).unwrap();
    assert_eq!(added.email_id, copy.email_id);

    assert_matches!(
        Err(Error::InvalidUid),
        mailbox.get(
            Uid::u(copy.uid.get() + 1),
            None,
            FetchRequirement::METADATA
        )
    );

    mailbox.delete(&[added.uid]).unwrap();
    assert_eq!(
        None,
        mailbox
            .get(added.uid, None, FetchRequirement::METADATA)
            .unwrap()
    );
    let tombstone = mailbox
        .get(added.uid, Some(&meta), FetchRequirement::METADATA)
        .unwrap()
        .unwrap();
    assert!(tombstone.expunged);
    assert_eq!(added.uid, tombstone.uid);
}

fn flag_updates(factory: Factory) {
    let set = factory("alice");
    let mailbox = inbox(&*set);

    let a = mailbox
        .add(&msg("a").with_flags(vec![Flag::Draft, kw("$Junk")]), false)
        .unwrap();
    let b = mailbox.add(&msg("b"), false).unwrap();
    assert_eq!(flags(&[Flag::Draft, kw("$junk")]), a.flags);

    let updated = mailbox
        .update_flags(
            &[a.uid, b.uid],
            &flags(&[Flag::Seen, Flag::Flagged]),
            FlagMode::Add,
        )
        .unwrap();
    assert_eq!(2, updated.len());

    let get = |uid| {
        mailbox
            .get(uid, None, FetchRequirement::METADATA)
            .unwrap()
            .unwrap()
            .flags
    };
    assert_eq!(
        flags(&[Flag::Draft, Flag::Flagged, Flag::Seen, kw("$Junk")]),
        get(a.uid)
    );
    assert_eq!(flags(&[Flag::Flagged, Flag::Seen]), get(b.uid));

    mailbox
        .update_flags(
            &[a.uid],
            &flags(&[Flag::Draft, kw("$JUNK")]),
            FlagMode::Remove,
        )
        .unwrap();
    assert_eq!(flags(&[Flag::Flagged, Flag::Seen]), get(a.uid));

    mailbox
        .update_flags(&[b.uid], &flags(&[Flag::Answered]), FlagMode::Replace)
        .unwrap();
    assert_eq!(flags(&[Flag::Answered]), get(b.uid));

    // Nonexistent UIDs are skipped
    mailbox.delete(&[a.uid]).unwrap();
    let updated = mailbox
        .update_flags(&[a.uid, b.uid], &flags(&[Flag::Seen]), FlagMode::Add)
        .unwrap();
    assert_eq!(
        vec![b.uid],
        updated.iter().map(|m| m.uid).collect::<Vec<_>>()
    );
}

fn resync_is_idempotent(factory: Factory) {
    let set = factory("alice");
    let mailbox = inbox(&*set);
    mailbox.add(&msg("a"), false).unwrap();
    mailbox.add(&msg("b"), false).unwrap();

    let mut view = mailbox.select(false).unwrap();
    let first = sync(&*mailbox, &mut view);
    assert_eq!(Some(2), first.exists);
    assert!(sync(&*mailbox, &mut view).is_empty());

    let c = mailbox.add(&msg("c"), false).unwrap();
    mailbox
        .update_flags(&[c.uid], &flags(&[Flag::Seen]), FlagMode::Add)
        .unwrap();
    let update = sync(&*mailbox, &mut view);
    assert_eq!(Some(3), update.exists);
    // New messages are announced by EXISTS, not FETCH
    assert!(update.fetch.is_empty());
    assert!(sync(&*mailbox, &mut view).is_empty());

    mailbox.deselect(view.handle().unwrap());
}

fn expunge_seen_by_other_session(factory: Factory) {
    let set = factory("alice");
    let mailbox = inbox(&*set);
    let a = mailbox.add(&msg("a"), false).unwrap();
    let b = mailbox.add(&msg("b"), false).unwrap();

    let mut s1 = mailbox.select(false).unwrap();
    let mut s2 = mailbox.select(false).unwrap();
    assert_eq!(Some(2), sync(&*mailbox, &mut s1).exists);
    assert_eq!(Some(2), sync(&*mailbox, &mut s2).exists);

    mailbox
        .update_flags(&[a.uid], &flags(&[Flag::Deleted]), FlagMode::Add)
        .unwrap();
    let update = sync(&*mailbox, &mut s1);
    assert_eq!(1, update.fetch.len());
    assert_eq!(Seqnum::u(1), update.fetch[0].0);
    assert!(update.fetch[0].1.has_flag(&Flag::Deleted));

    // S2 expunges A after updating B. S1 only hears about the expunge of A
    // once, and about B's flags.
    mailbox
        .update_flags(&[b.uid], &flags(&[Flag::Seen]), FlagMode::Add)
        .unwrap();
    mailbox.delete(&[a.uid]).unwrap();
    sync(&*mailbox, &mut s2);

    let update = sync(&*mailbox, &mut s1);
    assert_eq!(vec![(Seqnum::u(1), a.uid)], update.expunge);
    assert_eq!(Some(1), update.exists);
    assert_eq!(1, update.fetch.len());
    assert_eq!(
        (Seqnum::u(1), b.uid),
        (update.fetch[0].0, update.fetch[0].1.uid)
    );
    assert_eq!(1, s1.exists());
    assert_eq!(&[b.uid], s1.uids());

    assert!(sync(&*mailbox, &mut s1).is_empty());
}

fn claim_recent_once(factory: Factory) {
    let set = factory("alice");
    let mailbox = inbox(&*set);
    let a = mailbox.add(&msg("a"), true).unwrap();
    let b = mailbox.add(&msg("b"), true).unwrap();
    assert!(a.recent);
    assert_eq!(2, mailbox.snapshot().unwrap().recent);

    let mut s1 = mailbox.select(false).unwrap();
    let mut s2 = mailbox.select(false).unwrap();

    assert_eq!(vec![a.uid, b.uid], mailbox.claim_recent(&mut s1).unwrap());
    assert!(mailbox.claim_recent(&mut s1).unwrap().is_empty());
    assert!(mailbox.claim_recent(&mut s2).unwrap().is_empty());

    let update = sync(&*mailbox, &mut s1);
    assert_eq!(Some(2), update.recent);
    assert!(s1.is_recent(a.uid));

    let update = sync(&*mailbox, &mut s2);
    assert_eq!(Some(0), update.recent);
    assert!(!s2.is_recent(a.uid));

    assert_eq!(0, mailbox.snapshot().unwrap().recent);
}

fn inbox_from_uid_100(factory: Factory) {
    let set = factory("alice");
    let mailbox = inbox(&*set);

    // Burn UIDs until the next one is 100
    while mailbox.next_uid().unwrap().get() < 100 {
        let added = mailbox.add(&msg("filler"), false).unwrap();
        mailbox.delete(&[added.uid]).unwrap();
    }
    assert_eq!(100, mailbox.next_uid().unwrap().get());

    let a = mailbox.add(&msg("a"), false).unwrap();
    let b = mailbox.add(&msg("b"), false).unwrap();
    assert_eq!(Uid::u(100), a.uid);
    assert_eq!(Uid::u(101), b.uid);

    mailbox
        .update_flags(&[a.uid], &flags(&[Flag::Seen]), FlagMode::Add)
        .unwrap();

    let snapshot = mailbox.snapshot().unwrap();
    assert_eq!(2, snapshot.exists);
    assert_eq!(1, snapshot.unseen);
    assert_eq!(Some(Seqnum::u(2)), snapshot.first_unseen);
    assert_eq!(Uid::u(102), snapshot.uid_next);
    assert_eq!(mailbox.uid_validity().unwrap(), snapshot.uid_validity);

    let get = |uid| {
        mailbox
            .get(uid, None, FetchRequirement::METADATA)
            .unwrap()
            .unwrap()
    };
    assert!(get(a.uid).has_flag(&Flag::Seen));
    assert!(!get(b.uid).has_flag(&Flag::Seen));

    // A second session sees both and hears about the expunge exactly once
    let mut s1 = mailbox.select(true).unwrap();
    assert_eq!(Some(2), sync(&*mailbox, &mut s1).exists);
    mailbox.delete(&[a.uid]).unwrap();
    let update = sync(&*mailbox, &mut s1);
    assert_eq!(vec![(Seqnum::u(1), a.uid)], update.expunge);
    assert_eq!(Some(1), update.exists);
    assert!(update.fetch.is_empty());
}

fn mailbox_lifecycle(factory: Factory) {
    let set = factory("alice");

    assert_matches!(
        Err(Error::MailboxNotFound { try_create: true }),
        set.get_mailbox("Archive", true)
    );
    assert_matches!(
        Err(Error::MailboxNotFound { try_create: false }),
        set.get_mailbox("Archive", false)
    );

    // INBOX appears on first reference, case-insensitively
    let inbox = set.get_mailbox("inbox", false).unwrap();
    assert_eq!("INBOX", inbox.name());
    assert_eq!(
        inbox.mailbox_id(),
        set.get_mailbox("INBOX", false).unwrap().mailbox_id()
    );

    set.add_mailbox("Archive/2020/Q1").unwrap();
    assert_eq!(
        vec!["Archive", "Archive/2020", "Archive/2020/Q1", "INBOX"],
        set.list_mailboxes().unwrap()
    );
    assert_matches!(Err(Error::MailboxConflict), set.add_mailbox("Archive"));
    assert_matches!(Err(Error::UnsafeName), set.add_mailbox("foo/../bar"));
    assert_matches!(Err(Error::UnsafeName), set.add_mailbox("100%"));

    assert_matches!(
        Err(Error::MailboxHasChildren),
        set.delete_mailbox("Archive/2020")
    );
    assert_matches!(
        Err(Error::BadOperationOnInbox),
        set.delete_mailbox("INBOX")
    );
    assert_matches!(
        Err(Error::MailboxNotFound { .. }),
        set.delete_mailbox("Nope")
    );

    set.delete_mailbox("Archive/2020/Q1").unwrap();
    set.delete_mailbox("Archive/2020").unwrap();
    assert_eq!(vec!["Archive", "INBOX"], set.list_mailboxes().unwrap());
}

fn rename_hierarchy(factory: Factory) {
    let set = factory("alice");
    let parent = set.add_mailbox("Work").unwrap();
    let child = set.add_mailbox("Work/Old").unwrap();
    let added = child.add(&msg("a"), false).unwrap();
    let validity = child.uid_validity().unwrap();
    let id = child.mailbox_id().to_owned();

    assert_matches!(
        Err(Error::RenameIntoSelf),
        set.rename_mailbox("Work", "Work/Sub")
    );
    assert_matches!(
        Err(Error::MailboxNotFound { .. }),
        set.rename_mailbox("Play", "Games")
    );
    set.add_mailbox("Taken").unwrap();
    assert_matches!(
        Err(Error::MailboxConflict),
        set.rename_mailbox("Work", "Taken")
    );

    set.rename_mailbox("Work", "Archive/Job").unwrap();
    assert_eq!(
        vec!["Archive", "Archive/Job", "Archive/Job/Old", "INBOX", "Taken"],
        set.list_mailboxes().unwrap()
    );
    assert_eq!("Archive/Job", parent.name());

    let moved = set.get_mailbox("Archive/Job/Old", false).unwrap();
    assert_eq!(id, moved.mailbox_id());
    assert_eq!(validity, moved.uid_validity().unwrap());
    assert!(moved
        .get(added.uid, None, FetchRequirement::METADATA)
        .unwrap()
        .is_some());
    assert_matches!(
        Err(Error::MailboxNotFound { .. }),
        set.get_mailbox("Work/Old", false)
    );
}

fn rename_inbox(factory: Factory) {
    let set = factory("alice");
    let inbox = inbox(&*set);
    let added = inbox.add(&msg("a"), false).unwrap();
    let old_validity = inbox.uid_validity().unwrap();
    let old_id = inbox.mailbox_id().to_owned();
    set.add_mailbox("INBOX/Child").unwrap();

    set.rename_mailbox("INBOX", "Old Mail").unwrap();

    let moved = set.get_mailbox("Old Mail", false).unwrap();
    assert_eq!(1, moved.messages(FetchRequirement::METADATA).unwrap().len());
    assert!(moved
        .get(added.uid, None, FetchRequirement::METADATA)
        .unwrap()
        .is_some());

    let fresh = set.get_mailbox("INBOX", false).unwrap();
    assert_ne!(old_id, fresh.mailbox_id());
    assert_ne!(old_validity, fresh.uid_validity().unwrap());
    assert!(fresh.messages(FetchRequirement::METADATA).unwrap().is_empty());
    assert_eq!(Uid::MIN, fresh.next_uid().unwrap());

    // Children of INBOX stay put
    assert!(set.get_mailbox("INBOX/Child", false).is_ok());
}

fn subscriptions(factory: Factory) {
    let set = factory("alice");
    assert!(set.list_subscribed().unwrap().is_empty());

    set.set_subscribed("inbox", true).unwrap();
    set.set_subscribed("Not/Existing", true).unwrap();
    set.set_subscribed("Other", true).unwrap();
    set.set_subscribed("Other", false).unwrap();
    assert_eq!(
        vec!["INBOX", "Not/Existing"],
        set.list_subscribed().unwrap()
    );

    // Idempotent
    set.set_subscribed("INBOX", true).unwrap();
    set.set_subscribed("Other", false).unwrap();
    assert_eq!(2, set.list_subscribed().unwrap().len());
}

fn concurrent_mutations(factory: Factory) {
    let set = factory("alice");
    let mailbox = inbox(&*set);
    let start = mailbox.next_uid().unwrap().get();

    let mut added: Vec<Uid> = crossbeam::scope(|s| {
        let workers: Vec<_> = (0..4)
            .map(|t| {
                let mailbox = Arc::clone(&mailbox);
                s.spawn(move |_| {
                    (0..5)
                        .map(|i| {
                            mailbox
                                .add(&msg(&format!("t{}m{}", t, i)), false)
                                .unwrap()
                                .uid
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    })
    .unwrap();

    added.sort();
    added.dedup();
    assert_eq!(20, added.len());
    assert_eq!(start + 20, mailbox.next_uid().unwrap().get());

    // Disjoint flag updates from several threads are all kept
    let keywords = ["$a", "$b", "$c", "$d"];
    crossbeam::scope(|s| {
        for (t, chunk) in added.chunks(5).enumerate() {
            let mailbox = Arc::clone(&mailbox);
            let keyword = keywords[t];
            s.spawn(move |_| {
                for &uid in chunk {
                    mailbox
                        .update_flags(
                            &[uid],
                            &flags(&[kw(keyword)]),
                            FlagMode::Add,
                        )
                        .unwrap();
                }
            });
        }
        // And overlapping ones on a shared flag
        let mailbox = Arc::clone(&mailbox);
        let added = &added;
        s.spawn(move |_| {
            for &uid in added {
                mailbox
                    .update_flags(&[uid], &flags(&[Flag::Seen]), FlagMode::Add)
                    .unwrap();
            }
        });
    })
    .unwrap();

    for (ix, message) in mailbox
        .messages(FetchRequirement::METADATA)
        .unwrap()
        .into_iter()
        .enumerate()
    {
        assert_eq!(
            flags(&[Flag::Seen, kw(keywords[ix / 5])]),
            message.flags,
            "Wrong flags on {:?}",
            message.uid
        );
    }
}

fn mutations_wake_views(factory: Factory) {
    let set = factory("alice");
    let mailbox = inbox(&*set);
    let mut view = mailbox.select(false).unwrap();
    let handle = view.handle().unwrap();
    sync(&*mailbox, &mut view);

    let event = mailbox.wake_event(handle).unwrap();
    assert!(!event.wait(Some(Duration::from_millis(1))));

    mailbox.add(&msg("a"), false).unwrap();
    assert!(event.wait(Some(Duration::from_secs(5))));

    // A fired event is replaced on the next request
    let event = mailbox.wake_event(handle).unwrap();
    assert!(!event.is_signalled());
    assert_eq!(Some(1), sync(&*mailbox, &mut view).exists);

    mailbox.deselect(handle);
    assert!(mailbox.wake_event(handle).is_none());
}

fn deleted_mailbox_vanishes(factory: Factory) {
    let set = factory("alice");
    let mailbox = set.add_mailbox("Trash").unwrap();
    mailbox.add(&msg("a"), false).unwrap();
    let mut view = mailbox.select(false).unwrap();
    sync(&*mailbox, &mut view);

    set.delete_mailbox("Trash").unwrap();
    assert_matches!(
        Err(Error::MailboxNotFound { .. }),
        mailbox.update_selected(&mut view)
    );
    assert_matches!(
        Err(Error::MailboxNotFound { .. }),
        set.get_mailbox("Trash", false)
    );

    // The name can be reused for a new mailbox
    let reborn = set.add_mailbox("Trash").unwrap();
    assert_ne!(mailbox.mailbox_id(), reborn.mailbox_id());
    assert!(reborn.messages(FetchRequirement::METADATA).unwrap().is_empty());
}
