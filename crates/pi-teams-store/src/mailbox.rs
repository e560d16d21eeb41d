//! Durable per-recipient append-then-read queues.
//!
//! One JSON file per recipient per namespace, strictly FIFO by append
//! order. Delivery is at-least-once: a writer retrying after a crash can
//! duplicate a message, so receivers deduplicate by protocol `requestId`
//! or a (`from`, `timestamp`, text) composite.

use anyhow::Result;
use pi_teams_core::MailboxMessage;

use crate::lock::{with_lock, LockOptions};
use crate::{write_atomic, TeamPaths};

/// Read a mailbox file. Total: missing or torn files read as empty.
fn load(paths: &TeamPaths, namespace: &str, recipient: &str) -> Vec<MailboxMessage> {
    let file = paths.mailbox_file(namespace, recipient);
    let content = match std::fs::read_to_string(&file) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };
    serde_json::from_str(&content).unwrap_or_default()
}

fn save(
    paths: &TeamPaths,
    namespace: &str,
    recipient: &str,
    messages: &[MailboxMessage],
) -> Result<()> {
    let file = paths.mailbox_file(namespace, recipient);
    let data = serde_json::to_string_pretty(messages)?;
    write_atomic(&file, data.as_bytes())
}

/// Append a message to a recipient's mailbox, creating parent directories
/// on demand. The message is stored unread regardless of its `read` flag.
pub fn write_to_mailbox(
    paths: &TeamPaths,
    namespace: &str,
    recipient: &str,
    msg: MailboxMessage,
) -> Result<()> {
    let lock = paths.mailbox_lock(namespace, recipient);
    with_lock(&lock, LockOptions::default(), || {
        let mut messages = load(paths, namespace, recipient);
        messages.push(MailboxMessage {
            read: false,
            ..msg
        });
        save(paths, namespace, recipient, &messages)
    })
}

/// Read a recipient's inbox in append order. Does not mutate; readers
/// proceed without the lock and tolerate torn reads as empty.
pub fn read_inbox(
    paths: &TeamPaths,
    namespace: &str,
    recipient: &str,
    unread_only: bool,
) -> Vec<MailboxMessage> {
    let messages = load(paths, namespace, recipient);
    if unread_only {
        messages.into_iter().filter(|m| !m.read).collect()
    } else {
        messages
    }
}

/// Flip `read` on messages matching `predicate`. Returns how many flipped.
pub fn mark_read(
    paths: &TeamPaths,
    namespace: &str,
    recipient: &str,
    predicate: impl Fn(&MailboxMessage) -> bool,
) -> Result<usize> {
    let lock = paths.mailbox_lock(namespace, recipient);
    with_lock(&lock, LockOptions::default(), || {
        let mut messages = load(paths, namespace, recipient);
        let mut flipped = 0;
        for msg in messages.iter_mut() {
            if !msg.read && predicate(msg) {
                msg.read = true;
                flipped += 1;
            }
        }
        if flipped > 0 {
            save(paths, namespace, recipient, &messages)?;
        }
        Ok(flipped)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TEAM_NAMESPACE;

    fn team(tmp: &tempfile::TempDir) -> TeamPaths {
        let paths = TeamPaths::discover(tmp.path(), "t1");
        paths.ensure_layout().unwrap();
        paths
    }

    fn msg(from: &str, text: &str, ts: &str) -> MailboxMessage {
        MailboxMessage::new(from, text, ts)
    }

    #[test]
    fn append_then_read_preserves_fifo_order() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = team(&tmp);
        for i in 0..5 {
            write_to_mailbox(
                &paths,
                TEAM_NAMESPACE,
                "w1",
                msg("lead", &format!("m{i}"), "2026-01-01T00:00:00Z"),
            )
            .unwrap();
        }
        let inbox = read_inbox(&paths, TEAM_NAMESPACE, "w1", false);
        let texts: Vec<_> = inbox.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn write_forces_unread() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = team(&tmp);
        let mut m = msg("lead", "hi", "2026-01-01T00:00:00Z");
        m.read = true;
        write_to_mailbox(&paths, TEAM_NAMESPACE, "w1", m).unwrap();
        let inbox = read_inbox(&paths, TEAM_NAMESPACE, "w1", true);
        assert_eq!(inbox.len(), 1);
    }

    #[test]
    fn unread_only_filters_acknowledged() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = team(&tmp);
        write_to_mailbox(&paths, TEAM_NAMESPACE, "w1", msg("lead", "a", "t1")).unwrap();
        write_to_mailbox(&paths, TEAM_NAMESPACE, "w1", msg("lead", "b", "t2")).unwrap();

        let flipped = mark_read(&paths, TEAM_NAMESPACE, "w1", |m| m.text == "a").unwrap();
        assert_eq!(flipped, 1);

        let unread = read_inbox(&paths, TEAM_NAMESPACE, "w1", true);
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].text, "b");

        // Acknowledged messages are retained, not purged.
        let all = read_inbox(&paths, TEAM_NAMESPACE, "w1", false);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn mark_read_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = team(&tmp);
        write_to_mailbox(&paths, TEAM_NAMESPACE, "w1", msg("lead", "a", "t1")).unwrap();
        assert_eq!(mark_read(&paths, TEAM_NAMESPACE, "w1", |_| true).unwrap(), 1);
        assert_eq!(mark_read(&paths, TEAM_NAMESPACE, "w1", |_| true).unwrap(), 0);
    }

    #[test]
    fn namespaces_are_independent() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = team(&tmp);
        write_to_mailbox(&paths, TEAM_NAMESPACE, "w1", msg("lead", "ctl", "t1")).unwrap();
        write_to_mailbox(&paths, "t1", "w1", msg("lead", "task", "t1")).unwrap();

        assert_eq!(read_inbox(&paths, TEAM_NAMESPACE, "w1", false).len(), 1);
        assert_eq!(read_inbox(&paths, "t1", "w1", false).len(), 1);
    }

    #[test]
    fn missing_mailbox_reads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = team(&tmp);
        assert!(read_inbox(&paths, TEAM_NAMESPACE, "ghost", false).is_empty());
    }

    #[test]
    fn corrupt_mailbox_reads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = team(&tmp);
        let file = paths.mailbox_file(TEAM_NAMESPACE, "w1");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, "{{{").unwrap();
        assert!(read_inbox(&paths, TEAM_NAMESPACE, "w1", false).is_empty());
    }

    #[test]
    fn recipient_names_are_sanitized_to_one_file() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = team(&tmp);
        write_to_mailbox(&paths, TEAM_NAMESPACE, "w one", msg("lead", "a", "t1")).unwrap();
        let inbox = read_inbox(&paths, TEAM_NAMESPACE, "w-one", false);
        assert_eq!(inbox.len(), 1);
    }
}
