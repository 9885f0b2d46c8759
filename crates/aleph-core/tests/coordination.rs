//! Cross-module coordination properties exercised the way concurrent
//! agents hit them: separate store instances over one shared directory.

use std::sync::Arc;
use std::thread;

use tempfile::TempDir;

use aleph_core::board::{BoardError, TaskBoard, TaskStatus};
use aleph_core::channel::ChannelRegistry;
use aleph_core::inbox::{Draft, InboxStore};
use aleph_core::message::{Message, Priority};

fn store(dir: &TempDir) -> InboxStore {
    InboxStore::new(dir.path().join("inbox"), dir.path().join("quarantine"))
}

fn draft(from: &str, summary: &str, priority: Priority) -> Draft {
    Draft {
        from: from.to_owned(),
        summary: summary.to_owned(),
        body: format!("body from {from}"),
        priority,
        channel: None,
    }
}

#[test]
fn every_delivery_lands_as_exactly_one_wellformed_file() {
    let dir = TempDir::new().unwrap();

    // Separate stores simulate separate sender processes.
    let mut handles = Vec::new();
    for sender in 0..6 {
        let root = dir.path().to_path_buf();
        handles.push(thread::spawn(move || {
            let store = InboxStore::new(root.join("inbox"), root.join("quarantine"));
            let mut ids = Vec::new();
            for i in 0..20 {
                let from = format!("aleph-sender{sender:03}");
                ids.push(
                    store
                        .deliver("target", &draft(&from, &format!("m{sender}-{i}"), Priority::Normal))
                        .unwrap(),
                );
            }
            ids
        }));
    }
    let mut all_ids: Vec<String> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    let total = all_ids.len();
    all_ids.sort();
    all_ids.dedup();
    assert_eq!(all_ids.len(), total, "every delivery got a distinct id");

    let reader = store(&dir);
    let inbox_dir = reader.inbox_dir("target").unwrap();
    for id in &all_ids {
        let path = inbox_dir.join(format!("{id}.md"));
        let text = std::fs::read_to_string(&path).unwrap();
        let message = Message::parse(&text).unwrap();
        assert_eq!(&message.header.message_id, id);
        assert_eq!(message.header.to.as_deref(), Some("target"));
        assert!(message.header.from.starts_with("aleph-sender"));
    }

    let listing = reader.list_unread("target").unwrap();
    assert_eq!(listing.messages.len(), total);
    assert!(listing.quarantined.is_empty());
}

#[test]
fn marking_everything_read_empties_the_listing() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);

    let mut ids = Vec::new();
    for i in 0..10 {
        let priority = match i % 3 {
            0 => Priority::Low,
            1 => Priority::Normal,
            _ => Priority::High,
        };
        ids.push(store.deliver("r", &draft("s", &format!("m{i}"), priority)).unwrap());
    }
    for id in &ids {
        store.mark_read("r", id).unwrap();
    }
    assert!(store.list_unread("r").unwrap().messages.is_empty());
}

#[test]
fn listing_orders_high_before_normal_before_low_then_oldest_first() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);

    let plan = [
        ("n1", Priority::Normal),
        ("h1", Priority::High),
        ("l1", Priority::Low),
        ("h2", Priority::High),
        ("n2", Priority::Normal),
        ("l2", Priority::Low),
    ];
    for (summary, priority) in plan {
        store.deliver("r", &draft("s", summary, priority)).unwrap();
    }

    let got: Vec<String> = store
        .list_unread("r")
        .unwrap()
        .messages
        .into_iter()
        .map(|m| m.summary)
        .collect();
    assert_eq!(got, vec!["h1", "h2", "n1", "n2", "l1", "l2"]);
}

#[test]
fn channel_broadcast_reaches_each_subscriber_exactly_once() {
    let dir = TempDir::new().unwrap();
    let channels = ChannelRegistry::new(dir.path().join("channels"));
    let inbox = store(&dir);

    for agent in ["x", "y", "z"] {
        channels.subscribe(agent, "exploration").unwrap();
    }
    channels
        .broadcast(&inbox, "x", "exploration", "found it", "", Priority::Normal)
        .unwrap();

    for agent in ["y", "z"] {
        let listing = inbox.list_unread(agent).unwrap();
        assert_eq!(listing.messages.len(), 1, "agent {agent}");
        let text = std::fs::read_to_string(&listing.messages[0].path).unwrap();
        let message = Message::parse(&text).unwrap();
        assert_eq!(message.header.channel.as_deref(), Some("exploration"));
        assert_eq!(message.header.to, None);
    }
    assert!(inbox.list_unread("x").unwrap().messages.is_empty());
}

#[test]
fn racing_claims_from_separate_boards_have_one_winner() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("TODO.yml");
    std::fs::write(
        &path,
        "tasks:\n  - id: '2.1'\n    description: shared work\n    status: open\n",
    )
    .unwrap();

    let barrier = Arc::new(std::sync::Barrier::new(8));
    let mut handles = Vec::new();
    for n in 0..8 {
        let path = path.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            // One TaskBoard per thread, like one per process.
            let board = TaskBoard::new(path);
            barrier.wait();
            board.claim("2.1", &format!("agent-{n}"))
        }));
    }

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
    assert_eq!(winners.len(), 1);

    let winner_id = winners[0].as_ref().unwrap().assignee.clone().unwrap();
    for result in results.iter().filter(|r| r.is_err()) {
        match result.as_ref().unwrap_err() {
            BoardError::AlreadyClaimed { holder, .. } => assert_eq!(holder, &winner_id),
            other => panic!("loser saw {other:?}"),
        }
    }

    // The loser cannot push the task to done either.
    let board = TaskBoard::new(path);
    let err = board.set_status("2.1", TaskStatus::Done, "someone-else").unwrap_err();
    assert!(matches!(err, BoardError::InvalidTransition { .. }));
}

#[test]
fn illegal_transitions_never_change_the_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("TODO.yml");
    std::fs::write(
        &path,
        "tasks:\n  - id: '1'\n    description: t\n    status: open\n",
    )
    .unwrap();
    let board = TaskBoard::new(path.clone());

    for status in [TaskStatus::Done, TaskStatus::Blocked, TaskStatus::InProgress] {
        let before = std::fs::read_to_string(&path).unwrap();
        let err = board.set_status("1", status, "a").unwrap_err();
        assert!(matches!(err, BoardError::InvalidTransition { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }
}

#[test]
fn message_file_round_trip_is_stable() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let id = store
        .deliver("r", &draft("aleph-writer00", "round trip", Priority::High))
        .unwrap();

    let path = store.inbox_dir("r").unwrap().join(format!("{id}.md"));
    let bytes = std::fs::read(&path).unwrap();
    let message = Message::parse(std::str::from_utf8(&bytes).unwrap()).unwrap();
    let rendered = message.render().unwrap();
    assert_eq!(rendered.as_bytes(), &bytes[..]);
}
