//! Delivery-mode selection for incoming mail.
//!
//! Busy recipients get summaries piggybacked on the next PostToolUse hook;
//! idle recipients are woken with a synthetic user-turn. The tracker below
//! is the shared source of truth for which mode applies, and for the
//! per-turn dedup set that keeps a summary from being injected twice in one
//! turn (across turns a message stays eligible until it is marked read).

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::sync::mpsc;

use aleph_core::fsio::DirWatcher;
use aleph_core::inbox::{InboxStore, UnreadSummary};
use aleph_core::stream::{user_turn, InputMessage};

use crate::ui::UiBridge;

pub struct TurnTracker {
    busy: AtomicBool,
    in_flight_tool_calls: AtomicU32,
    seen_this_turn: StdMutex<BTreeSet<String>>,
    last_turn_boundary: StdMutex<Instant>,
}

impl Default for TurnTracker {
    fn default() -> Self {
        Self {
            busy: AtomicBool::new(false),
            in_flight_tool_calls: AtomicU32::new(0),
            seen_this_turn: StdMutex::new(BTreeSet::new()),
            last_turn_boundary: StdMutex::new(Instant::now()),
        }
    }
}

impl TurnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight_tool_calls.load(Ordering::SeqCst)
    }

    pub fn on_user_turn(&self) {
        self.busy.store(true, Ordering::SeqCst);
    }

    pub fn on_tool_use_start(&self) {
        self.in_flight_tool_calls.fetch_add(1, Ordering::SeqCst);
        self.busy.store(true, Ordering::SeqCst);
    }

    pub fn on_tool_use_complete(&self) {
        let _ = self
            .in_flight_tool_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn on_turn_end(&self) {
        self.busy.store(false, Ordering::SeqCst);
        self.in_flight_tool_calls.store(0, Ordering::SeqCst);
        self.clear_seen();
        if let Ok(mut boundary) = self.last_turn_boundary.lock() {
            *boundary = Instant::now();
        }
    }

    pub fn last_turn_boundary(&self) -> Instant {
        match self.last_turn_boundary.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Keep only ids not yet surfaced this turn, marking them surfaced.
    pub fn claim_unseen(&self, ids: &[String]) -> Vec<String> {
        let mut seen = match self.seen_this_turn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ids.iter()
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect()
    }

    fn clear_seen(&self) {
        match self.seen_this_turn.lock() {
            Ok(mut guard) => guard.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

/// Watches the agent's own inbox and wakes it when idle.
pub struct PushDispatcher {
    inbox: Arc<InboxStore>,
    agent_id: String,
    turns: Arc<TurnTracker>,
    watcher: StdMutex<DirWatcher>,
    outbound_tx: mpsc::Sender<InputMessage>,
    ui: UiBridge,
}

pub fn wake_up_text(message: &UnreadSummary, remaining: usize) -> String {
    let mut text = format!(
        "[Message from {}] {} (full message at {})",
        message.from,
        message.summary,
        message.path.display()
    );
    if remaining > 0 {
        text.push_str(&format!(" (+{remaining} more unread)"));
    }
    text
}

impl PushDispatcher {
    pub fn new(
        inbox: Arc<InboxStore>,
        agent_id: String,
        turns: Arc<TurnTracker>,
        outbound_tx: mpsc::Sender<InputMessage>,
        ui: UiBridge,
    ) -> Self {
        let watch_dir = inbox
            .inbox_dir(&agent_id)
            .unwrap_or_else(|_| std::path::PathBuf::from("."));
        Self {
            inbox,
            agent_id,
            turns,
            watcher: StdMutex::new(DirWatcher::new(watch_dir)),
            outbound_tx,
            ui,
        }
    }

    /// One poll tick, driven from the main loop at the watch cadence.
    /// Busy agents are left alone here; the PostToolUse hook carries their
    /// mail instead.
    pub async fn tick(&self) {
        {
            let mut watcher = match self.watcher.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Err(err) = watcher.scan() {
                tracing::debug!(error = %err, "inbox watch scan failed");
            }
            // Lossy watch: the listing below is the reconciliation pass.
        }

        if self.turns.is_busy() {
            return;
        }

        let listing = match self.inbox.list_unread(&self.agent_id) {
            Ok(listing) => listing,
            Err(err) => {
                tracing::warn!(error = %err, "inbox listing failed");
                return;
            }
        };
        for quarantined in &listing.quarantined {
            self.ui
                .banner(format!("quarantined malformed message: {}", quarantined.display()));
        }
        if listing.messages.is_empty() {
            return;
        }

        let ids: Vec<String> = listing
            .messages
            .iter()
            .map(|m| m.message_id.clone())
            .collect();
        let fresh = self.turns.claim_unseen(&ids);
        let Some(top) = listing
            .messages
            .iter()
            .find(|m| fresh.contains(&m.message_id))
        else {
            return;
        };

        let text = wake_up_text(top, listing.messages.len() - 1);
        tracing::info!(
            message_id = %top.message_id,
            from = %top.from,
            "waking idle agent for incoming message"
        );
        if self.outbound_tx.send(user_turn(text)).await.is_ok() {
            self.turns.on_user_turn();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aleph_core::inbox::Draft;
    use aleph_core::message::Priority;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Arc<InboxStore>, Arc<TurnTracker>, PushDispatcher, mpsc::Receiver<InputMessage>) {
        let inbox = Arc::new(InboxStore::new(
            dir.path().join("inbox"),
            dir.path().join("quarantine"),
        ));
        let turns = Arc::new(TurnTracker::new());
        let (outbound_tx, outbound_rx) = mpsc::channel(8);
        let (ui, _ui_rx) = UiBridge::new();
        let dispatcher = PushDispatcher::new(
            inbox.clone(),
            "aleph-self0000".to_owned(),
            turns.clone(),
            outbound_tx,
            ui,
        );
        (inbox, turns, dispatcher, outbound_rx)
    }

    fn draft(summary: &str, priority: Priority) -> Draft {
        Draft {
            from: "aleph-peer0000".to_owned(),
            summary: summary.to_owned(),
            body: "body".to_owned(),
            priority,
            channel: None,
        }
    }

    #[tokio::test]
    async fn idle_agent_is_woken_with_synthetic_turn() {
        let dir = TempDir::new().unwrap();
        let (inbox, turns, dispatcher, mut outbound_rx) = setup(&dir);

        inbox
            .deliver("aleph-self0000", &draft("urgent", Priority::High))
            .unwrap();
        dispatcher.tick().await;

        let injected = outbound_rx.try_recv().unwrap();
        assert!(injected
            .message
            .content
            .starts_with("[Message from aleph-peer0000] urgent"));
        assert!(injected.message.content.contains("full message at"));
        assert!(turns.is_busy());
    }

    #[tokio::test]
    async fn busy_agent_is_not_woken() {
        let dir = TempDir::new().unwrap();
        let (inbox, turns, dispatcher, mut outbound_rx) = setup(&dir);

        turns.on_tool_use_start();
        inbox
            .deliver("aleph-self0000", &draft("later", Priority::Normal))
            .unwrap();
        dispatcher.tick().await;

        assert!(outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn same_message_never_injected_twice_in_one_turn() {
        let dir = TempDir::new().unwrap();
        let (inbox, turns, dispatcher, mut outbound_rx) = setup(&dir);

        inbox
            .deliver("aleph-self0000", &draft("once", Priority::Normal))
            .unwrap();
        dispatcher.tick().await;
        assert!(outbound_rx.try_recv().is_ok());

        // Still unread, but the turn has not ended: no re-injection even if
        // the agent goes idle again without a boundary.
        turns.busy.store(false, Ordering::SeqCst);
        dispatcher.tick().await;
        assert!(outbound_rx.try_recv().is_err());

        // After the turn boundary the unread message is eligible again:
        // at-least-once until marked read.
        turns.on_turn_end();
        dispatcher.tick().await;
        assert!(outbound_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn read_messages_never_wake_anyone() {
        let dir = TempDir::new().unwrap();
        let (inbox, _turns, dispatcher, mut outbound_rx) = setup(&dir);

        let id = inbox
            .deliver("aleph-self0000", &draft("old news", Priority::Normal))
            .unwrap();
        inbox.mark_read("aleph-self0000", &id).unwrap();

        dispatcher.tick().await;
        assert!(outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wake_up_mentions_remaining_backlog() {
        let dir = TempDir::new().unwrap();
        let (inbox, _turns, dispatcher, mut outbound_rx) = setup(&dir);

        inbox
            .deliver("aleph-self0000", &draft("first", Priority::High))
            .unwrap();
        inbox
            .deliver("aleph-self0000", &draft("second", Priority::Low))
            .unwrap();
        dispatcher.tick().await;

        let injected = outbound_rx.try_recv().unwrap();
        assert!(injected.message.content.contains("first"));
        assert!(injected.message.content.contains("+1 more unread"));
    }

    #[test]
    fn tracker_turn_cycle() {
        let turns = TurnTracker::new();
        assert!(!turns.is_busy());

        turns.on_tool_use_start();
        turns.on_tool_use_start();
        assert!(turns.is_busy());
        assert_eq!(turns.in_flight(), 2);

        turns.on_tool_use_complete();
        assert_eq!(turns.in_flight(), 1);

        let before = turns.last_turn_boundary();
        turns.on_turn_end();
        assert!(!turns.is_busy());
        assert_eq!(turns.in_flight(), 0);
        assert!(turns.last_turn_boundary() >= before);
    }

    #[test]
    fn claim_unseen_dedups_until_turn_end() {
        let turns = TurnTracker::new();
        let ids = vec!["m1".to_owned(), "m2".to_owned()];

        assert_eq!(turns.claim_unseen(&ids), ids);
        assert!(turns.claim_unseen(&ids).is_empty());

        turns.on_turn_end();
        assert_eq!(turns.claim_unseen(&ids), ids);
    }
}
