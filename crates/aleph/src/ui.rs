//! The boundary to the terminal UI.
//!
//! Rendering is someone else's job; this module only defines the event
//! stream the UI consumes and the console fallback the binary ships with.

use aleph_core::permissions::ToolClass;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum UiEvent {
    StreamText(String),
    StreamThinking(String),
    ToolCallStart {
        tool_name: String,
        input: Value,
        tool_use_id: String,
    },
    ToolCallResult {
        tool_name: String,
        content: String,
        is_error: bool,
    },
    TurnComplete {
        result: Option<String>,
        is_error: bool,
    },
    /// A permission request awaiting a decision through the arbiter.
    PermissionPrompt(PermissionPromptView),
    /// Transient failure banner plus a log entry.
    Banner(String),
    Info(String),
}

#[derive(Debug, Clone)]
pub struct PermissionPromptView {
    pub id: String,
    pub tool_name: String,
    pub classification: ToolClass,
    pub diff: Option<String>,
}

/// Cloneable sender half handed to every producer of UI traffic.
#[derive(Debug, Clone)]
pub struct UiBridge {
    events_tx: mpsc::UnboundedSender<UiEvent>,
}

impl UiBridge {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (Self { events_tx }, events_rx)
    }

    /// Dropping the receiver silences the UI without failing producers.
    pub fn send(&self, event: UiEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn banner(&self, text: impl Into<String>) {
        self.send(UiEvent::Banner(text.into()));
    }

    pub fn info(&self, text: impl Into<String>) {
        self.send(UiEvent::Info(text.into()));
    }
}
