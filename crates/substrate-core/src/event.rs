use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::types::SessionId;

/// Runtime events published for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    // ── Turn lifecycle ─────────────────────────────────────────
    TurnStarted {
        session_id: SessionId,
        turn_id: Uuid,
        model: String,
    },
    ModelRequested {
        session_id: SessionId,
        turn_id: Uuid,
        iteration: u32,
    },
    TurnCompleted {
        session_id: SessionId,
        turn_id: Uuid,
        iterations: u32,
        depth_limited: bool,
    },
    TurnFailed {
        session_id: SessionId,
        turn_id: Uuid,
        reason: String,
    },

    // ── Tool lifecycle ─────────────────────────────────────────
    ToolDispatched {
        session_id: SessionId,
        tool_name: String,
        tool_call_id: String,
    },
    ToolCompleted {
        session_id: SessionId,
        tool_call_id: String,
        success: bool,
    },

    // ── Anomalies ──────────────────────────────────────────────
    /// The model wrote a textual tool invocation instead of a structured call.
    PromptContamination {
        session_id: SessionId,
        turn_id: Uuid,
        tool_name: Option<String>,
        excerpt: String,
    },

    // ── Memory ─────────────────────────────────────────────────
    MemoryBlockUpdated {
        label: String,
        operation: String,
    },
    ArchivalInserted {
        entry_id: Uuid,
        category: String,
    },

    // ── System ─────────────────────────────────────────────────
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
    Shutdown,
}

/// A broadcast-based event bus for system-wide pub/sub.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}
