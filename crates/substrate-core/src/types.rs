use serde::{Deserialize, Serialize};

/// Opaque identifier for a conversation session.
pub type SessionId = String;

/// Orchestrator states for a single turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    BuildingContext,
    AwaitingModel,
    ToolDispatch,
    Done,
    Failed,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BuildingContext => "BUILDING_CONTEXT",
            Self::AwaitingModel => "AWAITING_MODEL",
            Self::ToolDispatch => "TOOL_DISPATCH",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}
