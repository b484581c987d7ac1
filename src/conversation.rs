//! Turn log <-> in-memory turns.

use tracing::debug;

use crate::store::TurnRecord;
use crate::types::{Role, Turn};

/// Convert the persisted log into typed turns, preserving order.
///
/// Persisted tool results become assistant-visible notes rather than live
/// tool messages: the assistant turn that requested them is not part of the
/// log, and a provider rejects a tool message without its request.
pub fn normalize(records: &[TurnRecord]) -> Vec<Turn> {
    records
        .iter()
        .map(|r| match r.role {
            Role::User => Turn::user(r.content.clone()),
            Role::Assistant => Turn::assistant(r.content.clone()),
            Role::System => Turn::system(r.content.clone()),
            Role::Tool => {
                let name = r.tool_name.as_deref().unwrap_or("tool");
                debug!(tool = name, "folding persisted tool result into history");
                Turn::assistant(format!("[{name} result] {}", r.content))
            }
        })
        .collect()
}

/// Plain-text transcript of the turns, one speaker-prefixed line per turn.
pub fn transcript(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|t| {
            let speaker = match t.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
                Role::Tool => "Tool",
            };
            format!("{speaker}: {}", t.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
