use serde::Serialize;

/// Events emitted to the caller while a chat turn runs, in state-machine order.
/// `Done` is always last when the caller is still listening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// Human-readable "doing X now" line.
    Status { message: String },
    /// Fragment of the final answer.
    Token { text: String },
    /// A cart-mutating tool just ran.
    CartChanged,
    Done { conversation_id: String },
}
