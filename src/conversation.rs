//! Conversation context: history reconstruction and the model-facing window.

pub mod history;
pub mod window;

pub use history::{
    HistoryReconstructor, RESET_SENTINEL, merge_pending, reset_marker, trim_at_reset,
};
pub use window::{ConversationWindow, Role, WindowMessage, role_for};
