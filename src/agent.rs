//! Conversation processes: per-conversation actors, their registry and the dispatch pipeline.

pub mod channel;
pub mod dispatch;
pub mod registry;

pub use channel::{ConversationChannel, ConversationEvent};
pub use dispatch::{DispatchPipeline, TurnOutcome};
pub use registry::{ConversationRegistry, Intake};
