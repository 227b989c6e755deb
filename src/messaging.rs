//! Messaging platform seam and the Discord adapter.

pub mod discord;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use discord::{DiscordAdapter, DiscordHandler};
pub use traits::{Messaging, MessagingDyn};
