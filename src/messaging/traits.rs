//! Messaging trait and dynamic dispatch companion.

use crate::error::Result;
use crate::{Attachment, ChannelId, ConversationId, InboundMessage, OutboundResponse};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`MessagingDyn`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Static trait for platform adapters.
/// Use this for type-safe implementations.
pub trait Messaging: Send + Sync + 'static {
    /// Unique name for this adapter.
    fn name(&self) -> &str;

    /// Post a plain text message.
    fn send_text(&self, channel_id: ChannelId, text: &str) -> impl Future<Output = Result<()>> + Send;

    /// Upload a file attachment.
    fn send_file(
        &self,
        channel_id: ChannelId,
        data: Vec<u8>,
        filename: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Update the bot's visible status (its display name) in a conversation.
    fn set_display_status(
        &self,
        conversation_id: ConversationId,
        status: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Up to `limit` most recent channel messages, newest first.
    fn fetch_history(
        &self,
        channel_id: ChannelId,
        limit: u8,
    ) -> impl Future<Output = Result<Vec<InboundMessage>>> + Send;

    /// Raw bytes of an attachment.
    fn download_attachment(
        &self,
        attachment: &Attachment,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Show a typing indicator.
    fn send_typing(&self, channel_id: ChannelId) -> impl Future<Output = Result<()>> + Send {
        let _ = channel_id;
        async { Ok(()) }
    }

    /// Deliver an outbound response.
    fn send(
        &self,
        channel_id: ChannelId,
        response: OutboundResponse,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            match response {
                OutboundResponse::Text(text) => self.send_text(channel_id, &text).await,
                OutboundResponse::File { filename, data } => {
                    self.send_file(channel_id, data, &filename).await
                }
            }
        }
    }
}

/// Dynamic trait for runtime polymorphism.
/// Use this when you need `Arc<dyn MessagingDyn>` for storing different adapters.
pub trait MessagingDyn: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn send_text<'a>(&'a self, channel_id: ChannelId, text: &'a str) -> BoxFuture<'a, Result<()>>;

    fn send_file<'a>(
        &'a self,
        channel_id: ChannelId,
        data: Vec<u8>,
        filename: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    fn set_display_status<'a>(
        &'a self,
        conversation_id: ConversationId,
        status: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    fn fetch_history<'a>(
        &'a self,
        channel_id: ChannelId,
        limit: u8,
    ) -> BoxFuture<'a, Result<Vec<InboundMessage>>>;

    fn download_attachment<'a>(
        &'a self,
        attachment: &'a Attachment,
    ) -> BoxFuture<'a, Result<Vec<u8>>>;

    fn send_typing<'a>(&'a self, channel_id: ChannelId) -> BoxFuture<'a, Result<()>>;

    fn send<'a>(
        &'a self,
        channel_id: ChannelId,
        response: OutboundResponse,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Blanket implementation: any type implementing Messaging automatically implements MessagingDyn.
impl<T: Messaging> MessagingDyn for T {
    fn name(&self) -> &str {
        Messaging::name(self)
    }

    fn send_text<'a>(&'a self, channel_id: ChannelId, text: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(Messaging::send_text(self, channel_id, text))
    }

    fn send_file<'a>(
        &'a self,
        channel_id: ChannelId,
        data: Vec<u8>,
        filename: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(Messaging::send_file(self, channel_id, data, filename))
    }

    fn set_display_status<'a>(
        &'a self,
        conversation_id: ConversationId,
        status: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(Messaging::set_display_status(self, conversation_id, status))
    }

    fn fetch_history<'a>(
        &'a self,
        channel_id: ChannelId,
        limit: u8,
    ) -> BoxFuture<'a, Result<Vec<InboundMessage>>> {
        Box::pin(Messaging::fetch_history(self, channel_id, limit))
    }

    fn download_attachment<'a>(
        &'a self,
        attachment: &'a Attachment,
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(Messaging::download_attachment(self, attachment))
    }

    fn send_typing<'a>(&'a self, channel_id: ChannelId) -> BoxFuture<'a, Result<()>> {
        Box::pin(Messaging::send_typing(self, channel_id))
    }

    fn send<'a>(
        &'a self,
        channel_id: ChannelId,
        response: OutboundResponse,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(Messaging::send(self, channel_id, response))
    }
}
