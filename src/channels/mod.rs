pub mod telegram;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Media carried by one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaKind {
    Photo { width: u32, height: u32 },
    Video { width: u32, height: u32 },
    Document { file_name: Option<String> },
}

/// A single photo/video/document, possibly one fragment of an album.
#[derive(Debug, Clone)]
pub struct MediaItem {
    pub chat_id: i64,
    pub message_id: i32,
    pub file_id: String,
    pub kind: MediaKind,
    pub caption: Option<String>,
}

/// An inbound message from any channel.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: String,
    pub chat_id: i64,
    pub sender_id: String,
    pub display_name: Option<String>,
    /// Shared by every message of one album.
    pub media_group_id: Option<String>,
    pub text: Option<String>,
    pub media: Option<MediaItem>,
}

/// An outbound message to send back through a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub channel: String,
    pub recipient_id: String,
    pub text: String,
}

/// Trait for external channel integrations.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    async fn start(
        &self,
        inbound_tx: mpsc::Sender<InboundMessage>,
        mut outbound_rx: mpsc::Receiver<OutboundMessage>,
    ) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Wait for queued outbound messages to be sent. Call after every
    /// `OutboundMessage` sender has been dropped.
    async fn drain_outbound(&self, timeout: Duration) -> Result<()>;
}
