use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::buffer::{CorrelationBuffer, FlushHandler, Group};
use crate::channels::{InboundMessage, MediaItem, MediaKind, OutboundMessage};
use crate::error::{RelayError, Result};

const HELP_TEXT: &str = "Album relay bot\n\n\
Send me several photos at once (an album) and I will answer once for the \
whole album instead of once per photo.\n\n\
Commands:\n/start - show this message\n/help - show this message";

/// Chat-scoped correlation key so equal group ids from different chats
/// never merge.
pub fn album_key(chat_id: i64, media_group_id: &str) -> String {
    format!("{chat_id}:{media_group_id}")
}

/// Routes inbound messages: commands are answered directly, media goes
/// through the correlation buffer.
pub struct AlbumGateway {
    buffer: CorrelationBuffer<MediaItem>,
}

impl AlbumGateway {
    pub fn new(buffer: CorrelationBuffer<MediaItem>) -> Self {
        Self { buffer }
    }

    pub fn buffer(&self) -> &CorrelationBuffer<MediaItem> {
        &self.buffer
    }

    /// Returns a reply to send right away, if any. Album replies are sent
    /// later by the flush consumer.
    pub fn handle_message(&self, inbound: InboundMessage) -> Result<Option<OutboundMessage>> {
        if let Some(media) = inbound.media {
            let key = inbound
                .media_group_id
                .as_deref()
                .map(|id| album_key(inbound.chat_id, id));
            let sequence = self.buffer.submit(key.as_deref(), media)?;
            debug!(
                "Queued media #{sequence} from {} (group {})",
                inbound.sender_id,
                key.as_deref().unwrap_or("<none>")
            );
            return Ok(None);
        }

        let Some(text) = inbound.text else {
            return Ok(None);
        };

        let command = text.split_whitespace().next().unwrap_or_default();
        // "/start@my_bot" in group chats
        let command = command.split('@').next().unwrap_or_default();
        match command {
            "/start" | "/help" => Ok(Some(OutboundMessage {
                channel: inbound.channel,
                recipient_id: inbound.chat_id.to_string(),
                text: HELP_TEXT.to_string(),
            })),
            _ => Ok(None),
        }
    }

    /// Route every inbound message until the inbound channel closes, so
    /// fragments already received reach the buffer before it is shut down.
    pub async fn run(
        &self,
        mut inbound_rx: mpsc::Receiver<InboundMessage>,
        reply_tx: mpsc::Sender<OutboundMessage>,
    ) {
        while let Some(inbound) = inbound_rx.recv().await {
            match self.handle_message(inbound) {
                Ok(Some(reply)) => {
                    if let Err(e) = reply_tx.send(reply).await {
                        error!("Failed to send outbound: {e}");
                    }
                }
                Ok(None) => {}
                Err(RelayError::BufferClosed) => {
                    error!("Buffer closed with inbound messages still queued");
                    break;
                }
                Err(e) => error!("Gateway error: {e}"),
            }
        }
        debug!("Inbound channel closed");
    }
}

/// Flush consumer: one summary reply per completed group.
pub struct AlbumReplier {
    channel: String,
    outbound_tx: mpsc::Sender<OutboundMessage>,
}

impl AlbumReplier {
    pub fn new(channel: impl Into<String>, outbound_tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            channel: channel.into(),
            outbound_tx,
        }
    }
}

#[async_trait]
impl FlushHandler<MediaItem> for AlbumReplier {
    async fn on_flush(&self, group: Group<MediaItem>) -> Result<()> {
        let Some(first) = group.entries.first() else {
            return Ok(());
        };
        let recipient_id = first.payload.chat_id.to_string();
        let text = render_reply(&group);

        self.outbound_tx
            .send(OutboundMessage {
                channel: self.channel.clone(),
                recipient_id,
                text,
            })
            .await
            .map_err(|e| RelayError::Consumer(format!("Outbound channel closed: {e}")))?;

        if group.key.is_some() {
            info!(
                "Answered album {} ({} item(s)) once",
                group.key.as_deref().unwrap_or_default(),
                group.len()
            );
        }
        Ok(())
    }
}

fn describe(kind: &MediaKind) -> String {
    match kind {
        MediaKind::Photo { width, height } => format!("{width}x{height} px (photo)"),
        MediaKind::Video { width, height } => format!("{width}x{height} px (video)"),
        MediaKind::Document { file_name } => {
            format!("{} (document)", file_name.as_deref().unwrap_or("unnamed"))
        }
    }
}

/// Reply text for a flushed group.
pub fn render_reply(group: &Group<MediaItem>) -> String {
    let Some(key) = group.key.as_deref() else {
        return render_single(group.payloads().next());
    };

    let media_group_id = key.split_once(':').map_or(key, |(_, id)| id);
    let photos = group
        .payloads()
        .filter(|m| matches!(m.kind, MediaKind::Photo { .. }))
        .count();

    let mut out = format!(
        "Received an album!\n\nItems: {}\nPhotos: {photos}\nMedia group ID: {media_group_id}\n\nContents:\n",
        group.len()
    );
    for item in group.payloads() {
        out.push_str("  • ");
        out.push_str(&describe(&item.kind));
        out.push('\n');
    }
    if let Some(caption) = group.payloads().find_map(|m| m.caption.as_deref()) {
        out.push_str(&format!("\nCaption: {caption}\n"));
    }
    out.push_str("\nHandled once for the whole album.");
    out
}

fn render_single(item: Option<&MediaItem>) -> String {
    match item.map(|m| &m.kind) {
        Some(MediaKind::Photo { width, height }) => format!(
            "Received a single photo\n\nSize: {width}x{height} px\n\n\
             Send several photos at once to make an album!"
        ),
        Some(kind) => format!("Received a single file: {}", describe(kind)),
        None => "Received an empty message".to_string(),
    }
}
