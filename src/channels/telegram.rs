use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use teloxide::net::default_reqwest_settings;
use teloxide::payloads::GetUpdatesSetters;
use teloxide::requests::Requester;
use teloxide::types::{ChatId, Message, UpdateKind};
use teloxide::Bot;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::{Channel, InboundMessage, MediaItem, MediaKind, OutboundMessage};
use crate::config::TelegramConfig;
use crate::error::{RelayError, Result};

pub struct TelegramChannel {
    config: TelegramConfig,
    bot: Bot,
    running: Arc<AtomicBool>,
    sender: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig) -> Result<Self> {
        let token = config
            .bot_token
            .as_deref()
            .ok_or_else(|| RelayError::Channel("Telegram bot_token is required".to_string()))?;

        // Default teloxide client has a 17s timeout, too short for a 30s long-poll.
        let client = default_reqwest_settings()
            .timeout(std::time::Duration::from_secs(
                u64::from(config.poll_timeout_secs) + 30,
            ))
            .build()?;

        let bot = Bot::with_client(token, client);
        Ok(Self {
            config,
            bot,
            running: Arc::new(AtomicBool::new(false)),
            sender: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(
        &self,
        inbound_tx: mpsc::Sender<InboundMessage>,
        mut outbound_rx: mpsc::Receiver<OutboundMessage>,
    ) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let bot = self.bot.clone();
        let allowed_users = self.config.allowed_users.clone();
        let poll_timeout = self.config.poll_timeout_secs;

        let send_bot = bot.clone();
        let sender = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let chat_id: i64 = match msg.recipient_id.parse() {
                    Ok(id) => id,
                    Err(e) => {
                        error!("Invalid chat_id '{}': {e}", msg.recipient_id);
                        continue;
                    }
                };

                if let Err(e) = send_bot.send_message(ChatId(chat_id), &msg.text).await {
                    error!("Failed to send Telegram message: {e}");
                }
            }
            debug!("Outbound queue closed");
        });
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);

        let mut offset: i32 = 0;

        while running.load(Ordering::SeqCst) {
            let updates = match bot
                .get_updates()
                .offset(offset)
                .timeout(poll_timeout)
                .await
            {
                Ok(updates) => updates,
                Err(e) => {
                    warn!("Telegram getUpdates error: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            };

            for update in &updates {
                offset = update.id.0 as i32 + 1;

                let UpdateKind::Message(ref message) = update.kind else {
                    continue;
                };

                let Some(inbound) = to_inbound(message) else {
                    continue;
                };

                if let Ok(user_id) = inbound.sender_id.parse::<i64>() {
                    if !allowed_users.is_empty() && !allowed_users.contains(&user_id) {
                        debug!("Ignoring message from unauthorized user {user_id}");
                        continue;
                    }
                }

                if let Err(e) = inbound_tx.send(inbound).await {
                    error!("Failed to forward inbound message: {e}");
                }
            }
        }

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        info!("Telegram channel stopped");
        Ok(())
    }

    async fn drain_outbound(&self, timeout: Duration) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(sender) = sender else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, sender).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RelayError::Channel(format!("Outbound sender failed: {e}"))),
            Err(_) => Err(RelayError::Channel(format!(
                "Outbound queue not drained within {}s",
                timeout.as_secs()
            ))),
        }
    }
}

/// Flatten a Telegram message into the channel-neutral shape. Messages
/// without a sender or without text/media are dropped.
fn to_inbound(message: &Message) -> Option<InboundMessage> {
    let from = message.from.as_ref()?;
    let chat_id = message.chat.id.0;

    let media = media_of(message).map(|(file_id, kind)| MediaItem {
        chat_id,
        message_id: message.id.0,
        file_id,
        kind,
        caption: message.caption().map(str::to_string),
    });
    let text = message.text().map(str::to_string);

    if media.is_none() && text.is_none() {
        return None;
    }

    Some(InboundMessage {
        channel: "telegram".to_string(),
        chat_id,
        sender_id: from.id.0.to_string(),
        display_name: Some(from.first_name.clone()),
        media_group_id: message.media_group_id().map(|id| id.to_string()),
        text,
        media,
    })
}

fn media_of(message: &Message) -> Option<(String, MediaKind)> {
    if let Some(sizes) = message.photo() {
        // Telegram lists sizes smallest first.
        let photo = sizes.last()?;
        return Some((
            photo.file.id.to_string(),
            MediaKind::Photo {
                width: photo.width,
                height: photo.height,
            },
        ));
    }
    if let Some(video) = message.video() {
        return Some((
            video.file.id.to_string(),
            MediaKind::Video {
                width: video.width,
                height: video.height,
            },
        ));
    }
    if let Some(doc) = message.document() {
        return Some((
            doc.file.id.to_string(),
            MediaKind::Document {
                file_name: doc.file_name.clone(),
            },
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(payload: serde_json::Value) -> Message {
        serde_json::from_value(payload).expect("construct Message from JSON")
    }

    fn private_base(user_id: u64) -> serde_json::Value {
        serde_json::json!({
            "message_id": 5,
            "date": 1_700_000_000i64,
            "chat": {"id": user_id as i64, "type": "private", "first_name": "Ann"},
            "from": {"id": user_id, "is_bot": false, "first_name": "Ann"}
        })
    }

    #[test]
    fn test_album_photo_keeps_largest_size_and_group_id() {
        let mut json = private_base(42);
        json["media_group_id"] = serde_json::json!("mg-7");
        json["caption"] = serde_json::json!("holiday");
        json["photo"] = serde_json::json!([
            {"file_id": "small", "file_unique_id": "us", "width": 90, "height": 60, "file_size": 900},
            {"file_id": "big", "file_unique_id": "ub", "width": 1280, "height": 960, "file_size": 90000}
        ]);

        let inbound = to_inbound(&msg(json)).unwrap();
        assert_eq!(inbound.chat_id, 42);
        assert_eq!(inbound.sender_id, "42");
        assert_eq!(inbound.display_name.as_deref(), Some("Ann"));
        assert_eq!(inbound.media_group_id.as_deref(), Some("mg-7"));
        assert!(inbound.text.is_none());

        let media = inbound.media.unwrap();
        assert_eq!(media.file_id, "big");
        assert_eq!(media.message_id, 5);
        assert_eq!(media.caption.as_deref(), Some("holiday"));
        assert_eq!(
            media.kind,
            MediaKind::Photo {
                width: 1280,
                height: 960
            }
        );
    }

    #[test]
    fn test_document_without_group() {
        let mut json = private_base(3);
        json["document"] = serde_json::json!({
            "file_id": "doc1", "file_unique_id": "udoc1",
            "file_size": 512, "file_name": "notes.pdf",
            "mime_type": "application/pdf"
        });

        let inbound = to_inbound(&msg(json)).unwrap();
        assert!(inbound.media_group_id.is_none());
        let media = inbound.media.unwrap();
        assert_eq!(media.file_id, "doc1");
        assert_eq!(
            media.kind,
            MediaKind::Document {
                file_name: Some("notes.pdf".to_string())
            }
        );
    }

    #[test]
    fn test_text_message() {
        let mut json = private_base(3);
        json["text"] = serde_json::json!("/start");

        let inbound = to_inbound(&msg(json)).unwrap();
        assert_eq!(inbound.text.as_deref(), Some("/start"));
        assert!(inbound.media.is_none());
    }

    #[test]
    fn test_unsupported_message_dropped() {
        let mut json = private_base(3);
        json["location"] = serde_json::json!({"latitude": 1.5, "longitude": 2.5});

        assert!(to_inbound(&msg(json)).is_none());
    }
}
