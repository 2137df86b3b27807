pub mod telegram;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::error::BotError;

const DEFAULT_VOICE_MIME: &str = "audio/ogg";
const DEFAULT_VOICE_EXTENSION: &str = "ogg";

/// One incoming event from getUpdates.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub voice: Option<VoiceAttachment>,
    #[serde(default)]
    pub new_chat_member: Option<User>,
    #[serde(default)]
    pub new_chat_members: Vec<User>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[allow(dead_code)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
pub struct VoiceAttachment {
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// What the dispatcher should do with a message, in precedence order.
#[derive(Debug, PartialEq)]
pub enum MessageKind<'a> {
    Text(&'a str),
    MemberAdded,
    Voice(&'a VoiceAttachment),
    Other,
}

impl Update {
    /// Decode one entry of a getUpdates result.
    ///
    /// A message that fails to decode is dropped but the update is kept, so
    /// its id still moves the cursor forward. Entries without an integer
    /// `update_id` are skipped.
    pub fn from_value(value: serde_json::Value) -> Option<Self> {
        let update_id = value.get("update_id").and_then(serde_json::Value::as_i64);
        match serde_json::from_value::<Update>(value) {
            Ok(update) => Some(update),
            Err(e) => match update_id {
                Some(update_id) => {
                    warn!("Update {} has an undecodable message: {}", update_id, e);
                    Some(Update {
                        update_id,
                        message: None,
                    })
                }
                None => {
                    warn!("Skipping update without update_id: {}", e);
                    None
                }
            },
        }
    }
}

impl Message {
    pub fn member_added(&self) -> bool {
        self.new_chat_member.is_some() || !self.new_chat_members.is_empty()
    }

    pub fn kind(&self) -> MessageKind<'_> {
        if let Some(text) = self.text.as_deref().filter(|t| !t.is_empty()) {
            MessageKind::Text(text)
        } else if self.member_added() {
            MessageKind::MemberAdded
        } else if let Some(voice) = &self.voice {
            MessageKind::Voice(voice)
        } else {
            MessageKind::Other
        }
    }
}

impl VoiceAttachment {
    pub fn mime_type(&self) -> &str {
        self.mime_type.as_deref().unwrap_or(DEFAULT_VOICE_MIME)
    }

    /// File extension taken from the MIME subtype (`audio/mpeg` -> `mpeg`).
    pub fn extension(&self) -> &str {
        match self.mime_type().rsplit_once('/') {
            Some((_, subtype)) if !subtype.is_empty() => subtype,
            _ => DEFAULT_VOICE_EXTENSION,
        }
    }

    /// Local file name for a downloaded voice note.
    pub fn local_path(&self, dest_dir: &Path, chat_id: i64, message_id: i64) -> PathBuf {
        dest_dir.join(format!(
            "voice_{}_{}.{}",
            chat_id,
            message_id,
            self.extension()
        ))
    }
}

/// The remote operations the dispatcher depends on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch pending updates starting at `offset` (all backlog when `None`).
    async fn fetch_updates(&self, offset: Option<i64>) -> Result<Vec<Update>, BotError>;

    async fn send_reply(&self, chat_id: i64, text: &str) -> Result<Message, BotError>;

    /// Resolve and download a voice note into `dest_dir`, returning the
    /// local path.
    async fn download_voice(
        &self,
        voice: &VoiceAttachment,
        chat_id: i64,
        message_id: i64,
        dest_dir: &Path,
    ) -> Result<PathBuf, BotError>;
}
