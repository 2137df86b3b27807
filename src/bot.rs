use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::PollingConfig;
use crate::error::{BotError, ErrorKind};
use crate::platform::{MessageKind, Transport, Update};
use crate::stats::PollStats;

pub const WELCOME_TEXT: &str = "Thank you for adding me!\n\
     I'm an AI helper, ready to tackle your requests.\n\
     Send me a message to get started.";

pub const VOICE_UNSUPPORTED_TEXT: &str = "Voice messages are not supported yet.";

/// Telegram rejects messages over 4096 chars; stay below with some margin.
const MAX_REPLY_LEN: usize = 4000;

/// Caps the backoff exponent so the shift never overflows.
const MAX_BACKOFF_EXPONENT: u32 = 16;

pub fn echo_reply(text: &str) -> String {
    format!("You said: {}", text)
}

/// Offset to request after `batch`: one past the highest update id, or
/// `None` for an empty batch.
pub fn next_offset(batch: &[Update]) -> Option<i64> {
    batch.iter().map(|u| u.update_id).max().map(|max| max.saturating_add(1))
}

/// Sleep before the next poll after `consecutive` failed fetches.
pub fn backoff_delay(base: Duration, max: Duration, consecutive: u32) -> Duration {
    let exponent = consecutive.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Speech-to-text hook for downloaded voice notes.
fn transcribe(_audio: &Path) -> Result<String, BotError> {
    Err(BotError::Unsupported("voice transcription"))
}

/// Split long messages for Telegram's message length limit
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

/// The next offset to request. Only ever moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor(Option<i64>);

impl Cursor {
    pub fn offset(&self) -> Option<i64> {
        self.0
    }

    pub fn advance(&mut self, batch: &[Update]) {
        if let Some(next) = next_offset(batch) {
            self.0 = Some(self.0.map_or(next, |current| current.max(next)));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The poll returned no updates.
    Idle,
    Processed { updates: usize, failed: usize },
    FetchFailed { kind: ErrorKind, consecutive: u32 },
}

/// Owns the cursor and drives the fetch, classify, reply loop.
pub struct Dispatcher<T> {
    transport: T,
    cursor: Cursor,
    polling: PollingConfig,
    download_dir: PathBuf,
    stats: Arc<PollStats>,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(
        transport: T,
        polling: PollingConfig,
        download_dir: PathBuf,
        stats: Arc<PollStats>,
    ) -> Self {
        Self {
            transport,
            cursor: Cursor::default(),
            polling,
            download_dir,
            stats,
        }
    }

    #[cfg(test)]
    pub fn cursor(&self) -> Option<i64> {
        self.cursor.offset()
    }

    /// Poll forever. Each cycle finishes before the next fetch is issued.
    pub async fn run(&mut self) {
        info!("Polling for updates...");
        loop {
            let outcome = self.poll_once().await;
            let delay = self.delay_after(&outcome);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    pub fn delay_after(&self, outcome: &CycleOutcome) -> Duration {
        match outcome {
            CycleOutcome::Idle => Duration::ZERO,
            CycleOutcome::Processed { .. } => self.polling.pacing(),
            CycleOutcome::FetchFailed { consecutive, .. } => backoff_delay(
                self.polling.error_backoff(),
                self.polling.max_backoff(),
                *consecutive,
            ),
        }
    }

    /// Run a single fetch and handle everything it returned.
    ///
    /// A failing update does not stop the batch, and the cursor moves past
    /// the whole batch only once every update has been handled.
    pub async fn poll_once(&mut self) -> CycleOutcome {
        self.stats.record_cycle();

        let updates = match self.transport.fetch_updates(self.cursor.offset()).await {
            Ok(updates) => updates,
            Err(e) => {
                let consecutive = self.stats.record_fetch_failure();
                if consecutive >= self.polling.failure_alert_threshold {
                    error!(
                        "Fetching updates has failed {} times in a row ({}): {}",
                        consecutive,
                        e.kind(),
                        e
                    );
                } else {
                    warn!("Error getting updates ({}): {}", e.kind(), e);
                }
                return CycleOutcome::FetchFailed {
                    kind: e.kind(),
                    consecutive,
                };
            }
        };

        if updates.is_empty() {
            self.stats.record_empty_poll();
            return CycleOutcome::Idle;
        }

        let mut failed = 0;
        for update in &updates {
            if let Err(e) = self.handle_update(update).await {
                failed += 1;
                warn!(
                    "Failed to handle update {} ({}): {}",
                    update.update_id,
                    e.kind(),
                    e
                );
            }
        }

        self.cursor.advance(&updates);
        self.stats
            .record_batch(updates.len() - failed, failed, self.cursor.offset());
        info!(
            "Processed {} update(s), {} failed. Next offset: {:?}",
            updates.len(),
            failed,
            self.cursor.offset()
        );

        CycleOutcome::Processed {
            updates: updates.len(),
            failed,
        }
    }

    async fn handle_update(&self, update: &Update) -> Result<(), BotError> {
        let message = match &update.message {
            Some(message) => message,
            None => {
                debug!("Update {} carries no message", update.update_id);
                return Ok(());
            }
        };
        let chat_id = message.chat.id;

        match message.kind() {
            MessageKind::Text(text) => {
                info!("Message from chat {}: {}", chat_id, text);
                self.reply(chat_id, &echo_reply(text)).await
            }
            MessageKind::MemberAdded => {
                info!("Added to chat {}", chat_id);
                self.reply(chat_id, WELCOME_TEXT).await
            }
            MessageKind::Voice(voice) => {
                let transcript = match self
                    .transport
                    .download_voice(voice, chat_id, message.message_id, &self.download_dir)
                    .await
                {
                    Ok(path) => {
                        info!("Voice message saved to {}", path.display());
                        transcribe(&path)
                    }
                    Err(e) => {
                        warn!("Voice download failed for chat {}: {}", chat_id, e);
                        Err(e)
                    }
                };

                match transcript {
                    Ok(text) => self.reply(chat_id, &echo_reply(&text)).await,
                    Err(e) => {
                        debug!("No transcript for chat {} ({}): {}", chat_id, e.kind(), e);
                        self.reply(chat_id, VOICE_UNSUPPORTED_TEXT).await
                    }
                }
            }
            MessageKind::Other => {
                debug!(
                    "Ignoring message {} in chat {}",
                    message.message_id, chat_id
                );
                Ok(())
            }
        }
    }

    async fn reply(&self, chat_id: i64, text: &str) -> Result<(), BotError> {
        for chunk in split_message(text, MAX_REPLY_LEN) {
            self.transport.send_reply(chat_id, &chunk).await?;
        }
        Ok(())
    }
}
