use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::TelegramConfig;
use crate::error::BotError;
use crate::platform::{Message, Transport, Update, VoiceAttachment};

/// Downloads are written through a buffer of this size.
const DOWNLOAD_CHUNK_SIZE: usize = 8192;

/// Envelope shared by every Bot API method.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    #[serde(default)]
    file_path: Option<String>,
}

/// Bot API client speaking plain HTTP with reqwest.
pub struct TelegramClient {
    client: reqwest::Client,
    config: TelegramConfig,
}

impl TelegramClient {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        )
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "{}/file/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            file_path.trim_start_matches('/')
        )
    }

    async fn resolve_file_path(&self, file_id: &str) -> Result<String, BotError> {
        let response = self
            .client
            .get(self.method_url("getFile"))
            .query(&[("file_id", file_id)])
            .timeout(Duration::from_secs(self.config.file_timeout_secs))
            .send()
            .await
            .map_err(|e| BotError::http("getFile", e))?;

        let info: FileInfo = decode_response("getFile", response).await?;
        info.file_path.ok_or(BotError::MissingField {
            method: "getFile",
            field: "file_path",
        })
    }

    async fn stream_to_file(&self, url: &str, path: &Path) -> Result<(), BotError> {
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(self.config.file_timeout_secs))
            .send()
            .await
            .map_err(|e| BotError::http("download", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BotError::Status {
                method: "download",
                status,
            });
        }

        let io_err = |source: std::io::Error| BotError::Io {
            path: path.to_path_buf(),
            source,
        };

        let file = tokio::fs::File::create(path).await.map_err(io_err)?;

        if let Err(e) = write_body(response, file, path).await {
            if tokio::fs::remove_file(path).await.is_ok() {
                warn!("Removed partial download {}", path.display());
            }
            return Err(e);
        }

        Ok(())
    }
}

async fn write_body(
    response: reqwest::Response,
    file: tokio::fs::File,
    path: &Path,
) -> Result<(), BotError> {
    let io_err = |source: std::io::Error| BotError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut writer = tokio::io::BufWriter::with_capacity(DOWNLOAD_CHUNK_SIZE, file);
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| BotError::http("download", e))?;
        writer.write_all(&chunk).await.map_err(io_err)?;
    }
    writer.flush().await.map_err(io_err)?;

    Ok(())
}

/// Check status, decode the envelope and unwrap `result`.
async fn decode_response<T: DeserializeOwned>(
    method: &'static str,
    response: reqwest::Response,
) -> Result<T, BotError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| BotError::http(method, e))?;

    let envelope: ApiResponse<T> = match serde_json::from_str(&body) {
        Ok(envelope) => envelope,
        Err(_) if !status.is_success() => return Err(BotError::Status { method, status }),
        Err(source) => return Err(BotError::Decode { method, source }),
    };

    if !envelope.ok || !status.is_success() {
        return Err(BotError::Api {
            method,
            description: envelope
                .description
                .unwrap_or_else(|| format!("HTTP {}", status)),
        });
    }

    envelope.result.ok_or(BotError::MissingField {
        method,
        field: "result",
    })
}

#[async_trait]
impl Transport for TelegramClient {
    async fn fetch_updates(&self, offset: Option<i64>) -> Result<Vec<Update>, BotError> {
        let mut request = self
            .client
            .get(self.method_url("getUpdates"))
            .query(&[("timeout", self.config.poll_timeout_secs)])
            .timeout(self.config.poll_request_timeout());
        if let Some(offset) = offset {
            request = request.query(&[("offset", offset)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BotError::http("getUpdates", e))?;

        let raw: Vec<serde_json::Value> = decode_response("getUpdates", response).await?;
        let updates: Vec<Update> = raw.into_iter().filter_map(Update::from_value).collect();

        debug!("getUpdates returned {} update(s)", updates.len());
        Ok(updates)
    }

    async fn send_reply(&self, chat_id: i64, text: &str) -> Result<Message, BotError> {
        let chat_id_field = chat_id.to_string();
        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .form(&[("chat_id", chat_id_field.as_str()), ("text", text)])
            .timeout(Duration::from_secs(self.config.send_timeout_secs))
            .send()
            .await
            .map_err(|e| BotError::http("sendMessage", e))?;

        let sent: Message = decode_response("sendMessage", response).await?;
        info!("Sent reply to chat {}: {:?}", chat_id, text);
        Ok(sent)
    }

    async fn download_voice(
        &self,
        voice: &VoiceAttachment,
        chat_id: i64,
        message_id: i64,
        dest_dir: &Path,
    ) -> Result<PathBuf, BotError> {
        let file_id = voice
            .file_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(BotError::MissingField {
                method: "voice",
                field: "file_id",
            })?;

        let file_path = self.resolve_file_path(file_id).await?;

        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|source| BotError::Io {
                path: dest_dir.to_path_buf(),
                source,
            })?;

        let local_path = voice.local_path(dest_dir, chat_id, message_id);
        let url = self.file_url(&file_path);

        self.stream_to_file(&url, &local_path).await?;

        info!(
            "Downloaded voice message ({}) to {}",
            voice.mime_type(),
            local_path.display()
        );
        Ok(local_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use mockito::Matcher;

    const TOKEN: &str = "123:test";

    fn client_for(server: &mockito::ServerGuard) -> TelegramClient {
        TelegramClient::new(TelegramConfig {
            bot_token: TOKEN.to_string(),
            api_base: server.url(),
            ..TelegramConfig::default()
        })
    }

    fn path(method: &str) -> String {
        format!("/bot{}/{}", TOKEN, method)
    }

    fn voice(file_id: Option<&str>) -> VoiceAttachment {
        VoiceAttachment {
            file_id: file_id.map(str::to_string),
            mime_type: Some("audio/ogg".to_string()),
        }
    }

    #[tokio::test]
    async fn test_fetch_updates_sends_offset_and_timeout() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", path("getUpdates").as_str())
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("timeout".into(), "10".into()),
                Matcher::UrlEncoded("offset".into(), "6".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"ok":true,"result":[
                    {"update_id":6,"message":{"message_id":1,"chat":{"id":1},"text":"hi"}},
                    {"update_id":7,"edited_message":{"message_id":1}}
                ]}"#,
            )
            .create_async()
            .await;

        let updates = client_for(&server).fetch_updates(Some(6)).await.unwrap();
        mock.assert_async().await;

        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].update_id, 6);
        let message = updates[0].message.as_ref().unwrap();
        assert_eq!(message.chat.id, 1);
        assert_eq!(message.text.as_deref(), Some("hi"));
        assert!(updates[1].message.is_none());
    }

    #[tokio::test]
    async fn test_fetch_updates_malformed_json() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", path("getUpdates").as_str())
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("<html>gateway</html>")
            .create_async()
            .await;

        let err = client_for(&server).fetch_updates(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[tokio::test]
    async fn test_fetch_updates_api_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", path("getUpdates").as_str())
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body(r#"{"ok":false,"error_code":401,"description":"Unauthorized"}"#)
            .create_async()
            .await;

        let err = client_for(&server).fetch_updates(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("Unauthorized"));
    }

    #[tokio::test]
    async fn test_fetch_updates_bad_status_without_json() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", path("getUpdates").as_str())
            .match_query(Matcher::Any)
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let err = client_for(&server).fetch_updates(None).await.unwrap_err();
        assert!(matches!(err, BotError::Status { .. }));
    }

    #[tokio::test]
    async fn test_fetch_updates_connection_error_hides_token() {
        let client = TelegramClient::new(TelegramConfig {
            bot_token: TOKEN.to_string(),
            api_base: "http://127.0.0.1:1".to_string(),
            ..TelegramConfig::default()
        });

        let err = client.fetch_updates(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(!err.to_string().contains(TOKEN));
    }

    #[tokio::test]
    async fn test_send_reply_posts_form() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", path("sendMessage").as_str())
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("chat_id".into(), "1".into()),
                Matcher::UrlEncoded("text".into(), "You said: hi".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"ok":true,"result":{"message_id":99,"chat":{"id":1},"text":"You said: hi"}}"#,
            )
            .create_async()
            .await;

        let sent = client_for(&server).send_reply(1, "You said: hi").await.unwrap();
        mock.assert_async().await;
        assert_eq!(sent.message_id, 99);
    }

    #[tokio::test]
    async fn test_send_reply_malformed_response_is_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", path("sendMessage").as_str())
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let err = client_for(&server).send_reply(1, "x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[tokio::test]
    async fn test_download_voice_writes_file() {
        let mut server = mockito::Server::new_async().await;
        let get_file = server
            .mock("GET", path("getFile").as_str())
            .match_query(Matcher::UrlEncoded("file_id".into(), "voice-1".into()))
            .with_status(200)
            .with_body(r#"{"ok":true,"result":{"file_id":"voice-1","file_path":"voice/file_0.oga"}}"#)
            .create_async()
            .await;
        let audio: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let download = server
            .mock("GET", format!("/file/bot{}/voice/file_0.oga", TOKEN).as_str())
            .with_status(200)
            .with_body(audio.clone())
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("audio");
        let local = client_for(&server)
            .download_voice(&voice(Some("voice-1")), 1, 42, &dest)
            .await
            .unwrap();

        get_file.assert_async().await;
        download.assert_async().await;
        assert_eq!(local, dest.join("voice_1_42.ogg"));
        assert_eq!(std::fs::read(&local).unwrap(), audio);
    }

    #[tokio::test]
    async fn test_download_voice_without_file_id() {
        let server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();

        let err = client_for(&server)
            .download_voice(&voice(None), 1, 1, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BotError::MissingField {
                field: "file_id",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_download_voice_missing_file_path() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", path("getFile").as_str())
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"ok":true,"result":{"file_id":"voice-1"}}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let err = client_for(&server)
            .download_voice(&voice(Some("voice-1")), 1, 1, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BotError::MissingField {
                field: "file_path",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_download_voice_rejected_download_keeps_existing_file() {
        let mut server = mockito::Server::new_async().await;
        let _get_file = server
            .mock("GET", path("getFile").as_str())
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"ok":true,"result":{"file_path":"voice/gone.oga"}}"#)
            .create_async()
            .await;
        let _download = server
            .mock("GET", format!("/file/bot{}/voice/gone.oga", TOKEN).as_str())
            .with_status(404)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let earlier = dir.path().join("voice_3_4.ogg");
        std::fs::write(&earlier, b"saved by an earlier delivery").unwrap();

        let err = client_for(&server)
            .download_voice(&voice(Some("voice-1")), 3, 4, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Status { .. }));
        assert_eq!(
            std::fs::read(&earlier).unwrap(),
            b"saved by an earlier delivery"
        );
    }

    /// Minimal HTTP server: answers getFile, then sends a file response whose
    /// body is cut short of its declared length.
    async fn spawn_truncating_server() -> String {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&request);

                let response = if request.contains("/getFile") {
                    let body = r#"{"ok":true,"result":{"file_path":"voice/cut.oga"}}"#;
                    format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                         content-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    )
                } else {
                    "HTTP/1.1 200 OK\r\ncontent-length: 100000\r\n\
                     connection: close\r\n\r\nonly-a-few-bytes"
                        .to_string()
                };
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.flush().await;
            }
        });

        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_download_voice_truncated_body_removes_partial_file() {
        let client = TelegramClient::new(TelegramConfig {
            bot_token: TOKEN.to_string(),
            api_base: spawn_truncating_server().await,
            ..TelegramConfig::default()
        });

        let dir = tempfile::tempdir().unwrap();
        let err = client
            .download_voice(&voice(Some("voice-1")), 5, 6, dir.path())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(!dir.path().join("voice_5_6.ogg").exists());
    }

    #[tokio::test]
    async fn test_fetch_updates_without_offset_sends_only_timeout() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", path("getUpdates").as_str())
            .match_query(Matcher::Exact("timeout=10".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":true,"result":[]}"#)
            .create_async()
            .await;

        let updates = client_for(&server).fetch_updates(None).await.unwrap();
        mock.assert_async().await;
        assert!(updates.is_empty());
    }
}
