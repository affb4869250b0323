//! Write actions. Each is one client call whose result is normalized (but
//! neither filtered nor redacted) before being emitted.

use std::fs;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::client::{ChunkStream, MessengerClient};
use crate::error::ActionError;
use crate::pipeline::Pipeline;
use crate::protocol::{RawObject, RawStruct};

const MAX_ATTACHMENT_BYTES: u64 = 200 * 1024 * 1024;

#[derive(Clone, Debug, Default)]
pub struct SendRequest {
    pub text: Option<String>,
    pub files: Vec<PathBuf>,
    pub reply_to: Option<i64>,
}

impl SendRequest {
    /// Drops blank text and missing files. Fails when nothing is left to send.
    pub fn validated(self) -> Result<Self, ActionError> {
        let text = self.text.filter(|text| !text.trim().is_empty());
        if self.files.is_empty() {
            if text.is_none() {
                return Err(ActionError::NothingToSend("message text is empty"));
            }
            return Ok(Self { text, ..self });
        }
        let files = existing_attachments(&self.files)?;
        if files.is_empty() {
            return Err(ActionError::NothingToSend("none of the given files exist"));
        }
        Ok(Self {
            text,
            files,
            reply_to: self.reply_to,
        })
    }
}

pub struct ActionRunner {
    pipeline: Pipeline,
}

impl ActionRunner {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    pub async fn send<C: MessengerClient + ?Sized>(
        &self,
        client: &mut C,
        chat: i64,
        request: SendRequest,
    ) -> Result<Value, ActionError> {
        let request = request.validated()?;
        let raw = if request.files.is_empty() {
            let text = request
                .text
                .ok_or(ActionError::NothingToSend("message text is empty"))?;
            client
                .send_text(chat, &text, request.reply_to)
                .await
                .map_err(ActionError::client("send"))?
        } else {
            tracing::debug!(chat, files = request.files.len(), "sending files");
            client
                .send_files(chat, &request.files, request.text.as_deref(), request.reply_to)
                .await
                .map_err(ActionError::client("send"))?
        };
        Ok(self.pipeline.normalize_only(&raw))
    }

    /// Replies in `target` to a message that lives in `source`.
    pub async fn reply_across<C: MessengerClient + ?Sized>(
        &self,
        client: &mut C,
        target: i64,
        text: &str,
        source: i64,
        reply_to: i64,
    ) -> Result<Value, ActionError> {
        if text.trim().is_empty() {
            return Err(ActionError::EmptyInput("text"));
        }
        let raw = client
            .send_cross_chat_reply(target, text, source, reply_to)
            .await
            .map_err(ActionError::client("reply"))?;
        Ok(self.pipeline.normalize_only(&raw))
    }

    pub async fn edit<C: MessengerClient + ?Sized>(
        &self,
        client: &mut C,
        chat: i64,
        message_id: i64,
        text: &str,
    ) -> Result<Value, ActionError> {
        if text.trim().is_empty() {
            return Err(ActionError::EmptyInput("text"));
        }
        let raw = client
            .edit_message(chat, message_id, text)
            .await
            .map_err(ActionError::client("edit"))?;
        Ok(self.pipeline.normalize_only(&raw))
    }

    pub async fn forward<C: MessengerClient + ?Sized>(
        &self,
        client: &mut C,
        chat: i64,
        message_id: i64,
        target: i64,
    ) -> Result<Value, ActionError> {
        let raw = client
            .forward_message(chat, message_id, target)
            .await
            .map_err(ActionError::client("forward"))?;
        Ok(self.pipeline.normalize_only(&raw))
    }

    pub async fn click<C: MessengerClient + ?Sized>(
        &self,
        client: &mut C,
        chat: i64,
        message_id: i64,
        label: &str,
    ) -> Result<Value, ActionError> {
        if label.trim().is_empty() {
            return Err(ActionError::EmptyInput("button label"));
        }
        let raw = client
            .click_control(chat, message_id, label)
            .await
            .map_err(ActionError::client("click"))?;
        Ok(self.pipeline.normalize_only(&raw))
    }

    pub async fn react<C: MessengerClient + ?Sized>(
        &self,
        client: &mut C,
        chat: i64,
        message_id: i64,
        emoji: &str,
    ) -> Result<Value, ActionError> {
        if emoji.trim().is_empty() {
            return Err(ActionError::EmptyInput("emoji"));
        }
        let raw = client
            .add_reaction(chat, message_id, emoji)
            .await
            .map_err(ActionError::client("react"))?;
        Ok(self.pipeline.normalize_only(&raw))
    }

    /// Streams the attachment to disk. A partially written file is removed
    /// when the transfer fails.
    pub async fn download<C: MessengerClient + ?Sized>(
        &self,
        client: &mut C,
        chat: i64,
        message_id: i64,
        output: Option<PathBuf>,
        dir: Option<PathBuf>,
    ) -> Result<Value, ActionError> {
        let mut download = client
            .download_attachment(chat, message_id)
            .await
            .map_err(ActionError::client("download"))?;
        let path = resolve_download_path(download.file_name.as_deref(), message_id, output, dir);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file = tokio::fs::File::create(&path).await?;
        let written = match write_chunks(&mut file, &mut download.chunks).await {
            Ok(written) => written,
            Err(error) => {
                drop(file);
                if let Err(remove_error) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(path = %path.display(), error = %remove_error, "failed to remove partial download");
                }
                return Err(error);
            }
        };
        tracing::info!(path = %path.display(), bytes = written, "download complete");

        let result = RawStruct::new("DownloadResult")
            .with("chat_id", chat)
            .with("message_id", message_id)
            .with("path", path.display().to_string())
            .with("bytes", written as i64);
        Ok(self.pipeline.normalize_only(&RawObject::Object(result)))
    }
}

async fn write_chunks(file: &mut tokio::fs::File, chunks: &mut ChunkStream) -> Result<u64, ActionError> {
    let mut written: u64 = 0;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(ActionError::client("download"))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

/// Keeps the files that exist, warning about the rest.
fn existing_attachments(paths: &[PathBuf]) -> Result<Vec<PathBuf>, ActionError> {
    let mut existing = Vec::with_capacity(paths.len());
    for path in paths {
        match fs::metadata(path) {
            Ok(metadata) if metadata.is_file() => {
                if metadata.len() > MAX_ATTACHMENT_BYTES {
                    return Err(ActionError::AttachmentTooLarge {
                        path: path.clone(),
                        limit_mb: MAX_ATTACHMENT_BYTES / 1024 / 1024,
                    });
                }
                existing.push(path.clone());
            }
            Ok(_) => tracing::warn!(path = %path.display(), "attachment is not a regular file, skipping"),
            Err(_) => tracing::warn!(path = %path.display(), "attachment not found, skipping"),
        }
    }
    Ok(existing)
}

pub fn resolve_download_path(
    file_name: Option<&str>,
    message_id: i64,
    output: Option<PathBuf>,
    dir: Option<PathBuf>,
) -> PathBuf {
    if let Some(output) = output {
        return output;
    }
    let file_name = file_name
        .and_then(sanitize_file_name)
        .unwrap_or_else(|| format!("message-{message_id}.bin"));
    let base_dir = dir.unwrap_or_else(|| PathBuf::from("."));
    base_dir.join(file_name)
}

fn sanitize_file_name(name: &str) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return None;
    }
    let file_name = Path::new(trimmed)
        .file_name()
        .and_then(|value| value.to_str())?;
    if file_name == "." || file_name == ".." {
        return None;
    }
    Some(file_name.to_string())
}
