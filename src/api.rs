use std::fs;
use std::path::Path;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected status: {0}")]
    Status(u16),
    #[error("api error: {error} ({description})")]
    Api { error: String, description: String },
    #[error("invalid file name: {0}")]
    FileName(String),
}

/// HTTP side of the gateway: file uploads and attachment downloads.
#[derive(Clone)]
pub struct GatewayApi {
    base_url: String,
    http: Client,
}

impl GatewayApi {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: Client::new(),
        }
    }

    pub async fn upload_file(&self, token: &str, path: &Path) -> Result<UploadFileResult, ApiError> {
        let url = format!("{}/uploadFile", self.base_url);
        let file_name = path
            .file_name()
            .and_then(|value| value.to_str())
            .ok_or_else(|| ApiError::FileName(path.display().to_string()))?
            .to_string();
        let mime_type = mime_guess::from_path(path)
            .first()
            .map(|mime| mime.essence_str().to_string());
        let file_type = UploadFileType::from_mime(mime_type.as_deref());

        let bytes = fs::read(path)?;
        let mut file_part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        if let Some(mime) = mime_type.as_deref() {
            file_part = file_part.mime_str(mime)?;
        }
        let form = reqwest::multipart::Form::new()
            .text("type", file_type.as_str())
            .part("file", file_part);

        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }
        let api_response: ApiResponse<UploadFileResult> = response.json().await?;
        match api_response {
            ApiResponse::Ok { result, .. } => Ok(result),
            ApiResponse::Err {
                error,
                description,
                ..
            } => Err(ApiError::Api {
                error,
                description: description.unwrap_or_else(|| "Unknown error".to_string()),
            }),
        }
    }

    /// Opens a streamed download. Relative URLs are resolved against the
    /// gateway's API base.
    pub async fn download(
        &self,
        token: &str,
        url: &str,
    ) -> Result<BoxStream<'static, Result<Vec<u8>, ApiError>>, ApiError> {
        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        };
        let response = self.http.get(url).bearer_auth(token).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(ApiError::from))
            .boxed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFileType {
    Photo,
    Video,
    Document,
}

impl UploadFileType {
    pub fn from_mime(mime_type: Option<&str>) -> Self {
        match mime_type {
            Some(value) if value.starts_with("image/") => UploadFileType::Photo,
            Some(value) if value.starts_with("video/") => UploadFileType::Video,
            _ => UploadFileType::Document,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadFileType::Photo => "photo",
            UploadFileType::Video => "video",
            UploadFileType::Document => "document",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UploadFileResult {
    pub file_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged, rename_all = "camelCase")]
enum ApiResponse<T> {
    Ok {
        ok: bool,
        result: T,
    },
    Err {
        ok: bool,
        error: String,
        error_code: Option<i32>,
        description: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_type_follows_mime() {
        assert_eq!(UploadFileType::from_mime(Some("image/png")), UploadFileType::Photo);
        assert_eq!(UploadFileType::from_mime(Some("video/mp4")), UploadFileType::Video);
        assert_eq!(UploadFileType::from_mime(Some("application/pdf")), UploadFileType::Document);
        assert_eq!(UploadFileType::from_mime(None), UploadFileType::Document);
    }

    #[test]
    fn api_responses_decode_both_shapes() {
        let ok: ApiResponse<UploadFileResult> =
            serde_json::from_str(r#"{"ok": true, "result": {"fileId": "f1"}}"#).expect("ok");
        assert!(matches!(ok, ApiResponse::Ok { result, .. } if result.file_id == "f1"));
        let err: ApiResponse<UploadFileResult> =
            serde_json::from_str(r#"{"ok": false, "error": "TOO_BIG", "description": "limit"}"#).expect("err");
        assert!(matches!(err, ApiResponse::Err { error, .. } if error == "TOO_BIG"));
    }
}
