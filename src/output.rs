use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::config::AdapterConfig;
use crate::error::ConfigError;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JsonFormat {
    Pretty,
    Compact,
}

pub fn resolve_json_format(pretty: bool) -> JsonFormat {
    if pretty {
        JsonFormat::Pretty
    } else {
        JsonFormat::Compact
    }
}

pub fn json_string<T: Serialize + ?Sized>(value: &T, format: JsonFormat) -> Result<String, OutputError> {
    let payload = match format {
        JsonFormat::Pretty => serde_json::to_string_pretty(value)?,
        JsonFormat::Compact => serde_json::to_string(value)?,
    };
    Ok(payload)
}

/// Destination for emitted records.
#[async_trait]
pub trait RecordSink: Send {
    fn name(&self) -> &'static str;

    async fn emit(&mut self, record: &Value) -> Result<(), OutputError>;
}

/// Writes one record per line and flushes after each one.
pub struct WriterSink<W> {
    writer: W,
    format: JsonFormat,
}

pub type StdoutSink = WriterSink<tokio::io::Stdout>;

impl StdoutSink {
    pub fn stdout(format: JsonFormat) -> Self {
        WriterSink::new(tokio::io::stdout(), format)
    }
}

impl<W> WriterSink<W> {
    pub fn new(writer: W, format: JsonFormat) -> Self {
        Self { writer, format }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> RecordSink for WriterSink<W> {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn emit(&mut self, record: &Value) -> Result<(), OutputError> {
        let mut line = json_string(record, self.format)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Sends every record to a webhook. Delivery failures are logged and
/// skipped so one unreachable endpoint does not stop the stream.
pub struct HttpSink {
    http: Client,
    url: String,
    method: Method,
    headers: HeaderMap,
    timeout: Duration,
}

impl HttpSink {
    pub fn new(
        url: String,
        method: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let method = Method::from_str(&method.to_ascii_uppercase()).map_err(|_| ConfigError::InvalidValue {
            field: "adapter method",
            value: method.to_string(),
        })?;
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| ConfigError::InvalidValue {
                field: "adapter header name",
                value: name.clone(),
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|_| ConfigError::InvalidValue {
                field: "adapter header value",
                value: name.clone(),
            })?;
            header_map.insert(header_name, header_value);
        }
        Ok(Self {
            http: Client::new(),
            url,
            method,
            headers: header_map,
            timeout,
        })
    }
}

#[async_trait]
impl RecordSink for HttpSink {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn emit(&mut self, record: &Value) -> Result<(), OutputError> {
        let response = self
            .http
            .request(self.method.clone(), &self.url)
            .headers(self.headers.clone())
            .timeout(self.timeout)
            .json(record)
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(url = %self.url, status = response.status().as_u16(), "record delivered");
            }
            Ok(response) => {
                tracing::warn!(url = %self.url, status = response.status().as_u16(), "webhook rejected record");
            }
            Err(error) => {
                tracing::warn!(url = %self.url, %error, "webhook delivery failed");
            }
        }
        Ok(())
    }
}

/// Hands each record to every sink in turn before accepting the next one.
pub struct Emitter {
    sinks: Vec<Box<dyn RecordSink>>,
    emitted: u64,
}

impl Emitter {
    pub fn new(sinks: Vec<Box<dyn RecordSink>>) -> Self {
        Self { sinks, emitted: 0 }
    }

    /// Builds the configured sinks; with none configured, records go to
    /// stdout.
    pub fn from_adapters(adapters: &[AdapterConfig], pretty: bool) -> Result<Self, ConfigError> {
        let mut sinks: Vec<Box<dyn RecordSink>> = Vec::new();
        for adapter in adapters {
            match adapter {
                AdapterConfig::Stdout { pretty: adapter_pretty } => {
                    sinks.push(Box::new(StdoutSink::stdout(resolve_json_format(pretty || *adapter_pretty))));
                }
                AdapterConfig::Http {
                    url,
                    method,
                    headers,
                    timeout,
                    enabled,
                } => {
                    if !enabled {
                        tracing::debug!(%url, "http adapter disabled");
                        continue;
                    }
                    let headers: Vec<(String, String)> =
                        headers.iter().map(|(name, value)| (name.clone(), value.clone())).collect();
                    sinks.push(Box::new(HttpSink::new(
                        url.clone(),
                        method,
                        &headers,
                        Duration::from_secs(*timeout),
                    )?));
                }
            }
        }
        if sinks.is_empty() {
            sinks.push(Box::new(StdoutSink::stdout(resolve_json_format(pretty))));
        }
        tracing::debug!(sinks = ?sinks.iter().map(|sink| sink.name()).collect::<Vec<_>>(), "output ready");
        Ok(Self::new(sinks))
    }

    pub async fn emit(&mut self, record: &Value) -> Result<(), OutputError> {
        for sink in &mut self.sinks {
            sink.emit(record).await?;
        }
        self.emitted += 1;
        Ok(())
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}
