//! Websocket connection to the messaging gateway.
//!
//! Frames are JSON. Requests carry an `id` that the matching `rpc_result` or
//! `rpc_error` echoes back as `req_id`; events may arrive at any time once a
//! subscription is registered.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use async_trait::async_trait;
use futures_util::{stream, SinkExt, StreamExt};
use rand::{rngs::OsRng, RngCore};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

use crate::api::GatewayApi;
use crate::client::{ChatRef, Download, EntityInfo, EventKind, EventStream, InboundEvent, MessengerClient};
use crate::error::ClientError;
use crate::listen::SubscriptionScope;
use crate::protocol::{RawObject, SchemaRegistry};

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("url error: {0}")]
    Url(#[from] url::ParseError),
    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("{friendly}")]
    RpcError {
        code: i32,
        error_code: i32,
        message: String,
        friendly: String,
    },
}

impl RealtimeError {
    fn error_code(&self) -> Option<i32> {
        match self {
            RealtimeError::RpcError { error_code, .. } => Some(*error_code),
            _ => None,
        }
    }
}

const INVALID_PEER: i32 = 5;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    ConnectionOpen {
        #[serde(default)]
        schemas: HashMap<String, Vec<String>>,
    },
    RpcResult {
        req_id: u64,
        #[serde(default)]
        result: Value,
    },
    RpcError {
        req_id: u64,
        #[serde(default)]
        code: i32,
        #[serde(default)]
        error_code: i32,
        #[serde(default)]
        message: String,
    },
    Event {
        event: WireEvent,
    },
    ConnectionError {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    kind: WireEventKind,
    chat_id: i64,
    #[serde(default)]
    is_private: bool,
    #[serde(default)]
    outgoing: bool,
    payload: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WireEventKind {
    NewMessage,
    MessageEdited,
    CallbackQuery,
}

impl From<WireEvent> for InboundEvent {
    fn from(event: WireEvent) -> Self {
        InboundEvent {
            kind: match event.kind {
                WireEventKind::NewMessage => EventKind::NewMessage,
                WireEventKind::MessageEdited => EventKind::MessageEdited,
                WireEventKind::CallbackQuery => EventKind::CallbackQuery,
            },
            chat_id: event.chat_id,
            is_private: event.is_private,
            outgoing: event.outgoing,
            payload: RawObject::from_wire(event.payload),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResolvedChat {
    chat_id: i64,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct DialogList {
    #[serde(default)]
    dialogs: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct EntityReply {
    entity: Value,
    #[serde(default)]
    full: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct FileLocation {
    url: String,
    file_name: Option<String>,
}

pub struct GatewayClient {
    ws: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    id_gen: IdGenerator,
    schemas: SchemaRegistry,
    pending_events: VecDeque<InboundEvent>,
    api: GatewayApi,
    token: String,
}

impl GatewayClient {
    pub async fn connect(url: &str, api: GatewayApi, token: &str) -> Result<Self, RealtimeError> {
        let url = Url::parse(url)?;
        let (ws, _) = connect_async(url).await?;
        let mut client = Self {
            ws,
            id_gen: IdGenerator::new(),
            schemas: SchemaRegistry::builtin(),
            pending_events: VecDeque::new(),
            api,
            token: token.to_string(),
        };

        client.send_connection_init().await?;
        client.wait_for_connection_open().await?;
        tracing::debug!(schemas = client.schemas.len(), "gateway connection open");
        Ok(client)
    }

    /// Built-in schemas merged with those announced when the connection opened.
    pub fn schemas(&self) -> SchemaRegistry {
        self.schemas.clone()
    }

    pub async fn call_rpc(&mut self, method: &str, params: Value) -> Result<Value, RealtimeError> {
        let message_id = self.next_id();
        self.send_frame(json!({"id": message_id, "method": method, "params": params}))
            .await?;

        loop {
            match self.read_server_frame().await? {
                ServerFrame::RpcResult { req_id, result } if req_id == message_id => return Ok(result),
                ServerFrame::RpcError {
                    req_id,
                    code,
                    error_code,
                    message,
                } if req_id == message_id => {
                    let friendly = format_rpc_error(error_code, &message, code);
                    return Err(RealtimeError::RpcError {
                        code,
                        error_code,
                        message,
                        friendly,
                    });
                }
                ServerFrame::Event { event } => self.pending_events.push_back(event.into()),
                ServerFrame::ConnectionError { message } => return Err(RealtimeError::ConnectionError(message)),
                _ => {}
            }
        }
    }

    async fn call<T: DeserializeOwned>(&mut self, method: &str, params: Value) -> Result<T, RealtimeError> {
        let result = self.call_rpc(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn call_raw(&mut self, method: &str, params: Value) -> Result<RawObject, RealtimeError> {
        Ok(RawObject::from_wire(self.call_rpc(method, params).await?))
    }

    async fn next_event(&mut self) -> Result<InboundEvent, RealtimeError> {
        if let Some(event) = self.pending_events.pop_front() {
            return Ok(event);
        }
        loop {
            match self.read_server_frame().await? {
                ServerFrame::Event { event } => return Ok(event.into()),
                ServerFrame::ConnectionError { message } => return Err(RealtimeError::ConnectionError(message)),
                _ => {}
            }
        }
    }

    async fn send_connection_init(&mut self) -> Result<(), RealtimeError> {
        let message_id = self.next_id();
        let frame = json!({
            "id": message_id,
            "method": "connection_init",
            "params": {
                "token": self.token,
                "client_version": env!("CARGO_PKG_VERSION"),
            }
        });
        self.send_frame(frame).await
    }

    async fn wait_for_connection_open(&mut self) -> Result<(), RealtimeError> {
        loop {
            match self.read_server_frame().await? {
                ServerFrame::ConnectionOpen { schemas } => {
                    self.schemas = SchemaRegistry::builtin().merged_with(schemas);
                    return Ok(());
                }
                ServerFrame::ConnectionError { message } => return Err(RealtimeError::ConnectionError(message)),
                _ => {}
            }
        }
    }

    async fn send_frame(&mut self, frame: Value) -> Result<(), RealtimeError> {
        let text = serde_json::to_string(&frame)?;
        self.ws.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    async fn read_server_frame(&mut self) -> Result<ServerFrame, RealtimeError> {
        loop {
            let message = self
                .ws
                .next()
                .await
                .ok_or_else(|| RealtimeError::ConnectionError("connection closed".to_string()))??;
            match message {
                WsMessage::Text(text) => return Ok(serde_json::from_str(&text)?),
                WsMessage::Binary(data) => return Ok(serde_json::from_slice(&data)?),
                WsMessage::Close(_) => return Err(RealtimeError::ConnectionError("connection closed".to_string())),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                _ => continue,
            }
        }
    }

    fn next_id(&mut self) -> u64 {
        self.id_gen.next_id()
    }
}

fn chat_param(chat: &ChatRef) -> Value {
    match chat {
        ChatRef::Id(id) => json!(id),
        ChatRef::Username(name) => json!(format!("@{name}")),
        ChatRef::Me => json!("me"),
    }
}

fn scope_param(scope: &SubscriptionScope) -> Value {
    match scope {
        SubscriptionScope::Chat(chat_id) => json!({"type": "chat", "chat_id": chat_id}),
        SubscriptionScope::AllPrivate => json!({"type": "all_private"}),
        SubscriptionScope::All => json!({"type": "all"}),
    }
}

fn random_id() -> i64 {
    let mut rng = OsRng;
    rng.next_u64() as i64
}

#[async_trait]
impl MessengerClient for GatewayClient {
    async fn resolve_chat(&mut self, chat: &ChatRef) -> Result<i64, ClientError> {
        match self.call::<ResolvedChat>("resolve_chat", json!({"chat": chat_param(chat)})).await {
            Ok(resolved) => Ok(resolved.chat_id),
            Err(error) if error.error_code() == Some(INVALID_PEER) => Err(ClientError::UnknownChat(chat.to_string())),
            Err(error) => Err(error.into()),
        }
    }

    async fn fetch_history(
        &mut self,
        chat: i64,
        before_id: Option<i64>,
        count: usize,
    ) -> Result<Vec<RawObject>, ClientError> {
        let list: MessageList = self
            .call(
                "get_history",
                json!({"chat_id": chat, "before_id": before_id, "limit": count}),
            )
            .await?;
        Ok(list.messages.into_iter().map(RawObject::from_wire).collect())
    }

    async fn fetch_history_after(
        &mut self,
        chat: i64,
        after_id: Option<i64>,
        count: usize,
    ) -> Result<Vec<RawObject>, ClientError> {
        let list: MessageList = self
            .call(
                "get_history",
                json!({"chat_id": chat, "after_id": after_id, "limit": count, "reverse": true}),
            )
            .await?;
        Ok(list.messages.into_iter().map(RawObject::from_wire).collect())
    }

    async fn subscribe<'a>(&'a mut self, scope: &SubscriptionScope) -> Result<EventStream<'a>, ClientError> {
        self.call_rpc("subscribe", json!({"scope": scope_param(scope)})).await?;
        let events = stream::unfold(Some(self), |client| async move {
            let client = client?;
            match client.next_event().await {
                Ok(event) => Some((Ok(event), Some(client))),
                Err(error) => Some((Err(ClientError::from(error)), None)),
            }
        });
        Ok(events.boxed())
    }

    async fn send_text(&mut self, chat: i64, text: &str, reply_to: Option<i64>) -> Result<RawObject, ClientError> {
        let params = json!({
            "chat_id": chat,
            "text": text,
            "reply_to": reply_to,
            "random_id": random_id(),
        });
        Ok(self.call_raw("send_message", params).await?)
    }

    async fn send_files(
        &mut self,
        chat: i64,
        files: &[PathBuf],
        caption: Option<&str>,
        reply_to: Option<i64>,
    ) -> Result<RawObject, ClientError> {
        let mut file_ids = Vec::with_capacity(files.len());
        for path in files {
            let uploaded = self.api.upload_file(&self.token, path).await?;
            tracing::debug!(path = %path.display(), file_id = %uploaded.file_id, "uploaded attachment");
            file_ids.push(uploaded.file_id);
        }
        let params = json!({
            "chat_id": chat,
            "text": caption,
            "file_ids": file_ids,
            "reply_to": reply_to,
            "random_id": random_id(),
        });
        Ok(self.call_raw("send_message", params).await?)
    }

    async fn send_cross_chat_reply(
        &mut self,
        target: i64,
        text: &str,
        source: i64,
        reply_to: i64,
    ) -> Result<RawObject, ClientError> {
        let params = json!({
            "chat_id": target,
            "text": text,
            "reply_to": {"chat_id": source, "message_id": reply_to},
            "random_id": random_id(),
        });
        Ok(self.call_raw("send_message", params).await?)
    }

    async fn click_control(&mut self, chat: i64, message_id: i64, label: &str) -> Result<RawObject, ClientError> {
        let params = json!({"chat_id": chat, "message_id": message_id, "label": label});
        Ok(self.call_raw("click_button", params).await?)
    }

    async fn add_reaction(&mut self, chat: i64, message_id: i64, emoji: &str) -> Result<RawObject, ClientError> {
        let params = json!({"chat_id": chat, "message_id": message_id, "emoji": emoji});
        Ok(self.call_raw("send_reaction", params).await?)
    }

    async fn download_attachment(&mut self, chat: i64, message_id: i64) -> Result<Download, ClientError> {
        let location: FileLocation = self
            .call("get_file", json!({"chat_id": chat, "message_id": message_id}))
            .await?;
        let chunks = self.api.download(&self.token, &location.url).await?;
        Ok(Download {
            file_name: location.file_name,
            chunks: chunks.map(|chunk| chunk.map_err(ClientError::from)).boxed(),
        })
    }

    async fn edit_message(&mut self, chat: i64, message_id: i64, text: &str) -> Result<RawObject, ClientError> {
        let params = json!({"chat_id": chat, "message_id": message_id, "text": text});
        Ok(self.call_raw("edit_message", params).await?)
    }

    async fn forward_message(&mut self, chat: i64, message_id: i64, target: i64) -> Result<RawObject, ClientError> {
        let params = json!({
            "chat_id": chat,
            "message_ids": [message_id],
            "target_chat_id": target,
            "random_id": random_id(),
        });
        Ok(self.call_raw("forward_messages", params).await?)
    }

    async fn list_chats(&mut self, limit: usize) -> Result<Vec<RawObject>, ClientError> {
        let list: DialogList = self.call("get_dialogs", json!({"limit": limit})).await?;
        Ok(list.dialogs.into_iter().map(RawObject::from_wire).collect())
    }

    async fn search(&mut self, query: &str, limit: usize) -> Result<Vec<RawObject>, ClientError> {
        let list: MessageList = self
            .call("search_global", json!({"query": query, "limit": limit}))
            .await?;
        Ok(list.messages.into_iter().map(RawObject::from_wire).collect())
    }

    async fn get_entity(&mut self, chat: &ChatRef) -> Result<EntityInfo, ClientError> {
        match self
            .call::<EntityReply>("get_entity", json!({"chat": chat_param(chat), "full": true}))
            .await
        {
            Ok(reply) => Ok(EntityInfo {
                entity: RawObject::from_wire(reply.entity),
                full: reply.full.map(RawObject::from_wire),
            }),
            Err(error) if error.error_code() == Some(INVALID_PEER) => Err(ClientError::UnknownChat(chat.to_string())),
            Err(error) => Err(error.into()),
        }
    }
}

fn format_rpc_error(error_code: i32, message: &str, status_code: i32) -> String {
    let label = match error_code {
        1 => "Bad request",
        2 => "Not authenticated",
        3 => "Rate limited",
        4 => "Internal server error",
        5 => "Invalid peer (chat/user id)",
        6 => "Invalid message id",
        7 => "Chat write forbidden",
        8 => "Message not modified",
        9 => "Button not found",
        10 => "Reaction not allowed",
        11 => "Message has no media",
        _ => "Unknown RPC error",
    };

    let mut formatted = String::from(label);
    if !message.is_empty() && !message.eq_ignore_ascii_case(label) {
        formatted.push_str(": ");
        formatted.push_str(message);
    }
    if status_code != 0 {
        formatted.push_str(&format!(" (HTTP {status_code})"));
    }
    formatted
}

struct IdGenerator {
    last_timestamp: u64,
    sequence: u32,
}

impl IdGenerator {
    fn new() -> Self {
        Self {
            last_timestamp: 0,
            sequence: 0,
        }
    }

    fn next_id(&mut self) -> u64 {
        let timestamp = current_epoch_seconds().saturating_sub(EPOCH_SECONDS);
        if timestamp == self.last_timestamp {
            self.sequence = self.sequence.wrapping_add(1);
        } else {
            self.sequence = 0;
            self.last_timestamp = timestamp;
        }

        (timestamp << 32) | self.sequence as u64
    }
}

const EPOCH_SECONDS: u64 = 1_735_689_600; // 2025-01-01T00:00:00Z

fn current_epoch_seconds() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_server_frames() {
        let frame: ServerFrame = serde_json::from_str(
            r#"{"type": "connection_open", "schemas": {"Poll": ["id", "question"]}}"#,
        )
        .expect("frame");
        assert!(matches!(frame, ServerFrame::ConnectionOpen { schemas } if schemas.contains_key("Poll")));

        let frame: ServerFrame = serde_json::from_str(
            r#"{"type": "rpc_error", "req_id": 4, "error_code": 5, "message": "PEER_ID_INVALID"}"#,
        )
        .expect("frame");
        assert!(matches!(frame, ServerFrame::RpcError { req_id: 4, error_code: 5, .. }));

        let frame: ServerFrame = serde_json::from_str(r#"{"type": "pong"}"#).expect("frame");
        assert!(matches!(frame, ServerFrame::Unknown));
    }

    #[test]
    fn events_keep_payload_order() {
        let frame: ServerFrame = serde_json::from_str(
            r#"{"type": "event", "event": {"kind": "message_edited", "chat_id": 9, "is_private": true,
                "payload": {"_": "Message", "message": "x", "id": 3}}}"#,
        )
        .expect("frame");
        let ServerFrame::Event { event } = frame else {
            panic!("expected event frame");
        };
        let event = InboundEvent::from(event);
        assert_eq!(event.kind, EventKind::MessageEdited);
        assert!(event.is_private);
        assert!(!event.outgoing);
        let names: Vec<_> = event
            .payload
            .as_struct()
            .expect("struct")
            .fields()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["message", "id"]);
    }

    #[test]
    fn entity_replies_may_omit_full_info() {
        let reply: EntityReply =
            serde_json::from_str(r#"{"entity": {"_": "Channel", "id": 5, "title": "News"}}"#).expect("reply");
        assert!(reply.full.is_none());
        let entity = RawObject::from_wire(reply.entity);
        assert_eq!(entity.as_struct().map(|object| object.kind()), Some("Channel"));
    }

    #[test]
    fn formats_rpc_errors() {
        assert_eq!(
            format_rpc_error(3, "FLOOD_WAIT_30", 420),
            "Rate limited: FLOOD_WAIT_30 (HTTP 420)"
        );
        assert_eq!(format_rpc_error(9, "", 0), "Button not found");
    }

    #[test]
    fn ids_are_unique_within_a_second() {
        let mut ids = IdGenerator::new();
        let first = ids.next_id();
        let second = ids.next_id();
        assert_ne!(first, second);
    }
}
