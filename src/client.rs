//! Capabilities the pipeline needs from a messaging backend.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::{ClientError, ConfigError};
use crate::listen::SubscriptionScope;
use crate::protocol::RawObject;

pub type EventStream<'a> = BoxStream<'a, Result<InboundEvent, ClientError>>;
pub type ChunkStream = BoxStream<'static, Result<Vec<u8>, ClientError>>;

/// How a chat was named on the command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatRef {
    Id(i64),
    Username(String),
    /// The account's own saved-messages chat.
    Me,
}

impl ChatRef {
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::EmptyChat);
        }
        if trimmed.eq_ignore_ascii_case("me") || trimmed.eq_ignore_ascii_case("self") {
            return Ok(ChatRef::Me);
        }
        if let Ok(id) = trimmed.parse::<i64>() {
            return Ok(ChatRef::Id(id));
        }
        let name = trimmed
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_start_matches("t.me/")
            .trim_start_matches('@')
            .trim_end_matches('/');
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(ConfigError::UnknownChat(trimmed.to_string()));
        }
        Ok(ChatRef::Username(name.to_string()))
    }
}

impl fmt::Display for ChatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRef::Id(id) => write!(f, "{id}"),
            ChatRef::Username(name) => write!(f, "@{name}"),
            ChatRef::Me => f.write_str("me"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    NewMessage,
    MessageEdited,
    /// Inline button press, only delivered to bot sessions.
    CallbackQuery,
}

#[derive(Clone, Debug)]
pub struct InboundEvent {
    pub kind: EventKind,
    pub chat_id: i64,
    pub is_private: bool,
    pub outgoing: bool,
    pub payload: RawObject,
}

/// A looked-up user, chat or channel with its extended profile when the
/// gateway has one.
pub struct EntityInfo {
    pub entity: RawObject,
    pub full: Option<RawObject>,
}

pub struct Download {
    pub file_name: Option<String>,
    pub chunks: ChunkStream,
}

#[async_trait]
pub trait MessengerClient: Send {
    async fn resolve_chat(&mut self, chat: &ChatRef) -> Result<i64, ClientError>;

    /// Up to `count` messages strictly older than `before_id`, newest first.
    async fn fetch_history(
        &mut self,
        chat: i64,
        before_id: Option<i64>,
        count: usize,
    ) -> Result<Vec<RawObject>, ClientError>;

    /// Up to `count` messages strictly newer than `after_id`, oldest first.
    async fn fetch_history_after(
        &mut self,
        chat: i64,
        after_id: Option<i64>,
        count: usize,
    ) -> Result<Vec<RawObject>, ClientError>;

    /// Registers for events in `scope`. The stream ends when the connection
    /// does; dropping it stops delivery.
    async fn subscribe<'a>(&'a mut self, scope: &SubscriptionScope) -> Result<EventStream<'a>, ClientError>;

    async fn send_text(&mut self, chat: i64, text: &str, reply_to: Option<i64>) -> Result<RawObject, ClientError>;

    async fn send_files(
        &mut self,
        chat: i64,
        files: &[PathBuf],
        caption: Option<&str>,
        reply_to: Option<i64>,
    ) -> Result<RawObject, ClientError>;

    /// Sends `text` to `target` as a reply to a message living in `source`.
    async fn send_cross_chat_reply(
        &mut self,
        target: i64,
        text: &str,
        source: i64,
        reply_to: i64,
    ) -> Result<RawObject, ClientError>;

    async fn click_control(&mut self, chat: i64, message_id: i64, label: &str) -> Result<RawObject, ClientError>;

    async fn add_reaction(&mut self, chat: i64, message_id: i64, emoji: &str) -> Result<RawObject, ClientError>;

    async fn download_attachment(&mut self, chat: i64, message_id: i64) -> Result<Download, ClientError>;

    async fn edit_message(&mut self, chat: i64, message_id: i64, text: &str) -> Result<RawObject, ClientError>;

    async fn forward_message(&mut self, chat: i64, message_id: i64, target: i64) -> Result<RawObject, ClientError>;

    async fn list_chats(&mut self, limit: usize) -> Result<Vec<RawObject>, ClientError>;

    async fn search(&mut self, query: &str, limit: usize) -> Result<Vec<RawObject>, ClientError>;

    async fn get_entity(&mut self, chat: &ChatRef) -> Result<EntityInfo, ClientError>;
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::{HashMap, VecDeque};

    use futures_util::stream::{self, StreamExt};

    use super::*;
    use crate::protocol::RawStruct;

    pub fn message(id: i64) -> RawObject {
        RawObject::Object(RawStruct::new("Message").with("id", id).with("out", false))
    }

    pub fn event(kind: EventKind, chat_id: i64, is_private: bool, payload: RawObject) -> InboundEvent {
        InboundEvent {
            kind,
            chat_id,
            is_private,
            outgoing: false,
            payload,
        }
    }

    #[derive(Default)]
    pub struct FakeClient {
        pub chats: HashMap<String, i64>,
        /// Newest first, like the gateway.
        pub history: Vec<RawObject>,
        pub ignore_bounds: bool,
        pub history_requests: Vec<(i64, Option<i64>, usize)>,
        pub forward_requests: Vec<(i64, Option<i64>, usize)>,
        pub fail_history: bool,
        pub events: VecDeque<InboundEvent>,
        /// Keep the event stream open after the queued events.
        pub hold_open: bool,
        pub fail_actions: bool,
        pub calls: Vec<String>,
        pub download: Option<(Option<String>, Vec<Vec<u8>>)>,
        /// Fail the download stream after the queued chunks.
        pub break_download: bool,
    }

    impl FakeClient {
        fn record(&mut self, call: String) -> Result<(), ClientError> {
            self.calls.push(call);
            if self.fail_actions {
                return Err(ClientError::Rejected("not allowed".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl MessengerClient for FakeClient {
        async fn resolve_chat(&mut self, chat: &ChatRef) -> Result<i64, ClientError> {
            match chat {
                ChatRef::Id(id) => Ok(*id),
                ChatRef::Me => Ok(1),
                ChatRef::Username(name) => self
                    .chats
                    .get(name)
                    .copied()
                    .ok_or_else(|| ClientError::UnknownChat(name.clone())),
            }
        }

        async fn fetch_history(
            &mut self,
            chat: i64,
            before_id: Option<i64>,
            count: usize,
        ) -> Result<Vec<RawObject>, ClientError> {
            self.history_requests.push((chat, before_id, count));
            if self.fail_history {
                return Err(ClientError::Rejected("flood wait".to_string()));
            }
            if self.ignore_bounds {
                return Ok(self.history.clone());
            }
            Ok(self
                .history
                .iter()
                .filter(|raw| match (before_id, raw.message_id()) {
                    (Some(bound), Some(id)) => id < bound,
                    _ => true,
                })
                .take(count)
                .cloned()
                .collect())
        }

        async fn fetch_history_after(
            &mut self,
            chat: i64,
            after_id: Option<i64>,
            count: usize,
        ) -> Result<Vec<RawObject>, ClientError> {
            self.forward_requests.push((chat, after_id, count));
            if self.fail_history {
                return Err(ClientError::Rejected("flood wait".to_string()));
            }
            Ok(self
                .history
                .iter()
                .rev()
                .filter(|raw| match (after_id, raw.message_id()) {
                    (Some(bound), Some(id)) => id > bound,
                    _ => true,
                })
                .take(count)
                .cloned()
                .collect())
        }

        async fn subscribe<'a>(&'a mut self, _scope: &SubscriptionScope) -> Result<EventStream<'a>, ClientError> {
            let queued: Vec<_> = self.events.drain(..).map(Ok).collect();
            let events = stream::iter(queued);
            if self.hold_open {
                Ok(events.chain(stream::pending()).boxed())
            } else {
                Ok(events.boxed())
            }
        }

        async fn send_text(&mut self, chat: i64, text: &str, reply_to: Option<i64>) -> Result<RawObject, ClientError> {
            self.record(format!("send_text {chat} {text} {reply_to:?}"))?;
            Ok(RawObject::Object(
                RawStruct::new("Message").with("id", 100i64).with("message", text).with("out", true),
            ))
        }

        async fn send_files(
            &mut self,
            chat: i64,
            files: &[PathBuf],
            caption: Option<&str>,
            _reply_to: Option<i64>,
        ) -> Result<RawObject, ClientError> {
            self.record(format!("send_files {chat} {} {caption:?}", files.len()))?;
            Ok(RawObject::Object(RawStruct::new("Message").with("id", 101i64)))
        }

        async fn send_cross_chat_reply(
            &mut self,
            target: i64,
            text: &str,
            source: i64,
            reply_to: i64,
        ) -> Result<RawObject, ClientError> {
            self.record(format!("reply {target} {text} {source}/{reply_to}"))?;
            Ok(RawObject::Object(
                RawStruct::new("Message").with("id", 102i64).with("message", text),
            ))
        }

        async fn click_control(&mut self, chat: i64, message_id: i64, label: &str) -> Result<RawObject, ClientError> {
            self.record(format!("click {chat} {message_id} {label}"))?;
            Ok(RawObject::Object(RawStruct::new("BotCallbackAnswer").with("message", "ok")))
        }

        async fn add_reaction(&mut self, chat: i64, message_id: i64, emoji: &str) -> Result<RawObject, ClientError> {
            self.record(format!("react {chat} {message_id} {emoji}"))?;
            Ok(RawObject::Object(RawStruct::new("Updates")))
        }

        async fn download_attachment(&mut self, chat: i64, message_id: i64) -> Result<Download, ClientError> {
            self.record(format!("download {chat} {message_id}"))?;
            let (file_name, chunks) = self
                .download
                .clone()
                .ok_or_else(|| ClientError::Rejected("message has no media".to_string()))?;
            let mut chunks: Vec<Result<Vec<u8>, ClientError>> = chunks.into_iter().map(Ok).collect();
            if self.break_download {
                chunks.push(Err(ClientError::Rejected("connection reset".to_string())));
            }
            Ok(Download {
                file_name,
                chunks: stream::iter(chunks).boxed(),
            })
        }

        async fn edit_message(&mut self, chat: i64, message_id: i64, text: &str) -> Result<RawObject, ClientError> {
            self.record(format!("edit {chat} {message_id} {text}"))?;
            Ok(RawObject::Object(
                RawStruct::new("Message").with("id", message_id).with("message", text),
            ))
        }

        async fn forward_message(&mut self, chat: i64, message_id: i64, target: i64) -> Result<RawObject, ClientError> {
            self.record(format!("forward {chat} {message_id} {target}"))?;
            Ok(RawObject::Object(RawStruct::new("Message").with("id", 200i64)))
        }

        async fn list_chats(&mut self, limit: usize) -> Result<Vec<RawObject>, ClientError> {
            self.record(format!("list_chats {limit}"))?;
            Ok(vec![RawObject::Object(
                RawStruct::new("Dialog").with("name", "Saved").with("unread_count", 0i64),
            )])
        }

        async fn search(&mut self, query: &str, limit: usize) -> Result<Vec<RawObject>, ClientError> {
            self.record(format!("search {query} {limit}"))?;
            Ok(self.history.iter().take(limit).cloned().collect())
        }

        async fn get_entity(&mut self, chat: &ChatRef) -> Result<EntityInfo, ClientError> {
            let id = self.resolve_chat(chat).await?;
            Ok(EntityInfo {
                entity: RawObject::Object(
                    RawStruct::new("User")
                        .with("id", id)
                        .with("first_name", "Ada")
                        .with("access_hash", 77i64),
                ),
                full: Some(RawObject::Object(RawStruct::new("UserFull").with("about", "hi"))),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chat_references() {
        assert_eq!(ChatRef::parse("-100123").expect("id"), ChatRef::Id(-100123));
        assert_eq!(ChatRef::parse("me").expect("me"), ChatRef::Me);
        assert_eq!(
            ChatRef::parse("@rustlang").expect("username"),
            ChatRef::Username("rustlang".to_string())
        );
        assert_eq!(
            ChatRef::parse("https://t.me/rustlang").expect("link"),
            ChatRef::Username("rustlang".to_string())
        );
        assert!(matches!(ChatRef::parse("   "), Err(ConfigError::EmptyChat)));
        assert!(matches!(ChatRef::parse("two words"), Err(ConfigError::UnknownChat(_))));
    }
}
