//! Raw protocol objects as handed over by the messaging client, plus the
//! per-kind schemas used to walk them.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Key carrying the kind name of a tagged object on the wire.
pub const TYPE_KEY: &str = "_";
/// Kind given to untagged wire objects.
pub const PLAIN_OBJECT_KIND: &str = "dict";

const BYTES_KEY: &str = "$bytes";
const DATE_KEY: &str = "$date";

#[derive(Clone, Debug, PartialEq)]
pub enum RawObject {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(DateTime<Utc>),
    List(Vec<RawObject>),
    Object(RawStruct),
    /// Textual rendering of a value the client could not classify.
    Opaque(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RawStruct {
    kind: String,
    fields: Vec<(String, RawObject)>,
}

impl RawStruct {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Vec::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<RawObject>) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<RawObject>) {
        self.fields.push((name.into(), value.into()));
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn get(&self, name: &str) -> Option<&RawObject> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &RawObject)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl RawObject {
    pub fn as_struct(&self) -> Option<&RawStruct> {
        match self {
            RawObject::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&RawObject> {
        self.as_struct().and_then(|object| object.get(name))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RawObject::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Message identifier of a raw message record, if it carries one.
    pub fn message_id(&self) -> Option<i64> {
        self.field("id").and_then(RawObject::as_i64)
    }

    /// Decodes one gateway JSON value.
    ///
    /// Tagged objects (`{"_": "Message", ...}`) keep their field order,
    /// `{"$bytes": "<base64>"}` and `{"$date": "<rfc3339>"}` become bytes and
    /// dates. Anything the decoder cannot classify falls back to `Opaque`.
    pub fn from_wire(value: Value) -> RawObject {
        match value {
            Value::Null => RawObject::Null,
            Value::Bool(value) => RawObject::Bool(value),
            Value::Number(number) => number
                .as_i64()
                .map(RawObject::Int)
                .or_else(|| number.as_f64().map(RawObject::Float))
                .unwrap_or_else(|| RawObject::Opaque(number.to_string())),
            Value::String(value) => RawObject::Text(value),
            Value::Array(items) => RawObject::List(items.into_iter().map(RawObject::from_wire).collect()),
            Value::Object(map) => object_from_wire(map),
        }
    }

    /// Decodes one line of gateway output. Lines that are not JSON degrade to
    /// an opaque string instead of failing.
    pub fn from_wire_line(line: &str) -> RawObject {
        match serde_json::from_str::<Value>(line) {
            Ok(value) => RawObject::from_wire(value),
            Err(error) => {
                tracing::warn!(%error, "undecodable record, keeping it as text");
                RawObject::Opaque(line.to_string())
            }
        }
    }
}

fn object_from_wire(mut map: Map<String, Value>) -> RawObject {
    if map.len() == 1 {
        if let Some(Value::String(encoded)) = map.get(BYTES_KEY) {
            return match BASE64.decode(encoded.as_bytes()) {
                Ok(bytes) => RawObject::Bytes(bytes),
                Err(error) => {
                    tracing::warn!(%error, "invalid base64 payload");
                    RawObject::Opaque(encoded.clone())
                }
            };
        }
        if let Some(Value::String(stamp)) = map.get(DATE_KEY) {
            return match DateTime::parse_from_rfc3339(stamp) {
                Ok(date) => RawObject::Date(date.with_timezone(&Utc)),
                Err(_) => RawObject::Text(stamp.clone()),
            };
        }
    }

    let kind = match map.shift_remove(TYPE_KEY) {
        Some(Value::String(kind)) => kind,
        Some(other) => {
            map.insert(TYPE_KEY.to_string(), other);
            PLAIN_OBJECT_KIND.to_string()
        }
        None => PLAIN_OBJECT_KIND.to_string(),
    };

    let mut object = RawStruct::new(kind);
    for (name, value) in map {
        object.push(name, RawObject::from_wire(value));
    }
    RawObject::Object(object)
}

impl From<RawStruct> for RawObject {
    fn from(value: RawStruct) -> Self {
        RawObject::Object(value)
    }
}

impl From<bool> for RawObject {
    fn from(value: bool) -> Self {
        RawObject::Bool(value)
    }
}

impl From<i64> for RawObject {
    fn from(value: i64) -> Self {
        RawObject::Int(value)
    }
}

impl From<f64> for RawObject {
    fn from(value: f64) -> Self {
        RawObject::Float(value)
    }
}

impl From<&str> for RawObject {
    fn from(value: &str) -> Self {
        RawObject::Text(value.to_string())
    }
}

impl From<String> for RawObject {
    fn from(value: String) -> Self {
        RawObject::Text(value)
    }
}

impl From<Vec<RawObject>> for RawObject {
    fn from(value: Vec<RawObject>) -> Self {
        RawObject::List(value)
    }
}

impl<T: Into<RawObject>> From<Option<T>> for RawObject {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(RawObject::Null)
    }
}

// Field order of the message kinds the gateway forwards most often. The
// gateway may announce more (or override these) when the connection opens.
const BUILTIN_SCHEMAS: &[(&str, &[&str])] = &[
    (
        "Message",
        &[
            "id",
            "peer_id",
            "date",
            "message",
            "out",
            "mentioned",
            "media_unread",
            "silent",
            "post",
            "from_scheduled",
            "legacy",
            "edit_hide",
            "pinned",
            "noforwards",
            "from_id",
            "fwd_from",
            "via_bot_id",
            "reply_to",
            "media",
            "reply_markup",
            "entities",
            "views",
            "forwards",
            "replies",
            "edit_date",
            "post_author",
            "grouped_id",
            "reactions",
            "restriction_reason",
            "ttl_period",
        ],
    ),
    ("MessageService", &["id", "peer_id", "date", "out", "from_id", "reply_to", "action", "ttl_period"]),
    ("PeerUser", &["user_id"]),
    ("PeerChat", &["chat_id"]),
    ("PeerChannel", &["channel_id"]),
    ("MessageFwdHeader", &["date", "from_id", "from_name", "channel_post", "post_author"]),
    ("MessageReplyHeader", &["reply_to_msg_id", "reply_to_peer_id", "reply_to_top_id", "forum_topic"]),
    ("MessageReactions", &["results", "min", "can_see_list", "recent_reactions"]),
    ("ReactionCount", &["reaction", "count", "chosen_order"]),
    ("ReactionEmoji", &["emoticon"]),
    ("MessageMediaPhoto", &["photo", "spoiler", "ttl_seconds"]),
    ("MessageMediaDocument", &["document", "spoiler", "ttl_seconds"]),
    ("MessageEntityBold", &["offset", "length"]),
    ("MessageEntityItalic", &["offset", "length"]),
    ("MessageEntityUrl", &["offset", "length"]),
    ("MessageEntityTextUrl", &["offset", "length", "url"]),
    ("User", &["id", "is_self", "bot", "first_name", "last_name", "username", "phone", "access_hash"]),
    ("Chat", &["id", "title", "participants_count", "date"]),
    ("Channel", &["id", "title", "username", "broadcast", "megagroup", "access_hash", "date"]),
];

/// Declared field order per object kind. Built once before any record is
/// processed and shared read-only afterwards.
#[derive(Clone, Debug, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Vec<String>>,
}

impl SchemaRegistry {
    pub fn builtin() -> Self {
        let schemas = BUILTIN_SCHEMAS
            .iter()
            .map(|(kind, fields)| {
                (
                    kind.to_string(),
                    fields.iter().map(|field| field.to_string()).collect(),
                )
            })
            .collect();
        Self { schemas }
    }

    /// Merges schemas announced by a client; announced schemas replace
    /// built-in ones of the same kind.
    pub fn merged_with(mut self, announced: HashMap<String, Vec<String>>) -> Self {
        for (kind, fields) in announced {
            if kind.is_empty() {
                continue;
            }
            self.schemas.insert(kind, fields);
        }
        self
    }

    pub fn fields_for(&self, kind: &str) -> Option<&[String]> {
        self.schemas.get(kind).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }
}
