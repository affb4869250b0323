use regex::{Regex, RegexBuilder};

use crate::error::ConfigError;
use crate::normalize::NormalizedNode;

/// Filter flags as given on the command line, before validation.
#[derive(Clone, Debug, Default)]
pub struct FilterOptions {
    pub incoming_only: bool,
    pub outgoing_only: bool,
    pub from_user: Option<i64>,
    pub pattern: Option<String>,
    pub has_media: bool,
    pub forwarded_only: bool,
    pub replies_only: bool,
    pub has_reactions: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Clone, Debug)]
enum Predicate {
    Direction(Direction),
    FromUser(i64),
    Pattern(Regex),
    HasMedia,
    Forwarded,
    Reply,
    HasReactions,
}

impl Predicate {
    fn matches(&self, message: &NormalizedNode) -> bool {
        match self {
            Predicate::Direction(direction) => {
                let outgoing = message.get("out").and_then(NormalizedNode::as_bool).unwrap_or(false);
                match direction {
                    Direction::Incoming => !outgoing,
                    Direction::Outgoing => outgoing,
                }
            }
            Predicate::FromUser(user_id) => sender_id(message) == Some(*user_id),
            Predicate::Pattern(pattern) => message
                .get("message")
                .and_then(NormalizedNode::as_str)
                .is_some_and(|text| pattern.is_match(text)),
            Predicate::HasMedia => is_present(message.get("media")),
            Predicate::Forwarded => is_present(message.get("fwd_from")),
            Predicate::Reply => replied_to(message).is_some(),
            Predicate::HasReactions => has_reactions(message.get("reactions")),
        }
    }
}

/// Validated, immutable set of message predicates. All of them must hold for
/// a record to be accepted; an empty filter accepts everything.
#[derive(Clone, Debug, Default)]
pub struct FilterSpec {
    predicates: Vec<Predicate>,
}

impl FilterSpec {
    pub fn from_options(options: &FilterOptions) -> Result<Self, ConfigError> {
        let mut predicates = Vec::new();

        match (options.incoming_only, options.outgoing_only) {
            (true, true) => return Err(ConfigError::ConflictingDirection),
            (true, false) => predicates.push(Predicate::Direction(Direction::Incoming)),
            (false, true) => predicates.push(Predicate::Direction(Direction::Outgoing)),
            (false, false) => {}
        }
        if let Some(user_id) = options.from_user {
            predicates.push(Predicate::FromUser(user_id));
        }
        if let Some(pattern) = options.pattern.as_deref() {
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| ConfigError::InvalidPattern {
                    pattern: pattern.to_string(),
                    source,
                })?;
            predicates.push(Predicate::Pattern(regex));
        }
        if options.has_media {
            predicates.push(Predicate::HasMedia);
        }
        if options.forwarded_only {
            predicates.push(Predicate::Forwarded);
        }
        if options.replies_only {
            predicates.push(Predicate::Reply);
        }
        if options.has_reactions {
            predicates.push(Predicate::HasReactions);
        }

        Ok(Self { predicates })
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn accepts(&self, message: &NormalizedNode) -> bool {
        self.predicates.iter().all(|predicate| predicate.matches(message))
    }
}

fn is_present(node: Option<&NormalizedNode>) -> bool {
    node.is_some_and(|node| !node.is_null())
}

/// Sender id from `from_id`, which is either a bare id or a peer mapping.
fn sender_id(message: &NormalizedNode) -> Option<i64> {
    let from = message.get("from_id")?;
    from.as_i64().or_else(|| {
        ["user_id", "channel_id", "chat_id"]
            .iter()
            .find_map(|key| from.get(key).and_then(NormalizedNode::as_i64))
    })
}

fn replied_to(message: &NormalizedNode) -> Option<i64> {
    if let Some(id) = message.get("reply_to_msg_id").and_then(NormalizedNode::as_i64) {
        return Some(id);
    }
    let reply = message.get("reply_to")?;
    reply
        .as_i64()
        .or_else(|| reply.get("reply_to_msg_id").and_then(NormalizedNode::as_i64))
}

fn has_reactions(reactions: Option<&NormalizedNode>) -> bool {
    match reactions {
        Some(NormalizedNode::Sequence(items)) => !items.is_empty(),
        Some(NormalizedNode::Mapping(mapping)) => {
            matches!(mapping.get("results"), Some(NormalizedNode::Sequence(results)) if !results.is_empty())
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::{json, Value};

    use crate::normalize::Normalizer;
    use crate::protocol::{RawObject, SchemaRegistry};

    fn message(value: Value) -> NormalizedNode {
        Normalizer::new(Arc::new(SchemaRegistry::builtin())).normalize(&RawObject::from_wire(value))
    }

    fn spec(options: FilterOptions) -> FilterSpec {
        FilterSpec::from_options(&options).expect("valid options")
    }

    #[test]
    fn empty_spec_accepts_everything() {
        let spec = spec(FilterOptions::default());
        assert!(spec.is_empty());
        assert!(spec.accepts(&message(json!({"_": "Message", "id": 1}))));
        assert!(spec.accepts(&message(json!("plain text"))));
        assert!(spec.accepts(&message(json!([1, 2, 3]))));
    }

    #[test]
    fn conflicting_direction_is_a_config_error() {
        let options = FilterOptions {
            incoming_only: true,
            outgoing_only: true,
            ..FilterOptions::default()
        };
        assert!(matches!(
            FilterSpec::from_options(&options),
            Err(ConfigError::ConflictingDirection)
        ));
    }

    #[test]
    fn malformed_pattern_is_a_config_error() {
        let options = FilterOptions {
            pattern: Some("([".to_string()),
            ..FilterOptions::default()
        };
        assert!(matches!(
            FilterSpec::from_options(&options),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn direction_uses_out_flag() {
        let incoming = spec(FilterOptions {
            incoming_only: true,
            ..FilterOptions::default()
        });
        let outgoing = spec(FilterOptions {
            outgoing_only: true,
            ..FilterOptions::default()
        });
        let sent = message(json!({"_": "Message", "id": 1, "out": true}));
        let received = message(json!({"_": "Message", "id": 2, "out": false}));
        assert!(outgoing.accepts(&sent));
        assert!(!outgoing.accepts(&received));
        assert!(incoming.accepts(&received));
        assert!(!incoming.accepts(&sent));
    }

    #[test]
    fn media_and_sender_are_combined() {
        let spec = spec(FilterOptions {
            has_media: true,
            from_user: Some(42),
            ..FilterOptions::default()
        });
        let no_media = message(json!({"_": "Message", "id": 1, "from_id": {"_": "PeerUser", "user_id": 42}, "media": null}));
        let other_sender = message(json!({
            "_": "Message", "id": 2,
            "from_id": {"_": "PeerUser", "user_id": 7},
            "media": {"_": "MessageMediaPhoto", "photo": null}
        }));
        let matching = message(json!({
            "_": "Message", "id": 3,
            "from_id": {"_": "PeerUser", "user_id": 42},
            "media": {"_": "MessageMediaPhoto", "photo": null}
        }));
        assert!(!spec.accepts(&no_media));
        assert!(!spec.accepts(&other_sender));
        assert!(spec.accepts(&matching));
    }

    #[test]
    fn sender_may_be_a_bare_id() {
        let spec = spec(FilterOptions {
            from_user: Some(9),
            ..FilterOptions::default()
        });
        assert!(spec.accepts(&message(json!({"_": "Message", "from_id": 9}))));
        assert!(!spec.accepts(&message(json!({"_": "Message"}))));
    }

    #[test]
    fn pattern_searches_case_insensitively_and_requires_text() {
        let spec = spec(FilterOptions {
            pattern: Some("deploy(ed)?".to_string()),
            ..FilterOptions::default()
        });
        assert!(spec.accepts(&message(json!({"_": "Message", "message": "We DEPLOYED it"}))));
        assert!(!spec.accepts(&message(json!({"_": "Message", "message": "nothing here"}))));
        assert!(!spec.accepts(&message(json!({"_": "Message", "id": 1}))));
    }

    #[test]
    fn forwarded_and_reply_need_non_null_references() {
        let forwarded = spec(FilterOptions {
            forwarded_only: true,
            ..FilterOptions::default()
        });
        let replies = spec(FilterOptions {
            replies_only: true,
            ..FilterOptions::default()
        });
        let plain = message(json!({"_": "Message", "fwd_from": null, "reply_to": null}));
        let rich = message(json!({
            "_": "Message",
            "fwd_from": {"_": "MessageFwdHeader", "from_name": "x"},
            "reply_to": {"_": "MessageReplyHeader", "reply_to_msg_id": 12}
        }));
        assert!(!forwarded.accepts(&plain));
        assert!(!replies.accepts(&plain));
        assert!(forwarded.accepts(&rich));
        assert!(replies.accepts(&rich));
    }

    #[test]
    fn reactions_must_be_non_empty() {
        let spec = spec(FilterOptions {
            has_reactions: true,
            ..FilterOptions::default()
        });
        assert!(!spec.accepts(&message(json!({"_": "Message"}))));
        assert!(!spec.accepts(&message(json!({"_": "Message", "reactions": []}))));
        assert!(!spec.accepts(&message(json!({"_": "Message", "reactions": {"_": "MessageReactions", "results": []}}))));
        assert!(spec.accepts(&message(json!({
            "_": "Message",
            "reactions": {"_": "MessageReactions", "results": [{"_": "ReactionCount", "count": 2}]}
        }))));
        assert!(spec.accepts(&message(json!({"_": "Message", "reactions": ["+1"]}))));
    }
}
