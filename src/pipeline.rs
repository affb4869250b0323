use serde_json::{Map, Value};

use crate::filter::FilterSpec;
use crate::normalize::{NormalizedNode, Normalizer};
use crate::profile::Profile;
use crate::protocol::RawObject;

#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    Emit(Value),
    Rejected,
}

/// Normalize, then filter, then redact. Filtering always sees the full
/// normalized record.
#[derive(Clone, Debug)]
pub struct Pipeline {
    normalizer: Normalizer,
    filter: FilterSpec,
    profile: Profile,
}

impl Pipeline {
    pub fn new(normalizer: Normalizer, filter: FilterSpec, profile: Profile) -> Self {
        Self {
            normalizer,
            filter,
            profile,
        }
    }

    pub fn process(&self, raw: &RawObject) -> Verdict {
        let node = self.normalizer.normalize(raw);
        if !self.filter.accepts(&node) {
            return Verdict::Rejected;
        }
        Verdict::Emit(self.redact(&node))
    }

    /// For records that are not messages (dialogs, callback queries).
    pub fn process_unfiltered(&self, raw: &RawObject) -> Value {
        self.redact(&self.normalizer.normalize(raw))
    }

    /// Action results only go through the normalizer.
    pub fn normalize_only(&self, raw: &RawObject) -> Value {
        self.normalizer.normalize(raw).to_json()
    }

    fn redact(&self, node: &NormalizedNode) -> Value {
        match self.profile.redact(node) {
            Some(node) => node.to_json(),
            None => Value::Object(Map::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::filter::FilterOptions;
    use crate::protocol::SchemaRegistry;

    fn pipeline(options: FilterOptions, profile: Profile) -> Pipeline {
        Pipeline::new(
            Normalizer::new(Arc::new(SchemaRegistry::builtin())),
            FilterSpec::from_options(&options).expect("valid options"),
            profile,
        )
    }

    #[test]
    fn filter_sees_fields_the_profile_removes() {
        let profile = Profile {
            stop_keys: ["media".to_string()].into_iter().collect(),
            ..Profile::default()
        };
        let pipeline = pipeline(
            FilterOptions {
                has_media: true,
                ..FilterOptions::default()
            },
            profile,
        );
        let raw = RawObject::from_wire(json!({
            "_": "Message",
            "id": 3,
            "media": {"_": "MessageMediaDocument", "document": null}
        }));
        assert_eq!(pipeline.process(&raw), Verdict::Emit(json!({"_": "Message", "id": 3})));
    }

    #[test]
    fn rejected_records_are_not_redacted() {
        let pipeline = pipeline(
            FilterOptions {
                outgoing_only: true,
                ..FilterOptions::default()
            },
            Profile::default(),
        );
        let raw = RawObject::from_wire(json!({"_": "Message", "id": 3, "out": false}));
        assert_eq!(pipeline.process(&raw), Verdict::Rejected);
    }

    #[test]
    fn fully_redacted_root_is_emitted_empty() {
        let profile = Profile {
            stop_objects: ["Message".to_string()].into_iter().collect(),
            ..Profile::default()
        };
        let pipeline = pipeline(FilterOptions::default(), profile);
        let raw = RawObject::from_wire(json!({"_": "Message", "id": 3}));
        assert_eq!(pipeline.process(&raw), Verdict::Emit(json!({})));
    }

    #[test]
    fn unfiltered_records_skip_the_filter() {
        let pipeline = pipeline(
            FilterOptions {
                incoming_only: true,
                ..FilterOptions::default()
            },
            Profile::default(),
        );
        let raw = RawObject::from_wire(json!({"_": "Message", "id": 3, "out": true}));
        assert_eq!(pipeline.process(&raw), Verdict::Rejected);
        assert_eq!(pipeline.process_unfiltered(&raw)["id"], json!(3));
    }
}
