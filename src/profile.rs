//! Named redaction profiles.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::normalize::{Mapping, NormalizedNode, Scalar};

pub const DEFAULT_PROFILE: &str = "default";

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Profile {
    pub stop_keys: HashSet<String>,
    pub stop_objects: HashSet<String>,
    /// Also drop fields and elements left holding null, false, "" or [].
    pub prune_empty: bool,
}

impl Profile {
    pub fn is_identity(&self) -> bool {
        self.stop_keys.is_empty() && self.stop_objects.is_empty() && !self.prune_empty
    }

    /// Removes stop keys and stop objects at any depth.
    ///
    /// Returns `None` when the root itself is a stop object; the caller still
    /// emits an (empty) record for it.
    pub fn redact(&self, node: &NormalizedNode) -> Option<NormalizedNode> {
        match node {
            NormalizedNode::Scalar(_) => Some(node.clone()),
            NormalizedNode::Mapping(mapping) => {
                if self.stop_objects.contains(&mapping.type_tag) {
                    return None;
                }
                let mut redacted = Mapping::new(mapping.type_tag.clone());
                for (name, value) in &mapping.fields {
                    if self.stop_keys.contains(name) {
                        continue;
                    }
                    let Some(value) = self.redact(value) else {
                        continue;
                    };
                    if self.prune_empty && is_empty_value(&value) {
                        continue;
                    }
                    redacted.fields.push((name.clone(), value));
                }
                Some(NormalizedNode::Mapping(redacted))
            }
            NormalizedNode::Sequence(items) => Some(NormalizedNode::Sequence(
                items
                    .iter()
                    .filter_map(|item| self.redact(item))
                    .filter(|item| !(self.prune_empty && is_empty_value(item)))
                    .collect(),
            )),
        }
    }
}

fn is_empty_value(node: &NormalizedNode) -> bool {
    match node {
        NormalizedNode::Scalar(Scalar::Null) | NormalizedNode::Scalar(Scalar::Bool(false)) => true,
        NormalizedNode::Scalar(Scalar::Str(value)) => value.is_empty(),
        NormalizedNode::Sequence(items) => items.is_empty(),
        _ => false,
    }
}

/// All profiles known to this invocation. Loaded once, read-only afterwards.
#[derive(Clone, Debug, Default)]
pub struct ProfileSet {
    profiles: HashMap<String, Profile>,
}

impl ProfileSet {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no profiles file");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let profiles: HashMap<String, Profile> =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Profiles {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self { profiles })
    }

    /// Unknown names resolve to the identity profile.
    pub fn resolve(&self, name: &str) -> Profile {
        match self.profiles.get(name) {
            Some(profile) => profile.clone(),
            None => {
                tracing::debug!(profile = name, "unknown profile, not redacting");
                Profile::default()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }
}
