use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::api::ApiError;
use crate::output::OutputError;
use crate::realtime::RealtimeError;
use crate::state::StateError;

/// Problems detected before any record is processed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--incoming-only and --outgoing-only cannot be combined")]
    ConflictingDirection,
    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("limit must be greater than zero")]
    InvalidLimit,
    #[error("history.batch_ceiling must be greater than zero")]
    InvalidBatchCeiling,
    #[error("chat reference is empty")]
    EmptyChat,
    #[error("unknown chat: {0}")]
    UnknownChat(String),
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed profiles file {}: {source}", path.display())]
    Profiles {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed config file {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("missing gateway token (set TGPIPE_TOKEN or gateway.token)")]
    MissingToken,
    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Failures reported by the messaging client itself.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("unknown chat: {0}")]
    UnknownChat(String),
    #[error("event stream closed")]
    StreamClosed,
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("history fetch failed: {0}")]
    History(#[source] ClientError),
    #[error("subscription failed: {0}")]
    Subscription(#[source] ClientError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{action} failed: {source}")]
    Client {
        action: &'static str,
        #[source]
        source: ClientError,
    },
    #[error("nothing to send: {0}")]
    NothingToSend(&'static str),
    #[error("{0} must not be empty")]
    EmptyInput(&'static str),
    #[error("attachment {} is larger than {limit_mb}MB", path.display())]
    AttachmentTooLarge { path: PathBuf, limit_mb: u64 },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Output(#[from] OutputError),
}

impl ActionError {
    pub fn client(action: &'static str) -> impl FnOnce(ClientError) -> ActionError {
        move |source| ActionError::Client { action, source }
    }
}

/// Top-level error of one command invocation.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
