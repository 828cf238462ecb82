//! Command protocol
//!
//! One JSON object per line in each direction. A request without an `id`
//! is an event: it is handled but never answered.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ErrorKind, IdentityError};

/// Inbound command or outbound event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Command name, e.g. `user:register`
    pub pattern: String,

    #[serde(default)]
    pub data: Value,
}

impl RequestFrame {
    /// Frame expecting a reply
    pub fn request(id: impl Into<String>, pattern: impl Into<String>, data: Value) -> Self {
        Self {
            id: Some(id.into()),
            pattern: pattern.into(),
            data,
        }
    }

    /// Fire-and-forget frame
    pub fn event(pattern: impl Into<String>, data: Value) -> Self {
        Self {
            id: None,
            pattern: pattern.into(),
            data,
        }
    }

    pub fn expects_reply(&self) -> bool {
        self.id.is_some()
    }
}

/// Answer to a request frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyFrame {
    #[serde(default)]
    pub id: Option<String>,
    pub response: Reply,
}

/// Outcome of a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Reply {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl Reply {
    pub fn message(message: impl Into<String>) -> Self {
        Reply::Ok {
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn data(data: Value) -> Self {
        Reply::Ok {
            message: None,
            data: Some(data),
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Reply::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok { .. })
    }

    /// Error kind, if this is a failure
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Reply::Ok { .. } => None,
            Reply::Error { kind, .. } => Some(*kind),
        }
    }
}

impl From<IdentityError> for Reply {
    fn from(err: IdentityError) -> Self {
        Reply::error(err.kind(), err.public_message())
    }
}
