//! Task records: the JSON payload carried by each delivery.
//!
//! The wire shape is a flat JSON object:
//!
//! ```json
//! { "action": "update", "_id": "65f1c0de9a1b2c3d4e5f6a7b", "title": "buy milk" }
//! ```
//!
//! `action` selects the operation, `_id` names the target document and every
//! other key is a field applied verbatim to the stored document.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};

use crate::error::Error;

pub const ACTION_KEY: &str = "action";
pub const ID_KEY: &str = "_id";

/// Field map stored as a document.
pub type Document = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

/// Identifier of a stored document: a 4-byte big-endian creation timestamp
/// followed by 8 random bytes, written as 24 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId([u8; 12]);

impl DocumentId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 12];
        let secs = chrono::Utc::now().timestamp() as u32;
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[4..]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({self})")
    }
}

impl FromStr for DocumentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 24 {
            return Err(Error::validation(format!(
                "malformed {ID_KEY} {s:?}: expected 24 hex characters"
            )));
        }

        let mut bytes = [0u8; 12];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| Error::validation(format!("malformed {ID_KEY} {s:?}: {e}")))?;

        Ok(Self(bytes))
    }
}

impl Serialize for DocumentId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DocumentId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A decoded but not yet validated payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub action: Option<Value>,
    pub id: Option<Value>,
    pub fields: Document,
}

/// A validated task, ready to run against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    Create { fields: Document },
    Update { id: DocumentId, fields: Document },
    Delete { id: DocumentId },
}

impl Task {
    pub fn action(&self) -> Action {
        match self {
            Self::Create { .. } => Action::Create,
            Self::Update { .. } => Action::Update,
            Self::Delete { .. } => Action::Delete,
        }
    }
}

/// Parses a payload into a [`TaskRecord`].
///
/// Anything but a JSON object is a decode error.
pub fn decode(body: &[u8]) -> Result<TaskRecord, Error> {
    let mut fields = match serde_json::from_slice::<Value>(body)? {
        Value::Object(map) => map,
        other => {
            return Err(Error::NotAnObject {
                found: json_type(&other),
            })
        }
    };

    Ok(TaskRecord {
        action: fields.remove(ACTION_KEY),
        id: fields.remove(ID_KEY),
        fields,
    })
}

impl TaskRecord {
    pub fn validate(self) -> Result<Task, Error> {
        let action = match &self.action {
            None => return Err(Error::validation(format!("missing {ACTION_KEY}"))),
            Some(Value::String(s)) => Action::from_str(s)
                .map_err(|_| Error::validation(format!("unknown {ACTION_KEY} {s:?}")))?,
            Some(other) => {
                return Err(Error::validation(format!(
                    "{ACTION_KEY} must be a string, found {}",
                    json_type(other)
                )))
            }
        };

        match action {
            // Create ignores any supplied id; the store assigns one.
            Action::Create => Ok(Task::Create {
                fields: self.fields,
            }),
            Action::Update => Ok(Task::Update {
                id: target_id(action, self.id.as_ref())?,
                fields: self.fields,
            }),
            Action::Delete => Ok(Task::Delete {
                id: target_id(action, self.id.as_ref())?,
            }),
        }
    }
}

fn target_id(action: Action, id: Option<&Value>) -> Result<DocumentId, Error> {
    match id {
        None | Some(Value::Null) => Err(Error::validation(format!(
            "{action} requires {ID_KEY}"
        ))),
        Some(Value::String(s)) => Ok(s.parse::<DocumentId>()?),
        Some(other) => Err(Error::validation(format!(
            "{ID_KEY} must be a string, found {}",
            json_type(other)
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
