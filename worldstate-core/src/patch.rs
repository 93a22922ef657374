//! Patches and the tick messages that bundle them.

use std::collections::HashMap;

use serde::ser::{Serialize, Serializer};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::entity::EntityId;
use crate::error::StateError;

/// Marker field that turns a patch into a deletion.
pub const TOMBSTONE_FIELD: &str = "tombstone";

/// A partial update for one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    /// Remove the entity.
    Tombstone,
    /// Deep-merge these fields into the entity, creating it if needed.
    Merge(Map<String, Value>),
}

impl Patch {
    /// Interprets a wire value as a patch for `id`.
    ///
    /// `{"tombstone": true}` (with or without other fields) is a deletion; any
    /// other object is a merge. Non-objects are rejected.
    pub fn from_value(id: &EntityId, value: Value) -> Result<Self, StateError> {
        match value {
            Value::Object(fields) => {
                if fields.get(TOMBSTONE_FIELD) == Some(&Value::Bool(true)) {
                    Ok(Self::Tombstone)
                } else {
                    Ok(Self::Merge(fields))
                }
            }
            other => Err(StateError::invalid_patch(
                id,
                format!("expected an object, got {}", json_kind(&other)),
            )),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone)
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Tombstone => {
                let mut fields = Map::new();
                fields.insert(TOMBSTONE_FIELD.to_string(), Value::Bool(true));
                Value::Object(fields)
            }
            Self::Merge(fields) => Value::Object(fields.clone()),
        }
    }
}

impl Serialize for Patch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

/// One consistency step published by the authority.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TickMessage {
    /// Authority clock in milliseconds since the Unix epoch.
    pub ts: u64,
    pub changes: HashMap<EntityId, Patch>,
}

impl TickMessage {
    pub fn new(ts: u64) -> Self {
        Self {
            ts,
            changes: HashMap::new(),
        }
    }

    pub fn with_change(mut self, id: EntityId, patch: Patch) -> Self {
        self.changes.insert(id, patch);
        self
    }

    /// Ids touched by this tick, merged or removed.
    pub fn changed_ids(&self) -> impl Iterator<Item = &EntityId> {
        self.changes.keys()
    }
}

/// Result of decoding a tick: the usable message plus the entries that had to
/// be dropped because their key or patch was malformed.
#[derive(Debug, Clone)]
pub struct DecodedTick {
    pub message: TickMessage,
    pub rejected: Vec<StateError>,
}

#[derive(Deserialize)]
struct RawTick {
    ts: u64,
    #[serde(default)]
    changes: Map<String, Value>,
}

impl DecodedTick {
    pub(crate) fn from_json(bytes: &[u8]) -> Result<Self, StateError> {
        let raw: RawTick = serde_json::from_slice(bytes)
            .map_err(|e| StateError::CorruptMessage(e.to_string()))?;

        let mut message = TickMessage::new(raw.ts);
        let mut rejected = Vec::new();
        for (key, value) in raw.changes {
            let parsed = EntityId::parse(&key)
                .and_then(|id| Ok((id, Patch::from_value(&id, value)?)));
            match parsed {
                Ok((id, patch)) => {
                    message.changes.insert(id, patch);
                }
                Err(e) => rejected.push(e),
            }
        }

        Ok(Self { message, rejected })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
