//! Entity identity and the JSON document stored per entity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::StateError;

/// Field holding the entity id inside every entity document.
pub const UUID_FIELD: &str = "uuid";

/// Validated entity identifier.
///
/// Ids travel as hyphenated UUID strings on the wire; parsing rejects anything
/// else so malformed ids never reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn parse(s: &str) -> Result<Self, StateError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| StateError::InvalidEntityId(s.to_string()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl FromStr for EntityId {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl From<Uuid> for EntityId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// One replicated entity: a JSON object whose `uuid` field equals its key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity {
    fields: Map<String, Value>,
}

impl Entity {
    /// Fresh entity seeded with only its id.
    pub fn seeded(id: &EntityId) -> Self {
        let mut fields = Map::new();
        fields.insert(UUID_FIELD.to_string(), Value::String(id.to_string()));
        Self { fields }
    }

    /// Wraps an object as the entity `id`, inserting the `uuid` field when it is
    /// missing. Fails if the object names a different id.
    pub fn from_fields(id: &EntityId, mut fields: Map<String, Value>) -> Result<Self, StateError> {
        match fields.get(UUID_FIELD) {
            None => {
                fields.insert(UUID_FIELD.to_string(), Value::String(id.to_string()));
            }
            Some(Value::String(s)) if EntityId::parse(s).ok() == Some(*id) => {
                fields.insert(UUID_FIELD.to_string(), Value::String(id.to_string()));
            }
            Some(other) => {
                return Err(StateError::invalid_patch(
                    id,
                    format!("uuid field {other} does not match key"),
                ))
            }
        }
        Ok(Self { fields })
    }

    /// Id recorded in the document itself.
    pub fn id(&self) -> Option<EntityId> {
        self.fields
            .get(UUID_FIELD)
            .and_then(Value::as_str)
            .and_then(|s| EntityId::parse(s).ok())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub(crate) fn fields_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.fields
    }

    /// True when every `(key, value)` of `filter` is present in this entity.
    /// Nested objects match recursively; everything else compares by equality.
    pub fn matches(&self, filter: &Map<String, Value>) -> bool {
        contains_subset(&self.fields, filter)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

fn contains_subset(haystack: &Map<String, Value>, filter: &Map<String, Value>) -> bool {
    filter.iter().all(|(key, wanted)| match (haystack.get(key), wanted) {
        (Some(Value::Object(have)), Value::Object(want)) => contains_subset(have, want),
        (Some(have), want) => have == want,
        (None, _) => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(EntityId::parse("not-a-uuid").is_err());
        assert!(EntityId::parse("").is_err());
        let id = EntityId::new_v4();
        assert_eq!(EntityId::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn test_seeded_entity_carries_id() {
        let id = EntityId::new_v4();
        let entity = Entity::seeded(&id);
        assert_eq!(entity.id(), Some(id));
        assert_eq!(entity.fields().len(), 1);
    }

    #[test]
    fn test_from_fields_rejects_foreign_uuid() {
        let id = EntityId::new_v4();
        let other = EntityId::new_v4();
        let fields = obj(json!({ "uuid": other.to_string(), "hp": 3 }));
        assert!(Entity::from_fields(&id, fields).is_err());

        let entity = Entity::from_fields(&id, obj(json!({ "hp": 3 }))).unwrap();
        assert_eq!(entity.id(), Some(id));
    }

    #[test]
    fn test_matches_nested_subset() {
        let id = EntityId::new_v4();
        let entity = Entity::from_fields(
            &id,
            obj(json!({ "type": "vessel", "position": { "x": 1, "y": 2 }, "tags": [1, 2] })),
        )
        .unwrap();

        assert!(entity.matches(&obj(json!({ "type": "vessel" }))));
        assert!(entity.matches(&obj(json!({ "position": { "x": 1 } }))));
        assert!(entity.matches(&obj(json!({ "tags": [1, 2] }))));
        assert!(!entity.matches(&obj(json!({ "tags": [1] }))));
        assert!(!entity.matches(&obj(json!({ "type": "station" }))));
        assert!(!entity.matches(&obj(json!({ "missing": null }))));
    }
}
