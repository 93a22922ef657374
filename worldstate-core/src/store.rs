//! In-memory mirror of the world: entity id → entity.

use std::collections::HashMap;

use serde_json::Value;

use crate::codec;
use crate::entity::{Entity, EntityId, UUID_FIELD};
use crate::error::StateError;
use crate::merge::deep_merge;
use crate::patch::Patch;

/// Field a patch must carry to create an entity that does not exist yet.
pub const DEFAULT_TYPE_FIELD: &str = "type";

/// What a successful [`Store::apply`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// Fields merged into an existing entity, or a new one was created.
    Merged { created: bool },
    /// Tombstone processed. Carries the removed entity, `None` if it was absent.
    Removed(Option<Entity>),
}

/// The entity store.
///
/// Invariant: every key equals the `uuid` field of its entity.
#[derive(Debug, Clone)]
pub struct Store {
    entities: HashMap<EntityId, Entity>,
    type_field: Option<String>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Empty store that requires [`DEFAULT_TYPE_FIELD`] to create entities.
    pub fn new() -> Self {
        Self::with_type_field(Some(DEFAULT_TYPE_FIELD))
    }

    /// Empty store with a custom creation discriminator, or none at all.
    pub fn with_type_field(type_field: Option<impl Into<String>>) -> Self {
        Self {
            entities: HashMap::new(),
            type_field: type_field.map(Into::into),
        }
    }

    pub fn type_field(&self) -> Option<&str> {
        self.type_field.as_deref()
    }

    /// Applies one patch.
    ///
    /// Tombstones are idempotent. A merge into a missing entity seeds it with
    /// its id first and is rejected if the discriminator field is absent. A
    /// rejected patch leaves the store unchanged.
    pub fn apply(&mut self, id: &EntityId, patch: &Patch) -> Result<Applied, StateError> {
        let fields = match patch {
            Patch::Tombstone => return Ok(Applied::Removed(self.entities.remove(id))),
            Patch::Merge(fields) => fields,
        };

        if let Some(claimed) = fields.get(UUID_FIELD) {
            let same = claimed
                .as_str()
                .and_then(|s| EntityId::parse(s).ok())
                .is_some_and(|parsed| parsed == *id);
            if !same {
                return Err(StateError::invalid_patch(id, "patch uuid does not match key"));
            }
        }

        if let Some(entity) = self.entities.get_mut(id) {
            deep_merge(entity.fields_mut(), fields);
            canonicalize_id(entity, id);
            return Ok(Applied::Merged { created: false });
        }

        if let Some(type_field) = &self.type_field {
            if !fields.contains_key(type_field) {
                return Err(StateError::invalid_patch(
                    id,
                    format!("cannot create entity without {type_field:?}"),
                ));
            }
        }

        let mut entity = Entity::seeded(id);
        deep_merge(entity.fields_mut(), fields);
        canonicalize_id(&mut entity, id);
        self.entities.insert(*id, entity);
        Ok(Applied::Merged { created: true })
    }

    /// Decompresses and deep-merges a snapshot into the store.
    ///
    /// The blob is fully decoded before anything is merged, so on error the
    /// store is exactly as it was. Returns the number of entities loaded.
    pub fn load_snapshot(&mut self, compressed: &[u8]) -> Result<usize, StateError> {
        let entities = codec::decode_snapshot(compressed)?;
        let count = entities.len();
        self.merge_entities(entities);
        log::debug!("Snapshot merged: {count} entities, store now holds {}", self.entities.len());
        Ok(count)
    }

    /// Deep-merges already-decoded entities, bypassing the discriminator check.
    pub fn merge_entities(&mut self, entities: HashMap<EntityId, Entity>) {
        for (id, incoming) in entities {
            match self.entities.get_mut(&id) {
                Some(existing) => deep_merge(existing.fields_mut(), incoming.fields()),
                None => {
                    self.entities.insert(id, incoming);
                }
            }
        }
    }

    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityId, &Entity)> {
        self.entities.iter()
    }

    /// Copy of every entity, for callers that must not hold the store.
    pub fn to_map(&self) -> HashMap<EntityId, Entity> {
        self.entities.clone()
    }

    pub fn clear(&mut self) {
        self.entities.clear();
    }
}

// A patch may spell its id in any form `EntityId::parse` accepts; the stored
// document always carries the hyphenated lowercase one.
fn canonicalize_id(entity: &mut Entity, id: &EntityId) {
    entity
        .fields_mut()
        .insert(UUID_FIELD.to_string(), Value::String(id.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::gzip;
    use serde_json::{json, Map};

    fn merge(v: Value) -> Patch {
        match v {
            Value::Object(m) => Patch::Merge(m),
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_create_requires_discriminator() {
        let mut store = Store::new();
        let id = EntityId::new_v4();

        let err = store.apply(&id, &merge(json!({ "hp": 1 }))).unwrap_err();
        assert!(matches!(err, StateError::InvalidPatch { .. }));
        assert!(store.is_empty());

        let applied = store.apply(&id, &merge(json!({ "type": "vessel", "hp": 1 }))).unwrap();
        assert_eq!(applied, Applied::Merged { created: true });
        assert_eq!(store.get(&id).unwrap().get("hp"), Some(&json!(1)));
    }

    #[test]
    fn test_existing_entity_needs_no_discriminator() {
        let mut store = Store::new();
        let id = EntityId::new_v4();
        store.apply(&id, &merge(json!({ "type": "vessel" }))).unwrap();

        let applied = store.apply(&id, &merge(json!({ "hp": 7 }))).unwrap();
        assert_eq!(applied, Applied::Merged { created: false });
    }

    #[test]
    fn test_permissive_store_creates_from_anything() {
        let mut store = Store::with_type_field(None::<String>);
        let id = EntityId::new_v4();
        store.apply(&id, &merge(json!({ "a": 1 }))).unwrap();
        store.apply(&id, &merge(json!({ "b": 2 }))).unwrap();

        let expected = json!({ "uuid": id.to_string(), "a": 1, "b": 2 });
        assert_eq!(store.get(&id).unwrap().clone().into_value(), expected);
    }

    #[test]
    fn test_tombstone_reports_prior_value() {
        let mut store = Store::new();
        let id = EntityId::new_v4();
        store.apply(&id, &merge(json!({ "type": "vessel" }))).unwrap();

        match store.apply(&id, &Patch::Tombstone).unwrap() {
            Applied::Removed(Some(old)) => assert_eq!(old.get("type"), Some(&json!("vessel"))),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.apply(&id, &Patch::Tombstone).unwrap(), Applied::Removed(None));
    }

    #[test]
    fn test_foreign_uuid_in_patch_rejected() {
        let mut store = Store::new();
        let id = EntityId::new_v4();
        let patch = merge(json!({ "type": "vessel", "uuid": EntityId::new_v4().to_string() }));
        assert!(store.apply(&id, &patch).is_err());
        assert!(!store.contains(&id));
    }

    #[test]
    fn test_uppercase_uuid_in_patch_accepted() {
        let mut store = Store::new();
        let id = EntityId::new_v4();
        let upper = id.to_string().to_uppercase();

        let applied = store
            .apply(&id, &merge(json!({ "type": "vessel", "uuid": upper.clone() })))
            .unwrap();
        assert_eq!(applied, Applied::Merged { created: true });
        store.apply(&id, &merge(json!({ "uuid": upper.clone(), "hp": 2 }))).unwrap();

        let entity = store.get(&id).unwrap();
        assert_eq!(entity.get("uuid"), Some(&json!(id.to_string())));
        assert_eq!(entity.get("hp"), Some(&json!(2)));

        // Snapshots accept the same spelling.
        let Patch::Merge(fields) = merge(json!({ "uuid": upper })) else {
            unreachable!()
        };
        let loaded = Entity::from_fields(&id, fields).unwrap();
        assert_eq!(loaded.get("uuid"), Some(&json!(id.to_string())));
    }

    #[test]
    fn test_load_snapshot_merges_into_existing() {
        let mut store = Store::new();
        let id = EntityId::new_v4();
        store
            .apply(&id, &merge(json!({ "type": "vessel", "cargo": { "ore": 1 } })))
            .unwrap();

        let snapshot = json!({ id.to_string(): { "cargo": { "ice": 2 } } });
        let count = store.load_snapshot(&gzip(snapshot.to_string().as_bytes()).unwrap()).unwrap();

        assert_eq!(count, 1);
        assert_eq!(
            store.get(&id).unwrap().get("cargo"),
            Some(&json!({ "ore": 1, "ice": 2 }))
        );
    }

    #[test]
    fn test_corrupt_snapshot_leaves_store_untouched() {
        let mut store = Store::new();
        let id = EntityId::new_v4();
        store.apply(&id, &merge(json!({ "type": "vessel" }))).unwrap();

        let good = EntityId::new_v4();
        let partial = json!({ good.to_string(): { "hp": 1 }, "broken": { "hp": 2 } });
        let result = store.load_snapshot(&gzip(partial.to_string().as_bytes()).unwrap());

        assert!(matches!(result, Err(StateError::CorruptSnapshot(_))));
        assert_eq!(store.len(), 1);
        assert!(!store.contains(&good));
    }

    #[test]
    fn test_to_map_is_a_copy() {
        let mut store = Store::new();
        let id = EntityId::new_v4();
        store.apply(&id, &merge(json!({ "type": "vessel" }))).unwrap();

        let copy = store.to_map();
        store.clear();
        assert!(store.is_empty());
        assert_eq!(copy.len(), 1);
        let _: &Map<String, Value> = copy[&id].fields();
    }
}
