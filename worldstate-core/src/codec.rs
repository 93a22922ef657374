//! Wire codec: gzip-compressed JSON for tick messages and snapshots.

use std::collections::HashMap;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;

use crate::entity::{Entity, EntityId};
use crate::error::StateError;
use crate::patch::{DecodedTick, TickMessage};

/// Gunzips a blob.
pub fn gunzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::with_capacity(bytes.len() * 4);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Gzips a blob with the default compression level.
pub fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Decodes one compressed tick message from the state channel.
pub fn decode_tick(compressed: &[u8]) -> Result<DecodedTick, StateError> {
    let json = gunzip(compressed).map_err(|e| StateError::CorruptMessage(e.to_string()))?;
    DecodedTick::from_json(&json)
}

/// Encodes a tick message the way the authority publishes it.
pub fn encode_tick(message: &TickMessage) -> Result<Vec<u8>, StateError> {
    let json = serde_json::to_vec(message).map_err(|e| StateError::Encode(e.to_string()))?;
    gzip(&json).map_err(|e| StateError::Encode(e.to_string()))
}

/// Decodes the compressed snapshot: one JSON object mapping uuid to entity.
///
/// Every key must be a valid id and every value an object whose `uuid` (if
/// present) matches its key. Any violation fails the whole snapshot.
pub fn decode_snapshot(compressed: &[u8]) -> Result<HashMap<EntityId, Entity>, StateError> {
    let json = gunzip(compressed).map_err(|e| StateError::CorruptSnapshot(e.to_string()))?;
    let root: Value =
        serde_json::from_slice(&json).map_err(|e| StateError::CorruptSnapshot(e.to_string()))?;

    let Value::Object(entries) = root else {
        return Err(StateError::CorruptSnapshot("root is not an object".to_string()));
    };

    let mut entities = HashMap::with_capacity(entries.len());
    for (key, value) in entries {
        let id = EntityId::parse(&key)
            .map_err(|_| StateError::CorruptSnapshot(format!("invalid entity key {key:?}")))?;
        let Value::Object(fields) = value else {
            return Err(StateError::CorruptSnapshot(format!("entity {id} is not an object")));
        };
        let entity =
            Entity::from_fields(&id, fields).map_err(|e| StateError::CorruptSnapshot(e.to_string()))?;
        entities.insert(id, entity);
    }
    Ok(entities)
}

/// Encodes a full entity map as the authority stores it under the snapshot key.
pub fn encode_snapshot<'a, I>(entities: I) -> Result<Vec<u8>, StateError>
where
    I: IntoIterator<Item = (&'a EntityId, &'a Entity)>,
{
    let root: serde_json::Map<String, Value> = entities
        .into_iter()
        .map(|(id, entity)| (id.to_string(), entity.clone().into_value()))
        .collect();
    let json = serde_json::to_vec(&root).map_err(|e| StateError::Encode(e.to_string()))?;
    gzip(&json).map_err(|e| StateError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::Patch;
    use serde_json::json;

    #[test]
    fn test_tick_survives_the_wire() {
        let id = EntityId::new_v4();
        let mut fields = serde_json::Map::new();
        fields.insert("hp".into(), json!(5));
        let msg = TickMessage::new(42).with_change(id, Patch::Merge(fields));

        let decoded = decode_tick(&encode_tick(&msg).unwrap()).unwrap();
        assert_eq!(decoded.message, msg);
        assert!(decoded.rejected.is_empty());
    }

    #[test]
    fn test_uncompressed_tick_is_corrupt() {
        let err = decode_tick(br#"{"ts":1,"changes":{}}"#).unwrap_err();
        assert!(matches!(err, StateError::CorruptMessage(_)));
    }

    #[test]
    fn test_snapshot_fills_missing_uuid_field() {
        let id = EntityId::new_v4();
        let blob = gzip(json!({ id.to_string(): { "hp": 10 } }).to_string().as_bytes()).unwrap();
        let entities = decode_snapshot(&blob).unwrap();
        assert_eq!(entities[&id].id(), Some(id));
        assert_eq!(entities[&id].get("hp"), Some(&json!(10)));
    }

    #[test]
    fn test_snapshot_shape_errors() {
        let array = gzip(b"[1,2,3]").unwrap();
        assert!(matches!(decode_snapshot(&array), Err(StateError::CorruptSnapshot(_))));

        let bad_key = gzip(br#"{"nope":{}}"#).unwrap();
        assert!(matches!(decode_snapshot(&bad_key), Err(StateError::CorruptSnapshot(_))));

        assert!(matches!(decode_snapshot(b"garbage"), Err(StateError::CorruptSnapshot(_))));
    }
}
