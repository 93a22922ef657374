//! Command and request channel back to the authority.
//!
//! Commands are fire-and-forget `{uuid, patch}` envelopes pushed onto the
//! command list. Requests are the older synchronous path: push
//! `{response, key}` and block on the list named by the correlation id.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;
use worldstate_core::EntityId;

use crate::config::MirrorConfig;
use crate::error::{SyncError, TransportError};
use crate::transport::Transport;

/// A validated change request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeCommand {
    pub uuid: EntityId,
    pub patch: Map<String, Value>,
}

impl ChangeCommand {
    /// Validates the id and that `patch` is a non-empty object.
    pub fn new(uuid: &str, patch: Value) -> Result<Self, SyncError> {
        let uuid = EntityId::parse(uuid)?;
        let patch = match patch {
            Value::Object(fields) if !fields.is_empty() => fields,
            Value::Object(_) => {
                return Err(SyncError::InvalidCommand(format!("empty patch for {uuid}")));
            }
            other => {
                return Err(SyncError::InvalidCommand(format!(
                    "patch for {uuid} must be an object, got {other}"
                )));
            }
        };
        Ok(Self { uuid, patch })
    }

    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        serde_json::to_vec(&CommandEnvelope {
            uuid: &self.uuid,
            patch: &self.patch,
        })
        .map_err(|e| SyncError::InvalidCommand(e.to_string()))
    }
}

#[derive(Serialize)]
struct CommandEnvelope<'a> {
    uuid: &'a EntityId,
    patch: &'a Map<String, Value>,
}

#[derive(Serialize)]
struct RequestEnvelope<'a> {
    response: &'a str,
    key: &'a str,
}

/// Sends commands and requests over a client connection.
#[derive(Clone)]
pub struct CommandChannel {
    client: Arc<dyn Transport>,
    command_list: String,
    request_list: String,
}

impl CommandChannel {
    pub fn new(client: Arc<dyn Transport>, config: &MirrorConfig) -> Self {
        Self {
            client,
            command_list: config.command_list.clone(),
            request_list: config.request_list.clone(),
        }
    }

    pub async fn queue(&self, command: &ChangeCommand) -> Result<(), SyncError> {
        let payload = command.encode()?;
        let len = self.client.rpush(&self.command_list, payload).await?;
        log::debug!("Queued change for {} ({len} pending commands)", command.uuid);
        Ok(())
    }

    /// Validates synchronously, then queues. An invalid command never reaches
    /// the transport.
    pub async fn queue_change(&self, uuid: &str, patch: Value) -> Result<(), SyncError> {
        let command = ChangeCommand::new(uuid, patch)?;
        self.queue(&command).await
    }

    /// Asks the authority for the current value of `uuid` and waits for the
    /// reply without a timeout.
    pub async fn request_value(&self, uuid: &str) -> Result<Value, SyncError> {
        let key = EntityId::parse(uuid)?.to_string();
        let correlation = Uuid::new_v4().to_string();
        let request = serde_json::to_vec(&RequestEnvelope {
            response: &correlation,
            key: &key,
        })
        .map_err(|e| SyncError::InvalidCommand(e.to_string()))?;

        self.client.rpush(&self.request_list, request).await?;
        log::debug!("Requested {key}, awaiting reply on {correlation}");

        let reply = self
            .client
            .blpop(&correlation, None)
            .await?
            .ok_or(SyncError::Transport(TransportError::Closed))?;
        serde_json::from_slice(&reply).map_err(|e| SyncError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_validation() {
        let id = EntityId::new_v4().to_string();
        assert!(ChangeCommand::new(&id, json!({ "hp": 1 })).is_ok());
        assert!(matches!(
            ChangeCommand::new(&id, json!({})),
            Err(SyncError::InvalidCommand(_))
        ));
        assert!(matches!(
            ChangeCommand::new(&id, json!("not-an-object")),
            Err(SyncError::InvalidCommand(_))
        ));
        assert!(matches!(
            ChangeCommand::new("nope", json!({ "hp": 1 })),
            Err(SyncError::State(_))
        ));
    }

    #[test]
    fn test_command_envelope_shape() {
        let id = EntityId::new_v4();
        let command = ChangeCommand::new(&id.to_string(), json!({ "tombstone": true })).unwrap();
        let encoded: Value = serde_json::from_slice(&command.encode().unwrap()).unwrap();
        assert_eq!(encoded, json!({ "uuid": id.to_string(), "patch": { "tombstone": true } }));
    }
}
