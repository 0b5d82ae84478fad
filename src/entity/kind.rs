use std::{fmt, str::FromStr};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Authenticatable, EntityId, Restaurant, User, ID_FIELD};
use crate::{error::AppError, store::Document};

/// Discriminator selecting both the concrete entity type and its storage
/// partition. Serialized as the partition name (`"users"` / `"restaurants"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    #[serde(rename = "users")]
    User,
    #[serde(rename = "restaurants")]
    Restaurant,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::User, EntityKind::Restaurant];

    pub fn partition(self) -> &'static str {
        match self {
            EntityKind::User => "users",
            EntityKind::Restaurant => "restaurants",
        }
    }

    /// Role stamped on every entity of this kind at registration.
    pub fn default_role(self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Restaurant => "restaurant",
        }
    }

    /// Builds the concrete entity for this kind from a request body.
    pub fn decode_request(self, body: Value) -> Result<Box<dyn Authenticatable>, AppError> {
        self.decode(body)
            .map_err(|e| AppError::Validation(format!("invalid {} payload: {e}", self.partition())))
    }

    /// Rehydrates a stored document (or a cached public view) into the
    /// concrete entity for this kind.
    pub fn from_document(self, doc: Document) -> anyhow::Result<Box<dyn Authenticatable>> {
        let Document { id, mut fields } = doc;
        fields.insert(ID_FIELD.into(), Value::String(id.to_hex()));
        self.decode(Value::Object(fields))
            .with_context(|| format!("decode {} document {id}", self.partition()))
    }

    pub(crate) fn from_snapshot(self, snapshot: Value) -> anyhow::Result<Box<dyn Authenticatable>> {
        self.decode(snapshot)
            .with_context(|| format!("decode cached {} snapshot", self.partition()))
    }

    fn decode(self, value: Value) -> serde_json::Result<Box<dyn Authenticatable>> {
        Ok(match self {
            EntityKind::User => Box::new(serde_json::from_value::<User>(value)?),
            EntityKind::Restaurant => Box::new(serde_json::from_value::<Restaurant>(value)?),
        })
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.partition())
    }
}

impl FromStr for EntityKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.partition() == s)
            .ok_or_else(|| AppError::Validation(format!("unknown entity kind: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_parses_from_partition_name() {
        assert_eq!("users".parse::<EntityKind>().unwrap(), EntityKind::User);
        assert_eq!(
            "restaurants".parse::<EntityKind>().unwrap(),
            EntityKind::Restaurant
        );
        assert!("admins".parse::<EntityKind>().is_err());
    }

    #[test]
    fn decode_request_picks_concrete_type() {
        let user = EntityKind::User
            .decode_request(json!({"email": "a@x.com", "password": "secret1", "age": 30}))
            .unwrap();
        assert_eq!(user.kind(), EntityKind::User);
        assert_eq!(user.email(), "a@x.com");
        assert_eq!(user.password(), "secret1");

        let restaurant = EntityKind::Restaurant
            .decode_request(json!({"email": "r@x.com", "password": "pw1234", "averagePrice": 25}))
            .unwrap();
        assert_eq!(restaurant.kind(), EntityKind::Restaurant);
        assert_eq!(restaurant.partition_name(), "restaurants");
    }

    #[test]
    fn decode_request_rejects_malformed_payload() {
        let err = EntityKind::User
            .decode_request(json!({"email": "a@x.com", "age": "old"}))
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn from_document_sets_identifier() {
        let id = EntityId::from_bytes([3; 12]);
        let fields = json!({"email": "a@x.com", "password": "h", "roles": "user"});
        let Value::Object(fields) = fields else { unreachable!() };
        let entity = EntityKind::User
            .from_document(Document { id, fields })
            .unwrap();
        assert_eq!(entity.id(), id);
        assert_eq!(entity.role(), "user");
    }
}
