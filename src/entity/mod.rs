use std::{fmt, str::FromStr};

use anyhow::Context;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::AppError;

mod kind;
mod restaurant;
mod user;

pub use kind::EntityKind;
pub use restaurant::Restaurant;
pub use user::User;

pub const ID_FIELD: &str = "_id";
pub const EMAIL_FIELD: &str = "email";
pub const PASSWORD_FIELD: &str = "password";
pub const ROLES_FIELD: &str = "roles";
pub const REFRESH_TOKEN_FIELD: &str = "refreshToken";
pub const FAVORITES_FIELD: &str = "favorites";
pub const BANNED_FIELD: &str = "banned";
pub const BAN_REASON_FIELD: &str = "banReason";

/// Fields only the server writes: role, relations and moderation state.
const SERVER_MANAGED_FIELDS: [&str; 4] =
    [ROLES_FIELD, FAVORITES_FIELD, BANNED_FIELD, BAN_REASON_FIELD];

/// Opaque 12-byte identifier assigned by the primary store on insert.
/// Rendered as 24 lowercase hex characters everywhere outside the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EntityId([u8; 12]);

impl EntityId {
    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 12]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for EntityId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 12];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| AppError::Validation("invalid entity id".into()))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<&[u8]> for EntityId {
    type Error = anyhow::Error;

    fn try_from(raw: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; 12] = raw
            .try_into()
            .with_context(|| format!("entity id must be 12 bytes, got {}", raw.len()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Capability contract shared by every account kind.
///
/// Downstream code (registration, login, tokens, caching) only ever sees
/// `&dyn Authenticatable`; the concrete type is chosen once by
/// [`EntityKind`] when a request body or stored document is decoded.
pub trait Authenticatable: fmt::Debug + Send + Sync {
    fn id(&self) -> EntityId;

    fn email(&self) -> &str;

    /// Plaintext on a freshly decoded request body, the Argon2 hash once
    /// the entity has been loaded from the store.
    fn password(&self) -> &str;

    fn role(&self) -> &str;

    fn kind(&self) -> EntityKind;

    fn refresh_token(&self) -> Option<&str>;

    /// Every persisted field, keyed by its stored name.
    fn document(&self) -> anyhow::Result<Map<String, Value>>;

    fn favorites(&self) -> &[EntityId] {
        &[]
    }

    fn partition_name(&self) -> &'static str {
        self.kind().partition()
    }

    /// Fields used to build the insert document. The identifier is assigned
    /// by the store, the refresh token only exists after a login and the
    /// server-managed fields get their defaults at registration.
    fn attributes_for_insert(&self) -> anyhow::Result<Map<String, Value>> {
        let mut fields = self.document()?;
        fields.remove(ID_FIELD);
        fields.remove(REFRESH_TOKEN_FIELD);
        for key in SERVER_MANAGED_FIELDS {
            fields.remove(key);
        }
        Ok(fields)
    }

    /// Fields a partial update may overwrite. Credentials, role and
    /// relations have dedicated operations.
    fn attributes_for_update(&self) -> anyhow::Result<Map<String, Value>> {
        let mut fields = self.document()?;
        for key in [ID_FIELD, EMAIL_FIELD, PASSWORD_FIELD, REFRESH_TOKEN_FIELD]
            .into_iter()
            .chain(SERVER_MANAGED_FIELDS)
        {
            fields.remove(key);
        }
        fields.retain(|_, v| !v.is_null());
        Ok(fields)
    }

    /// Representation handed to callers and cached: never carries the
    /// password hash or the refresh token.
    fn public_view(&self) -> anyhow::Result<Value> {
        let mut fields = self.document()?;
        fields.remove(PASSWORD_FIELD);
        fields.remove(REFRESH_TOKEN_FIELD);
        fields.insert(ID_FIELD.into(), Value::String(self.id().to_hex()));
        Ok(Value::Object(fields))
    }
}

pub(crate) fn to_document<T: Serialize>(entity: &T) -> anyhow::Result<Map<String, Value>> {
    match serde_json::to_value(entity).context("serialize entity")? {
        Value::Object(fields) => Ok(fields),
        other => anyhow::bail!("entity serialized to non-object json: {other}"),
    }
}

/// Emails are compared case-insensitively and without surrounding blanks.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
