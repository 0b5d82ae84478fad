use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{to_document, Authenticatable, EntityId, EntityKind};

/// End-user account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id", default, skip_serializing_if = "EntityId::is_nil")]
    pub id: EntityId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interests: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ban_reason: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub roles: String,
    /// Favorite restaurants, deduplicated and in insertion order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub favorites: Vec<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl Authenticatable for User {
    fn id(&self) -> EntityId {
        self.id
    }

    fn email(&self) -> &str {
        &self.email
    }

    fn password(&self) -> &str {
        &self.password
    }

    fn role(&self) -> &str {
        &self.roles
    }

    fn kind(&self) -> EntityKind {
        EntityKind::User
    }

    fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    fn document(&self) -> anyhow::Result<Map<String, Value>> {
        to_document(self)
    }

    fn favorites(&self) -> &[EntityId] {
        &self.favorites
    }
}
