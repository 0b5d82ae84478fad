use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        password::{hash_password, verify_password},
        TokenIssuer, TokenPair, TokenType,
    },
    entity::{
        normalize_email, Authenticatable, EntityId, EntityKind, BANNED_FIELD, EMAIL_FIELD,
        FAVORITES_FIELD, PASSWORD_FIELD, REFRESH_TOKEN_FIELD, ROLES_FIELD,
    },
    error::{AppError, AppResult},
    store::EntityStore,
};

/// Account operations shared by every entity kind. Stateless apart from
/// its handles, so one instance is cloned into every request.
#[derive(Clone)]
pub struct EntityService {
    store: Arc<dyn EntityStore>,
    tokens: Arc<TokenIssuer>,
}

impl EntityService {
    pub fn new(store: Arc<dyn EntityStore>, tokens: Arc<TokenIssuer>) -> Self {
        Self { store, tokens }
    }

    /// Stores a new entity with its password hashed and returns the id the
    /// store assigned.
    #[instrument(skip(self, entity), fields(partition = entity.partition_name()))]
    pub async fn register(&self, entity: &dyn Authenticatable) -> AppResult<EntityId> {
        let kind = entity.kind();
        let email = normalize_email(entity.email());

        // fast path; the unique index settles concurrent registrations
        if self.store.email_taken(kind, &email, None).await? {
            warn!(%email, "email already registered");
            return Err(AppError::DuplicateEmail);
        }

        let hash = hash_password(entity.password())?;
        let mut fields = entity.attributes_for_insert()?;
        fields.insert(EMAIL_FIELD.into(), Value::String(email));
        fields.insert(PASSWORD_FIELD.into(), Value::String(hash));
        fields.insert(ROLES_FIELD.into(), Value::String(kind.default_role().into()));
        fields.insert(BANNED_FIELD.into(), Value::Bool(false));

        let id = self.store.insert(kind, fields).await?;
        info!(entity_id = %id, "entity registered");
        Ok(id)
    }

    #[instrument(skip(self, password))]
    pub async fn authenticate(
        &self,
        email: &str,
        password: &str,
        kind: EntityKind,
    ) -> AppResult<Box<dyn Authenticatable>> {
        let email = normalize_email(email);
        let Some(doc) = self.store.find_by_email(kind, &email).await? else {
            warn!(%email, "login unknown email");
            return Err(AppError::NotFound);
        };
        let entity = kind.from_document(doc)?;

        if !verify_password(password, entity.password())? {
            warn!(entity_id = %entity.id(), "login invalid password");
            return Err(AppError::InvalidCredentials);
        }
        Ok(entity)
    }

    /// Mints a token pair and records the refresh token on the entity.
    #[instrument(skip(self, entity), fields(entity_id = %entity.id(), partition = entity.partition_name()))]
    pub async fn issue_and_persist_tokens(
        &self,
        entity: &dyn Authenticatable,
    ) -> AppResult<TokenPair> {
        let pair = self.tokens.issue_pair(entity)?;

        let mut patch = Map::new();
        patch.insert(
            REFRESH_TOKEN_FIELD.into(),
            Value::String(pair.refresh_token.clone()),
        );
        if !self.store.update_fields(entity.kind(), entity.id(), patch).await? {
            return Err(AppError::NotFound);
        }
        Ok(pair)
    }

    /// Login: the entity carries the submitted email and plaintext password.
    pub async fn authenticate_and_issue_tokens(
        &self,
        credentials: &dyn Authenticatable,
    ) -> AppResult<(Box<dyn Authenticatable>, TokenPair)> {
        let entity = self
            .authenticate(credentials.email(), credentials.password(), credentials.kind())
            .await?;
        let pair = self.issue_and_persist_tokens(entity.as_ref()).await?;
        info!(entity_id = %entity.id(), kind = %entity.kind(), "entity logged in");
        Ok((entity, pair))
    }

    /// Exchanges the current refresh token for a new pair. A token that was
    /// already rotated out no longer matches the stored one and is refused.
    #[instrument(skip(self, refresh_token))]
    pub async fn refresh_tokens(&self, refresh_token: &str, kind: EntityKind) -> AppResult<TokenPair> {
        let claims = self.tokens.verify(refresh_token, TokenType::Refresh)?;
        if claims.kind != kind {
            warn!(token_kind = %claims.kind, "refresh token for another kind");
            return Err(AppError::InvalidToken);
        }

        let entity = self.get_entity(claims.sub, kind).await.map_err(|e| match e {
            AppError::NotFound => AppError::InvalidToken,
            other => other,
        })?;
        if entity.refresh_token() != Some(refresh_token) {
            warn!(entity_id = %claims.sub, "refresh token does not match stored token");
            return Err(AppError::InvalidToken);
        }

        // only one caller may swap out a given token
        let pair = self.tokens.issue_pair(entity.as_ref())?;
        let rotated = self
            .store
            .compare_and_set(
                kind,
                claims.sub,
                REFRESH_TOKEN_FIELD,
                refresh_token,
                Value::String(pair.refresh_token.clone()),
            )
            .await?;
        if !rotated {
            warn!(entity_id = %claims.sub, "refresh token rotated concurrently");
            return Err(AppError::InvalidToken);
        }
        Ok(pair)
    }

    pub async fn get_entity(&self, id: EntityId, kind: EntityKind) -> AppResult<Box<dyn Authenticatable>> {
        let doc = self
            .store
            .find_by_id(kind, id)
            .await?
            .ok_or(AppError::NotFound)?;
        Ok(kind.from_document(doc)?)
    }

    pub async fn list_entities(&self, kind: EntityKind) -> AppResult<Vec<Box<dyn Authenticatable>>> {
        let docs = self.store.list(kind).await?;
        let entities = docs
            .into_iter()
            .map(|doc| kind.from_document(doc))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(entities)
    }

    #[instrument(skip(self, old_password, new_password))]
    pub async fn change_password(
        &self,
        id: EntityId,
        old_password: &str,
        new_password: &str,
        kind: EntityKind,
    ) -> AppResult<()> {
        let entity = self.get_entity(id, kind).await?;
        if !verify_password(old_password, entity.password())? {
            warn!(entity_id = %id, "change password with wrong old password");
            return Err(AppError::InvalidOldPassword);
        }

        let mut patch = Map::new();
        patch.insert(
            PASSWORD_FIELD.into(),
            Value::String(hash_password(new_password)?),
        );
        if !self.store.update_fields(kind, id, patch).await? {
            return Err(AppError::NotFound);
        }
        info!(entity_id = %id, "password changed");
        Ok(())
    }

    /// Overwrites the fields present on `changes`; absent fields are kept.
    #[instrument(skip(self, changes), fields(partition = changes.partition_name()))]
    pub async fn update_entity(&self, id: EntityId, changes: &dyn Authenticatable) -> AppResult<()> {
        let kind = changes.kind();
        let mut patch = changes.attributes_for_update()?;

        if !changes.email().is_empty() {
            let email = normalize_email(changes.email());
            if self.store.email_taken(kind, &email, Some(id)).await? {
                warn!(%email, "email already registered");
                return Err(AppError::DuplicateEmail);
            }
            patch.insert(EMAIL_FIELD.into(), Value::String(email));
        }

        if patch.is_empty() {
            return Err(AppError::Validation("no fields to update".into()));
        }
        if !self.store.update_fields(kind, id, patch).await? {
            return Err(AppError::NotFound);
        }
        info!(entity_id = %id, "entity updated");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_entity(&self, id: EntityId, kind: EntityKind) -> AppResult<()> {
        if !self.store.delete(kind, id).await? {
            return Err(AppError::NotFound);
        }
        info!(entity_id = %id, "entity deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn add_favorite(&self, user_id: EntityId, restaurant_id: EntityId) -> AppResult<()> {
        if self
            .store
            .find_by_id(EntityKind::Restaurant, restaurant_id)
            .await?
            .is_none()
        {
            return Err(AppError::NotFound);
        }

        let added = self
            .store
            .add_to_set(
                EntityKind::User,
                user_id,
                FAVORITES_FIELD,
                Value::String(restaurant_id.to_hex()),
            )
            .await?;
        if !added {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    pub async fn list_favorites(&self, user_id: EntityId) -> AppResult<Vec<EntityId>> {
        let user = self.get_entity(user_id, EntityKind::User).await?;
        Ok(user.favorites().to_vec())
    }
}
