use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{types::Json, PgPool};
use thiserror::Error;

use crate::entity::{EntityId, EntityKind};

/// A stored entity: the store-assigned identifier plus its field document.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: EntityId,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique index rejected the write.
    #[error("unique constraint violated")]
    Conflict,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Primary document store, one partition per [`EntityKind`].
///
/// The partition's unique email index is the authority for the email
/// invariant; [`EntityStore::email_taken`] is only a fast path.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn email_taken(
        &self,
        kind: EntityKind,
        email: &str,
        except: Option<EntityId>,
    ) -> StoreResult<bool>;

    async fn insert(&self, kind: EntityKind, fields: Map<String, Value>) -> StoreResult<EntityId>;

    async fn find_by_email(&self, kind: EntityKind, email: &str) -> StoreResult<Option<Document>>;

    async fn find_by_id(&self, kind: EntityKind, id: EntityId) -> StoreResult<Option<Document>>;

    async fn list(&self, kind: EntityKind) -> StoreResult<Vec<Document>>;

    /// Merges `patch` into the stored document. Returns `false` when no
    /// document has this id.
    async fn update_fields(
        &self,
        kind: EntityKind,
        id: EntityId,
        patch: Map<String, Value>,
    ) -> StoreResult<bool>;

    /// Sets `field` to `value` only while it still holds the string
    /// `expected`. Returns `false` when the document is gone or the field
    /// has moved on.
    async fn compare_and_set(
        &self,
        kind: EntityKind,
        id: EntityId,
        field: &str,
        expected: &str,
        value: Value,
    ) -> StoreResult<bool>;

    async fn delete(&self, kind: EntityKind, id: EntityId) -> StoreResult<bool>;

    /// Appends `value` to the array at `field` unless already present.
    async fn add_to_set(
        &self,
        kind: EntityKind,
        id: EntityId,
        field: &str,
        value: Value,
    ) -> StoreResult<bool>;
}

/// Postgres-backed store: every partition is a table of `(id, doc JSONB)`.
#[derive(Clone)]
pub struct PgEntityStore {
    db: PgPool,
}

impl PgEntityStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

type DocumentRow = (Vec<u8>, Json<Map<String, Value>>);

fn into_document((id, Json(fields)): DocumentRow) -> StoreResult<Document> {
    Ok(Document {
        id: EntityId::try_from(id.as_slice())?,
        fields,
    })
}

fn backend(op: &'static str, kind: EntityKind) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| {
        if let sqlx::Error::Database(db_err) = &e {
            if db_err.is_unique_violation() {
                return StoreError::Conflict;
            }
        }
        StoreError::Backend(anyhow!(e).context(format!("{op} on {}", kind.partition())))
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn email_taken(
        &self,
        kind: EntityKind,
        email: &str,
        except: Option<EntityId>,
    ) -> StoreResult<bool> {
        let sql = format!(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM {}
                 WHERE lower(doc->>'email') = lower($1)
                   AND ($2::bytea IS NULL OR id <> $2)
            )
            "#,
            kind.partition()
        );
        let taken = sqlx::query_scalar::<_, bool>(&sql)
            .bind(email)
            .bind(except.map(|id| id.as_bytes().to_vec()))
            .fetch_one(&self.db)
            .await
            .map_err(backend("email lookup", kind))?;
        Ok(taken)
    }

    async fn insert(&self, kind: EntityKind, fields: Map<String, Value>) -> StoreResult<EntityId> {
        let sql = format!(
            "INSERT INTO {} (doc) VALUES ($1) RETURNING id",
            kind.partition()
        );
        let id: Vec<u8> = sqlx::query_scalar(&sql)
            .bind(Json(fields))
            .fetch_one(&self.db)
            .await
            .map_err(backend("insert", kind))?;
        Ok(EntityId::try_from(id.as_slice()).context("store returned malformed id")?)
    }

    async fn find_by_email(&self, kind: EntityKind, email: &str) -> StoreResult<Option<Document>> {
        let sql = format!(
            "SELECT id, doc FROM {} WHERE lower(doc->>'email') = lower($1)",
            kind.partition()
        );
        sqlx::query_as::<_, DocumentRow>(&sql)
            .bind(email)
            .fetch_optional(&self.db)
            .await
            .map_err(backend("find by email", kind))?
            .map(into_document)
            .transpose()
    }

    async fn find_by_id(&self, kind: EntityKind, id: EntityId) -> StoreResult<Option<Document>> {
        let sql = format!("SELECT id, doc FROM {} WHERE id = $1", kind.partition());
        sqlx::query_as::<_, DocumentRow>(&sql)
            .bind(id.as_bytes().to_vec())
            .fetch_optional(&self.db)
            .await
            .map_err(backend("find by id", kind))?
            .map(into_document)
            .transpose()
    }

    async fn list(&self, kind: EntityKind) -> StoreResult<Vec<Document>> {
        let sql = format!(
            "SELECT id, doc FROM {} ORDER BY created_at ASC",
            kind.partition()
        );
        sqlx::query_as::<_, DocumentRow>(&sql)
            .fetch_all(&self.db)
            .await
            .map_err(backend("list", kind))?
            .into_iter()
            .map(into_document)
            .collect()
    }

    async fn update_fields(
        &self,
        kind: EntityKind,
        id: EntityId,
        patch: Map<String, Value>,
    ) -> StoreResult<bool> {
        let sql = format!(
            "UPDATE {} SET doc = doc || $2 WHERE id = $1",
            kind.partition()
        );
        let result = sqlx::query(&sql)
            .bind(id.as_bytes().to_vec())
            .bind(Json(patch))
            .execute(&self.db)
            .await
            .map_err(backend("update", kind))?;
        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_set(
        &self,
        kind: EntityKind,
        id: EntityId,
        field: &str,
        expected: &str,
        value: Value,
    ) -> StoreResult<bool> {
        let sql = format!(
            r#"
            UPDATE {}
               SET doc = jsonb_set(doc, ARRAY[$2::text], $4::jsonb, true)
             WHERE id = $1
               AND doc->>($2::text) = $3
            "#,
            kind.partition()
        );
        let result = sqlx::query(&sql)
            .bind(id.as_bytes().to_vec())
            .bind(field)
            .bind(expected)
            .bind(Json(value))
            .execute(&self.db)
            .await
            .map_err(backend("compare and set", kind))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, kind: EntityKind, id: EntityId) -> StoreResult<bool> {
        let sql = format!("DELETE FROM {} WHERE id = $1", kind.partition());
        let result = sqlx::query(&sql)
            .bind(id.as_bytes().to_vec())
            .execute(&self.db)
            .await
            .map_err(backend("delete", kind))?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_to_set(
        &self,
        kind: EntityKind,
        id: EntityId,
        field: &str,
        value: Value,
    ) -> StoreResult<bool> {
        let sql = format!(
            r#"
            UPDATE {}
               SET doc = jsonb_set(
                     doc,
                     ARRAY[$2::text],
                     CASE WHEN COALESCE(doc->$2, '[]'::jsonb) @> jsonb_build_array($3::jsonb)
                          THEN COALESCE(doc->$2, '[]'::jsonb)
                          ELSE COALESCE(doc->$2, '[]'::jsonb) || jsonb_build_array($3::jsonb)
                     END,
                     true)
             WHERE id = $1
            "#,
            kind.partition()
        );
        let result = sqlx::query(&sql)
            .bind(id.as_bytes().to_vec())
            .bind(field)
            .bind(Json(value))
            .execute(&self.db)
            .await
            .map_err(backend("add to set", kind))?;
        Ok(result.rows_affected() > 0)
    }
}
