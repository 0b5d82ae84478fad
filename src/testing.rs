//! In-memory store and cache used by the unit and router tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{
    auth::TokenIssuer,
    cache::EntityCache,
    config::{random_secret, JwtConfig},
    entity::{normalize_email, EntityId, EntityKind, EMAIL_FIELD},
    store::{Document, EntityStore, StoreError, StoreResult},
};

pub fn test_jwt_config() -> JwtConfig {
    JwtConfig {
        secret: "test-access-secret".into(),
        refresh_secret: random_secret(32),
        issuer: "food&friends".into(),
        ttl_minutes: 15,
        refresh_ttl_minutes: 60 * 24 * 7,
    }
}

pub fn test_issuer() -> TokenIssuer {
    TokenIssuer::new(&test_jwt_config())
}

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<(EntityKind, EntityId, Map<String, Value>)>>,
    next_id: AtomicUsize,
    skip_email_check: AtomicBool,
    fail: AtomicBool,
    frozen: Mutex<Vec<(EntityKind, EntityId, Map<String, Value>)>>,
    read_delay: Mutex<Option<Duration>>,
    pub find_by_id_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn raw(&self, kind: EntityKind, id: EntityId) -> Option<Map<String, Value>> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|(k, i, _)| *k == kind && *i == id)
            .map(|(_, _, fields)| fields.clone())
    }

    /// Makes `email_taken` always answer `false`, leaving only the unique
    /// index to catch duplicates.
    pub fn skip_email_check(&self, on: bool) {
        self.skip_email_check.store(on, Ordering::SeqCst);
    }

    /// Pins what `find_by_id` returns for this record to its current
    /// state, as a reader that loaded it before later writes would see it.
    pub fn freeze_reads(&self, kind: EntityKind, id: EntityId) {
        if let Some(fields) = self.raw(kind, id) {
            self.frozen.lock().unwrap().push((kind, id, fields));
        }
    }

    pub fn set_field(&self, kind: EntityKind, id: EntityId, field: &str, value: Value) {
        let mut rows = self.rows.lock().unwrap();
        if let Some((_, _, fields)) = rows.iter_mut().find(|(k, i, _)| *k == kind && *i == id) {
            fields.insert(field.to_string(), value);
        }
    }

    /// Makes every `find_by_id` wait before answering.
    pub fn delay_reads(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_all(&self, on: bool) {
        self.fail.store(on, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(anyhow::anyhow!("store unavailable")));
        }
        Ok(())
    }

    fn email_of(fields: &Map<String, Value>) -> Option<String> {
        fields
            .get(EMAIL_FIELD)
            .and_then(Value::as_str)
            .map(normalize_email)
    }

    fn conflicts(
        rows: &[(EntityKind, EntityId, Map<String, Value>)],
        kind: EntityKind,
        email: &str,
        except: Option<EntityId>,
    ) -> bool {
        rows.iter().any(|(k, id, fields)| {
            *k == kind && Some(*id) != except && Self::email_of(fields).as_deref() == Some(email)
        })
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn email_taken(
        &self,
        kind: EntityKind,
        email: &str,
        except: Option<EntityId>,
    ) -> StoreResult<bool> {
        self.check()?;
        if self.skip_email_check.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let rows = self.rows.lock().unwrap();
        Ok(Self::conflicts(&rows, kind, &normalize_email(email), except))
    }

    async fn insert(&self, kind: EntityKind, fields: Map<String, Value>) -> StoreResult<EntityId> {
        self.check()?;
        let mut rows = self.rows.lock().unwrap();
        if let Some(email) = Self::email_of(&fields) {
            if Self::conflicts(&rows, kind, &email, None) {
                return Err(StoreError::Conflict);
            }
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&(n as u64).to_be_bytes());
        let id = EntityId::from_bytes(bytes);
        rows.push((kind, id, fields));
        Ok(id)
    }

    async fn find_by_email(&self, kind: EntityKind, email: &str) -> StoreResult<Option<Document>> {
        self.check()?;
        let email = normalize_email(email);
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .find(|(k, _, fields)| *k == kind && Self::email_of(fields).as_deref() == Some(email.as_str()))
            .map(|(_, id, fields)| Document {
                id: *id,
                fields: fields.clone(),
            }))
    }

    async fn find_by_id(&self, kind: EntityKind, id: EntityId) -> StoreResult<Option<Document>> {
        self.find_by_id_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.read_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check()?;
        let frozen = self
            .frozen
            .lock()
            .unwrap()
            .iter()
            .find(|(k, i, _)| *k == kind && *i == id)
            .map(|(_, _, fields)| fields.clone());
        Ok(frozen
            .or_else(|| self.raw(kind, id))
            .map(|fields| Document { id, fields }))
    }

    async fn list(&self, kind: EntityKind) -> StoreResult<Vec<Document>> {
        self.check()?;
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, id, fields)| Document {
                id: *id,
                fields: fields.clone(),
            })
            .collect())
    }

    async fn update_fields(
        &self,
        kind: EntityKind,
        id: EntityId,
        patch: Map<String, Value>,
    ) -> StoreResult<bool> {
        self.check()?;
        let mut rows = self.rows.lock().unwrap();
        if let Some(email) = Self::email_of(&patch) {
            if Self::conflicts(&rows, kind, &email, Some(id)) {
                return Err(StoreError::Conflict);
            }
        }
        let Some((_, _, fields)) = rows.iter_mut().find(|(k, i, _)| *k == kind && *i == id) else {
            return Ok(false);
        };
        fields.extend(patch);
        Ok(true)
    }

    async fn compare_and_set(
        &self,
        kind: EntityKind,
        id: EntityId,
        field: &str,
        expected: &str,
        value: Value,
    ) -> StoreResult<bool> {
        self.check()?;
        let mut rows = self.rows.lock().unwrap();
        let Some((_, _, fields)) = rows.iter_mut().find(|(k, i, _)| *k == kind && *i == id) else {
            return Ok(false);
        };
        if fields.get(field).and_then(Value::as_str) != Some(expected) {
            return Ok(false);
        }
        fields.insert(field.to_string(), value);
        Ok(true)
    }

    async fn delete(&self, kind: EntityKind, id: EntityId) -> StoreResult<bool> {
        self.check()?;
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|(k, i, _)| !(*k == kind && *i == id));
        Ok(rows.len() < before)
    }

    async fn add_to_set(
        &self,
        kind: EntityKind,
        id: EntityId,
        field: &str,
        value: Value,
    ) -> StoreResult<bool> {
        self.check()?;
        let mut rows = self.rows.lock().unwrap();
        let Some((_, _, fields)) = rows.iter_mut().find(|(k, i, _)| *k == kind && *i == id) else {
            return Ok(false);
        };
        let set = fields
            .entry(field.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = set {
            if !items.contains(&value) {
                items.push(value);
            }
        }
        Ok(true)
    }
}

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    pub gets: AtomicUsize,
    pub sets: AtomicUsize,
    pub invalidations: AtomicUsize,
}

impl MemoryCache {
    pub fn fail_reads(&self, on: bool) {
        self.fail_reads.store(on, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn put(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl EntityCache for MemoryCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            anyhow::bail!("cache connection reset");
        }
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, _ttl: Duration) -> anyhow::Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("cache write refused");
        }
        self.put(key, value);
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> anyhow::Result<()> {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}
