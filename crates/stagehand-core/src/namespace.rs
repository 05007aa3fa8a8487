//! Namespace containers: lazy lookup and creation of entities.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stagehand_store::{Store, StoreExt};
use tokio::sync::RwLock;
use tracing::debug;

use crate::entity::Entity;
use crate::error::{EngineError, EngineResult};

/// Persisted marker for a namespace, keyed by `namespace/{name}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceRecord {
    pub name: String,
}

/// Persisted marker for an entity, keyed by `entity/{ns}/{name}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub name: String,
}

/// Top-level scope (typically an environment) holding entities.
///
/// Entities are created lazily on first reference and cached behind a
/// read/write lock: readers on the hot path, a writer only for
/// first-time creation. The cache rebuilds itself from the store after
/// a restart.
pub struct Namespace {
    name: String,
    store: Arc<dyn Store>,
    entities: RwLock<HashMap<String, Arc<Entity>>>,
}

impl Namespace {
    pub fn new(name: &str, store: Arc<dyn Store>) -> Self {
        Self {
            name: name.to_string(),
            store,
            entities: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn entity_record_key(&self, entity: &str) -> String {
        format!("entity/{}/{}", self.name, entity)
    }

    /// Look up an entity, creating and persisting it on first
    /// reference.
    pub async fn find_or_create_entity(&self, name: &str) -> EngineResult<Arc<Entity>> {
        if name.is_empty() {
            return Err(EngineError::InvalidInput("entity name is empty".into()));
        }

        if let Some(entity) = self.entities.read().await.get(name) {
            return Ok(entity.clone());
        }

        let mut entities = self.entities.write().await;
        if let Some(entity) = entities.get(name) {
            return Ok(entity.clone());
        }

        let record_key = self.entity_record_key(name);
        if self
            .store
            .load_optional::<EntityRecord>(&record_key)?
            .is_none()
        {
            self.store.save(
                &record_key,
                &EntityRecord {
                    name: name.to_string(),
                },
            )?;
            debug!(namespace = %self.name, entity = %name, "entity created");
        }

        let entity = Arc::new(Entity::new(&self.name, name, self.store.clone()));
        entities.insert(name.to_string(), entity.clone());
        Ok(entity)
    }

    /// Names of all persisted entities in this namespace.
    pub fn entity_names(&self) -> EngineResult<Vec<String>> {
        let prefix = format!("entity/{}/", self.name);
        let keys = self.store.load_keys(&prefix)?;
        Ok(keys
            .into_iter()
            .map(|key| key[prefix.len()..].to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_store::RedbStore;

    fn test_namespace() -> Namespace {
        let store = RedbStore::open_in_memory().unwrap();
        Namespace::new("prod", Arc::new(store))
    }

    #[tokio::test]
    async fn fresh_namespace_has_no_entities() {
        let namespace = test_namespace();
        assert!(namespace.entity_names().unwrap().is_empty());
    }

    #[tokio::test]
    async fn find_or_create_persists_once() {
        let namespace = test_namespace();

        let entity = namespace.find_or_create_entity("api").await.unwrap();
        assert_eq!(entity.name(), "api");

        // Second lookup hits the cache and creates nothing new.
        let again = namespace.find_or_create_entity("api").await.unwrap();
        assert!(Arc::ptr_eq(&entity, &again));
        assert_eq!(namespace.entity_names().unwrap(), vec!["api"]);
    }

    #[tokio::test]
    async fn empty_entity_name_is_invalid() {
        let namespace = test_namespace();
        assert!(matches!(
            namespace.find_or_create_entity("").await,
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn entity_names_rebuild_from_the_store() {
        let store: Arc<dyn Store> = Arc::new(RedbStore::open_in_memory().unwrap());
        {
            let namespace = Namespace::new("prod", store.clone());
            namespace.find_or_create_entity("api").await.unwrap();
            namespace.find_or_create_entity("web").await.unwrap();
        }

        // A fresh container over the same store sees both entities.
        let namespace = Namespace::new("prod", store);
        let mut names = namespace.entity_names().unwrap();
        names.sort();
        assert_eq!(names, vec!["api", "web"]);
    }
}
