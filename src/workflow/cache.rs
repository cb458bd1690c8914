/// Read-through definition cache using ArcSwap
///
/// Sits in front of a `DefinitionSource` and keeps recently loaded
/// definitions for a bounded TTL. Reads are lock-free; each insert or
/// eviction swaps in a new map so concurrent runs never wait on the cache.

use crate::error::EngineResult;
use crate::workflow::{storage::DefinitionSource, types::WorkflowDefinition};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::time::Instant;

/// Cached definition with the instant it was loaded
#[derive(Debug, Clone)]
struct CacheEntry {
    definition: WorkflowDefinition,
    loaded_at: Instant,
}

/// Read-through TTL cache for workflow definitions
///
/// A miss or an expired entry falls back to the backing source and
/// repopulates the cache. Unknown ids are never cached, so a workflow created
/// after a miss is visible on the next lookup.
pub struct CachedDefinitions {
    /// Thread-safe atomic pointer to the cached map
    /// Key: workflow_id
    entries: ArcSwap<HashMap<String, CacheEntry>>,
    /// Persistent store consulted on miss
    source: Arc<dyn DefinitionSource>,
    ttl: Duration,
}

impl CachedDefinitions {
    pub fn new(source: Arc<dyn DefinitionSource>, ttl: Duration) -> Self {
        Self {
            entries: ArcSwap::new(Arc::new(HashMap::new())),
            source,
            ttl,
        }
    }

    /// Drop one cached definition (called after the stored copy changes)
    pub fn invalidate(&self, workflow_id: &str) {
        if !self.entries.load().contains_key(workflow_id) {
            return;
        }

        self.entries.rcu(|current| {
            let mut next = (**current).clone();
            next.remove(workflow_id);
            next
        });
        tracing::debug!("🧹 Invalidated cached definition: {}", workflow_id);
    }

    /// Drop every cached definition
    pub fn clear(&self) {
        self.entries.store(Arc::new(HashMap::new()));
    }

    /// Number of cached entries, fresh or not
    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fresh(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        let entries = self.entries.load();
        let entry = entries.get(workflow_id)?;
        (entry.loaded_at.elapsed() < self.ttl).then(|| entry.definition.clone())
    }
}

#[async_trait]
impl DefinitionSource for CachedDefinitions {
    async fn get_workflow_definition(
        &self,
        workflow_id: &str,
    ) -> EngineResult<Option<WorkflowDefinition>> {
        if let Some(definition) = self.fresh(workflow_id) {
            tracing::debug!("📦 Definition cache hit: {}", workflow_id);
            return Ok(Some(definition));
        }

        tracing::debug!("🔍 Definition cache miss: {}", workflow_id);
        match self.source.get_workflow_definition(workflow_id).await? {
            Some(definition) => {
                let entry = CacheEntry {
                    definition: definition.clone(),
                    loaded_at: Instant::now(),
                };
                self.entries.rcu(|current| {
                    let mut next = (**current).clone();
                    next.insert(workflow_id.to_string(), entry.clone());
                    next
                });
                Ok(Some(definition))
            }
            None => {
                self.invalidate(workflow_id);
                Ok(None)
            }
        }
    }
}
