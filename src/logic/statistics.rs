use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;

use crate::config::CacheConfig;
use crate::error::{CodingError, Result};
use crate::logic::events::{CodingEvent, CodingEventListener};
use crate::model::WorkspaceId;
use crate::store::cache::CacheFacade;
use crate::store::traits::{IncompleteVariable, Store};

/// Cache namespace for everything derived from coding results
pub const STATISTICS_NAMESPACE: &str = "coding-statistics";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodingStatistics {
    pub total_responses: usize,
    /// Effective status → number of responses
    pub status_counts: BTreeMap<String, usize>,
}

/// Owns the cached statistics of every workspace and drops them when coding state changes
#[derive(Clone)]
pub struct StatisticsCache {
    cache: CacheFacade,
    ttl_seconds: u64,
}

impl StatisticsCache {
    pub fn new(cache: CacheFacade, config: &CacheConfig) -> Self {
        Self {
            cache,
            ttl_seconds: config.statistics_ttl_seconds,
        }
    }

    pub async fn coding_statistics<S: Store>(&self, store: &S, workspace_id: WorkspaceId) -> Result<CodingStatistics> {
        self.cached(workspace_id, "status-counts", async {
            let counts = store.count_responses_by_status(workspace_id).await?;
            Ok::<_, CodingError>(CodingStatistics {
                total_responses: counts.iter().map(|(_, n)| n).sum(),
                status_counts: counts
                    .into_iter()
                    .map(|(status, n)| (status.as_str().to_string(), n))
                    .collect(),
            })
        })
        .await
    }

    pub async fn incomplete_variables<S: Store>(
        &self,
        store: &S,
        workspace_id: WorkspaceId,
    ) -> Result<Vec<IncompleteVariable>> {
        self.cached(workspace_id, "incomplete-variables", async {
            Ok::<_, CodingError>(store.list_incomplete_variables(workspace_id).await?)
        })
        .await
    }

    /// Drop every statistics entry of the workspace
    pub async fn invalidate(&self, workspace_id: WorkspaceId) -> anyhow::Result<usize> {
        let prefix = CacheFacade::workspace_prefix(STATISTICS_NAMESPACE, workspace_id);
        let removed = self.cache.delete_prefix(&prefix).await?;
        log::debug!("Dropped {} statistics entries for workspace {}", removed, workspace_id);
        Ok(removed)
    }

    /// Serve `name` from the cache or compute and store it. Cache failures
    /// are logged and the value is computed.
    async fn cached<T, F>(&self, workspace_id: WorkspaceId, name: &str, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: Future<Output = Result<T>>,
    {
        let key = CacheFacade::generate_key(STATISTICS_NAMESPACE, workspace_id, name);
        match self.cache.get::<T>(&key).await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => log::warn!("Ignoring unreadable cache entry {}: {:#}", key, e),
        }

        let value = compute.await?;
        if let Err(e) = self.cache.set(&key, &value, self.ttl_seconds).await {
            log::warn!("Failed to cache {}: {:#}", key, e);
        }
        Ok(value)
    }
}

#[async_trait::async_trait]
impl CodingEventListener for StatisticsCache {
    fn name(&self) -> &str {
        "statistics-cache"
    }

    async fn on_event(&self, event: &CodingEvent) -> anyhow::Result<()> {
        self.invalidate(event.workspace_id()).await?;
        Ok(())
    }
}
