use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{CacheConfig, CodingSettings};
use crate::error::{CodingError, Rejection, Result};
use crate::logic::tasks::ProgressHandle;
use crate::model::{
    combinations_hash, CombinationStatus, ExpectedCombination, PageInfo, ValidationResult,
    ValidationResultSet, WorkspaceId,
};
use crate::store::cache::CacheFacade;
use crate::store::traits::ResponseStore;

pub const VALIDATION_NAMESPACE: &str = "validation";
pub const CHECKPOINT_NAMESPACE: &str = "validation-progress";

/// One page of a validation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationPage {
    pub results: Vec<ValidationResult>,
    pub total: usize,
    pub missing: usize,
    pub exists: usize,
    pub pagination: PageInfo,
    pub cache_key: String,
    pub from_cache: bool,
    pub timestamp: DateTime<Utc>,
}

impl ValidationPage {
    fn slice(set: &ValidationResultSet, cache_key: String, page: usize, page_size: usize, from_cache: bool) -> Self {
        let pagination = PageInfo::new(set.total, page, page_size);
        Self {
            results: set.results[pagination.range(set.total)].to_vec(),
            total: set.total,
            missing: set.missing,
            exists: set.exists(),
            pagination,
            cache_key,
            from_cache,
            timestamp: set.timestamp,
        }
    }
}

/// Results of one completed batch, starting at `offset` in the request
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointBatch {
    offset: usize,
    results: Vec<ValidationResult>,
}

impl CheckpointBatch {
    fn matches(&self, combinations: &[ExpectedCombination]) -> bool {
        !self.results.is_empty()
            && self.offset + self.results.len() <= combinations.len()
            && self
                .results
                .iter()
                .zip(&combinations[self.offset..])
                .all(|(result, combination)| &result.combination == combination)
    }
}

/// `validation-progress:{ws}:{hash}:{part}`
fn checkpoint_key(workspace_id: WorkspaceId, hash: &str, part: &str) -> String {
    CacheFacade::generate_key(CHECKPOINT_NAMESPACE, workspace_id, &format!("{}:{}", hash, part))
}

fn checkpoint_prefix(workspace_id: WorkspaceId, hash: &str) -> String {
    checkpoint_key(workspace_id, hash, "")
}

/// Checks that every expected combination has response data
pub struct CompletenessValidator<'a, S> {
    store: &'a S,
    cache: &'a CacheFacade,
    batch_size: usize,
    ttl_seconds: u64,
}

impl<'a, S: ResponseStore> CompletenessValidator<'a, S> {
    pub fn new(store: &'a S, cache: &'a CacheFacade, settings: &CodingSettings, cache_config: &CacheConfig) -> Self {
        Self {
            store,
            cache,
            batch_size: settings.validation_batch_size.max(1),
            ttl_seconds: cache_config.validation_ttl_seconds,
        }
    }

    pub fn cache_key(workspace_id: WorkspaceId, combinations: &[ExpectedCombination]) -> String {
        CacheFacade::generate_key(VALIDATION_NAMESPACE, workspace_id, &combinations_hash(combinations))
    }

    /// Validate `combinations` and return the requested page. The full result
    /// set is computed once and cached; later pages are served from the cache.
    pub async fn validate(
        &self,
        workspace_id: WorkspaceId,
        combinations: &[ExpectedCombination],
        page: usize,
        page_size: usize,
        progress: &ProgressHandle,
    ) -> Result<ValidationPage> {
        check_page_size(page_size)?;

        let hash = combinations_hash(combinations);
        let cache_key = CacheFacade::generate_key(VALIDATION_NAMESPACE, workspace_id, &hash);

        let cached: Option<ValidationResultSet> =
            self.cache.get(&cache_key).await.map_err(CodingError::Validation)?;
        if let Some(set) = cached {
            log::debug!("Validation cache hit for {}", cache_key);
            progress.set(100);
            return Ok(ValidationPage::slice(&set, cache_key, page, page_size, true));
        }

        let set = self.compute(workspace_id, combinations, &hash, progress).await?;

        // Stored in full before anyone can page through it
        self.cache
            .set(&cache_key, &set, self.ttl_seconds)
            .await
            .map_err(CodingError::Validation)?;

        self.discard_checkpoint(workspace_id, &hash).await;

        log::info!(
            "Validated {} combinations for workspace {}: {} missing",
            set.total,
            workspace_id,
            set.missing
        );
        Ok(ValidationPage::slice(&set, cache_key, page, page_size, false))
    }

    async fn compute(
        &self,
        workspace_id: WorkspaceId,
        combinations: &[ExpectedCombination],
        hash: &str,
        progress: &ProgressHandle,
    ) -> Result<ValidationResultSet> {
        let (mut results, resumed_batches) = self.resume(workspace_id, hash, combinations).await;
        if !results.is_empty() {
            log::info!(
                "Resuming validation for workspace {} at {}/{}",
                workspace_id,
                results.len(),
                combinations.len()
            );
        }

        let total = combinations.len();
        let start = results.len();
        let batch_count = resumed_batches + (total - start).div_ceil(self.batch_size);

        for (offset, batch) in combinations[start..].chunks(self.batch_size).enumerate() {
            let existing = self
                .store
                .find_existing_combinations(workspace_id, batch)
                .await
                .map_err(CodingError::Validation)?;

            let batch_start = results.len();
            results.extend(batch.iter().map(|combination| ValidationResult {
                combination: combination.clone(),
                status: if existing.contains(combination) {
                    CombinationStatus::Exists
                } else {
                    CombinationStatus::Missing
                },
            }));

            let batch_index = resumed_batches + offset;
            log::debug!(
                "Workspace {}: validated batch {}/{} ({} combinations)",
                workspace_id,
                batch_index + 1,
                batch_count,
                batch.len()
            );
            progress.set_fraction(results.len(), total);

            if results.len() < total {
                let done = CheckpointBatch {
                    offset: batch_start,
                    results: results[batch_start..].to_vec(),
                };
                self.checkpoint(workspace_id, hash, batch_index, &done).await;
            }
        }

        Ok(ValidationResultSet::from_results(results))
    }

    /// Results of an interrupted run over the same list and the number of
    /// batches they came from. A gap or a mismatch discards the checkpoint.
    async fn resume(
        &self,
        workspace_id: WorkspaceId,
        hash: &str,
        combinations: &[ExpectedCombination],
    ) -> (Vec<ValidationResult>, usize) {
        let processed_key = checkpoint_key(workspace_id, hash, "processed");
        let processed: usize = match self.cache.get(&processed_key).await {
            Ok(Some(processed)) => processed,
            Ok(None) => return (Vec::new(), 0),
            Err(e) => {
                log::warn!("Ignoring unreadable validation checkpoint {}: {:#}", processed_key, e);
                self.discard_checkpoint(workspace_id, hash).await;
                return (Vec::new(), 0);
            }
        };

        let mut results = Vec::with_capacity(processed.min(combinations.len()));
        let mut batches = 0;
        while results.len() < processed {
            let key = checkpoint_key(workspace_id, hash, &format!("batch-{}", batches));
            let batch: Option<CheckpointBatch> = self.cache.get(&key).await.unwrap_or_else(|e| {
                log::warn!("Ignoring unreadable validation checkpoint {}: {:#}", key, e);
                None
            });
            match batch {
                Some(batch) if batch.offset == results.len() && batch.matches(combinations) => {
                    results.extend(batch.results);
                    batches += 1;
                }
                _ => {
                    self.discard_checkpoint(workspace_id, hash).await;
                    return (Vec::new(), 0);
                }
            }
        }

        if results.len() != processed {
            self.discard_checkpoint(workspace_id, hash).await;
            return (Vec::new(), 0);
        }
        (results, batches)
    }

    /// Store one finished batch, then advance the processed counter
    async fn checkpoint(&self, workspace_id: WorkspaceId, hash: &str, batch_index: usize, batch: &CheckpointBatch) {
        let key = checkpoint_key(workspace_id, hash, &format!("batch-{}", batch_index));
        if let Err(e) = self.cache.set(&key, batch, self.ttl_seconds).await {
            log::warn!("Failed to checkpoint validation {}: {:#}", key, e);
            return;
        }

        let processed = batch.offset + batch.results.len();
        let processed_key = checkpoint_key(workspace_id, hash, "processed");
        if let Err(e) = self.cache.set(&processed_key, &processed, self.ttl_seconds).await {
            log::warn!("Failed to checkpoint validation {}: {:#}", processed_key, e);
        }
    }

    async fn discard_checkpoint(&self, workspace_id: WorkspaceId, hash: &str) {
        let prefix = checkpoint_prefix(workspace_id, hash);
        if let Err(e) = self.cache.delete_prefix(&prefix).await {
            log::warn!("Failed to drop validation checkpoint {}: {:#}", prefix, e);
        }
    }

    /// A page of an earlier run, or `None` if the run is not cached
    pub async fn cached_page(
        &self,
        workspace_id: WorkspaceId,
        cache_key: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Option<ValidationPage>> {
        check_page_size(page_size)?;
        let key = scoped_key(workspace_id, cache_key)?;
        let cached: Option<ValidationResultSet> = self.cache.get(&key).await?;
        Ok(cached.map(|set| ValidationPage::slice(&set, key, page, page_size, true)))
    }

    /// The complete cached set, for exports
    pub async fn export_all(&self, workspace_id: WorkspaceId, cache_key: &str) -> Result<Option<ValidationResultSet>> {
        let key = scoped_key(workspace_id, cache_key)?;
        Ok(self.cache.get(&key).await?)
    }

    pub async fn invalidate(&self, workspace_id: WorkspaceId, cache_key: &str) -> Result<bool> {
        let key = scoped_key(workspace_id, cache_key)?;
        Ok(self.cache.delete(&key).await?)
    }
}

fn check_page_size(page_size: usize) -> Result<()> {
    if page_size == 0 {
        return Err(CodingError::InvalidInput(
            Rejection::new("validation.invalid-page-size").with("pageSize", page_size),
        ));
    }
    Ok(())
}

/// Accepts either a full `validation:{ws}:{hash}` key of this workspace or a bare hash
fn scoped_key(workspace_id: WorkspaceId, cache_key: &str) -> Result<String> {
    let prefix = CacheFacade::workspace_prefix(VALIDATION_NAMESPACE, workspace_id);
    if let Some(hash) = cache_key.strip_prefix(&prefix) {
        if !hash.is_empty() && !hash.contains(':') {
            return Ok(cache_key.to_string());
        }
    } else if !cache_key.is_empty() && !cache_key.contains(':') {
        return Ok(format!("{}{}", prefix, cache_key));
    }
    Err(CodingError::InvalidInput(
        Rejection::new("validation.invalid-cache-key").with("cacheKey", cache_key),
    ))
}
