use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::{AppConfig, CacheConfig, CodingSettings};
use crate::logic::{EventBus, StatisticsCache, TaskRunner};
use crate::store::cache::CacheFacade;
use crate::store::traits::Store;

/// Everything a request handler needs
pub struct CodingState<S> {
    pub store: Arc<S>,
    pub cache: CacheFacade,
    pub events: EventBus,
    pub tasks: TaskRunner,
    pub statistics: StatisticsCache,
    pub settings: CodingSettings,
    pub cache_config: CacheConfig,
}

pub type AppState<S> = Arc<CodingState<S>>;

impl<S: Store + 'static> CodingState<S> {
    /// State over an in-process cache
    pub fn new(store: Arc<S>, config: &AppConfig) -> AppState<S> {
        Self::with_cache(store, CacheFacade::in_memory(), config)
    }

    pub fn with_cache(store: Arc<S>, cache: CacheFacade, config: &AppConfig) -> AppState<S> {
        let events = EventBus::new();
        let statistics = StatisticsCache::new(cache.clone(), &config.cache);
        events.subscribe(Arc::new(statistics.clone()));

        Arc::new(Self {
            store,
            cache,
            events,
            tasks: TaskRunner::with_retention(Duration::from_secs(config.coding.task_retention_seconds)),
            statistics,
            settings: config.coding,
            cache_config: config.cache,
        })
    }

    /// Sweep expired cache entries and evicted tasks once
    pub async fn purge(&self) -> (usize, usize) {
        let entries = match self.cache.purge_expired().await {
            Ok(removed) => removed,
            Err(e) => {
                log::warn!("Cache purge failed: {:#}", e);
                0
            }
        };
        (entries, self.tasks.purge_finished())
    }

    /// Run [`Self::purge`] every `cache.purge_interval_seconds`
    pub fn start_maintenance(state: AppState<S>) -> JoinHandle<()> {
        let every = Duration::from_secs(state.cache_config.purge_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            log::info!("Maintenance task started ({}s interval)", every.as_secs());

            loop {
                interval.tick().await;
                let (entries, tasks) = state.purge().await;
                if entries > 0 || tasks > 0 {
                    log::info!("Purged {} expired cache entries and {} finished tasks", entries, tasks);
                }
            }
        })
    }
}
