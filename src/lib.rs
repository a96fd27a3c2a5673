pub mod api;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;

#[cfg(test)]
mod test_support;

// Export API types
pub use api::handlers;
pub use api::routes;
pub use api::state::{AppState, CodingState};

pub use error::{CodingError, Rejection};

// Export logic types
pub use logic::{
    CaseAllocator, CodingEvent, CodingEventListener, CompletenessValidator, DoubleCodingReconciler,
    EventBus, JobService, ResultsApplier, StatisticsCache, TaskRunner,
};

// Export all model types
pub use model::*;

// Export store types
pub use store::{CacheFacade, MemoryStore, PostgresStore, Store};
