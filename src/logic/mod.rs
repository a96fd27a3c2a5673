pub mod allocation;
pub mod apply;
pub mod events;
pub mod jobs;
pub mod kappa;
pub mod reconcile;
pub mod statistics;
pub mod tasks;
pub mod validation;

pub use allocation::{CaseAllocator, DistributedJobsRequest, DistributedJobsResult, DoubleCodingInfo, JobSummary};
pub use apply::{ApplyResultsOutcome, BulkApplyReport, JobApplyReport, JobApplyStatus, ResultsApplier};
pub use events::{CodingEvent, CodingEventListener, EventBus};
pub use jobs::{JobService, SaveProgressResult};
pub use kappa::{cohens_kappa, KappaStats};
pub use reconcile::{
    DoubleCodedItem, DoubleCodedPage, DoubleCodingReconciler, KappaSummary, ResolutionDecision,
    ResolutionReport,
};
pub use statistics::{CodingStatistics, StatisticsCache, STATISTICS_NAMESPACE};
pub use tasks::{ProgressHandle, TaskRunner, TaskSnapshot, TaskState};
pub use validation::{CompletenessValidator, ValidationPage};
