//! Application layer module
//!
//! Orchestrates the domain: the scrape worker, policy evaluators, the
//! in-process work queue, the scheduler and sweep loops, and the pipeline
//! wiring that ties them to storage and collaborators.

pub mod content_metrics;
pub mod entity_counts;
pub mod link_discovery;
pub mod pipeline;
pub mod policy;
pub mod scheduler;
pub mod scrape_worker;
pub mod source_sweep;
pub mod work_queue;

// Re-export commonly used items
pub use pipeline::Pipeline;
pub use policy::{DefaultPolicy, PolicyEvaluator, SignalDecayPolicy};
pub use scheduler::{Scheduler, SchedulerPass};
pub use scrape_worker::{Collaborators, ScrapeOutcome, ScrapeWorker};
pub use source_sweep::{SourceSweep, SweepReport};
pub use work_queue::{Job, JobHandler, WorkQueue};
