//! Priority classification, bounded per-tier queues, and the scheduler loop
//! (spec §4.1–§4.2).

pub mod classifier;
pub mod queue;
pub mod scheduler;
pub mod timewindow;

pub use classifier::{ClassifierRule, PriorityClassifier};
pub use queue::{PriorityQueues, QueueStats};
pub use scheduler::{SchedulingPolicy, SchedulerHandle};
pub use timewindow::TimeWindowManager;
