// Trigger Module
// Repository events and the filters that decide which workflows they start

pub mod evaluator;
pub mod event;
pub mod filters;

pub use evaluator::{TriggerEvaluator, TriggerMatch, DEFAULT_PULL_REQUEST_TYPES};
pub use event::{classify_ref, RefKind, RepositoryEvent};
pub use filters::{CronSchedule, PatternList};
