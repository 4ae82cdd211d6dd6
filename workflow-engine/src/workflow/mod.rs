pub mod models;
pub mod parser;

pub use models::{
    ContinueOnError, Defaults, EventConfig, EventSpec, Job, JobNeeds, Matrix, RunDefaults,
    RunsOn, ScheduleEntry, Step, Strategy, Trigger, Workflow, WorkflowInput,
};
pub use parser::WorkflowParser;
