// Runners Module
// Runner pool, shell execution, file commands and reusable actions

pub mod action;
pub mod file_commands;
pub mod pool;
pub mod shell;

// Re-export key types
pub use action::{Action, ActionContext, ActionError, ActionOutput, ActionRegistry, PostJob};
pub use pool::{RunnerLease, RunnerPool};
pub use shell::{OutputCallback, Shell, ShellInvocation, ShellOutput, ShellRunner};
