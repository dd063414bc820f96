//! Workflow orchestration for initial setup, capacity expansion, and
//! factory reset.

mod expand;
mod reset;
mod setup;


pub use expand::{expand_disks, ExpandRequest};
pub use reset::{factory_reset, reset_code_lines, ResetCodes};
pub use setup::{initial_setup, SetupRequest};

/// Severity levels used when reporting workflow events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowLevel {
    Info,
    Success,
    Warn,
    Error,
    Security,
}

/// Single line of output produced by a workflow step.
#[derive(Debug, Clone)]
pub struct WorkflowEvent {
    pub level: WorkflowLevel,
    pub message: String,
}

/// Aggregated report returned by any workflow entry point.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub title: String,
    pub events: Vec<WorkflowEvent>,
}

impl WorkflowReport {
    pub fn has_errors(&self) -> bool {
        self.events
            .iter()
            .any(|event| event.level == WorkflowLevel::Error)
    }

    /// Error messages joined for an aggregate HTTP response.
    pub fn error_summary(&self) -> String {
        self.events
            .iter()
            .filter(|event| event.level == WorkflowLevel::Error)
            .map(|event| event.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Emit every event through the logger.
    pub fn log(&self) {
        for event in &self.events {
            match event.level {
                WorkflowLevel::Error => log::error!("{}: {}", self.title, event.message),
                WorkflowLevel::Warn => log::warn!("{}: {}", self.title, event.message),
                _ => log::info!("{}: {}", self.title, event.message),
            }
        }
    }
}

/// Convenience constructor that wraps the repeated boilerplate.
pub(crate) fn event(level: WorkflowLevel, message: impl Into<String>) -> WorkflowEvent {
    WorkflowEvent {
        level,
        message: message.into(),
    }
}
