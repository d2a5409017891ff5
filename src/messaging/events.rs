/// Event types for automation groups
///
/// Events represent things that have happened (past tense).
/// They are broadcast to all subscribers and always name the group they
/// came from.
use crate::state::{RunStatus, StopReason};

/// Automation events
#[derive(Debug, Clone)]
pub enum Event {
    /// Run status changed
    StatusChanged {
        group: String,
        old: RunStatus,
        new: RunStatus,
    },

    /// A click template qualified and was clicked
    TemplateMatched {
        group: String,
        template: String,
        x: i32,
        y: i32,
        score: f32,
        scale: f32,
    },

    /// A template qualified but the click could not be injected
    ClickFailed {
        group: String,
        template: String,
        message: String,
    },

    /// A loot template qualified outside its cooldown
    LootDetected {
        group: String,
        template: String,
        hits: u32,
    },

    /// A run ended
    Stopped { group: String, reason: StopReason },

    /// A cycle step failed and was skipped
    CycleError { group: String, message: String },

    /// Application is shutting down
    Shutdown,
}

impl Event {
    /// Group that published the event, if any
    pub fn group(&self) -> Option<&str> {
        match self {
            Event::StatusChanged { group, .. }
            | Event::TemplateMatched { group, .. }
            | Event::ClickFailed { group, .. }
            | Event::LootDetected { group, .. }
            | Event::Stopped { group, .. }
            | Event::CycleError { group, .. } => Some(group),
            Event::Shutdown => None,
        }
    }

    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            Event::StatusChanged { group, new, .. } => {
                format!("[{}] {}", group, new.description())
            }
            Event::TemplateMatched {
                group,
                template,
                x,
                y,
                score,
                scale,
            } => format!(
                "[{}] Clicked {} at ({}, {}) score {:.3} scale {:.2}",
                group, template, x, y, score, scale
            ),
            Event::ClickFailed {
                group,
                template,
                message,
            } => format!("[{}] Click on {} failed: {}", group, template, message),
            Event::LootDetected {
                group,
                template,
                hits,
            } => format!("[{}] Loot detected: {} (x{})", group, template, hits),
            Event::Stopped { group, reason } => {
                format!("[{}] {}", group, reason.description())
            }
            Event::CycleError { group, message } => format!("[{}] Error: {}", group, message),
            Event::Shutdown => "Shutting down".to_string(),
        }
    }
}
