/// Messaging between automation groups and the operator front-end
///
/// - **Events**: things a group did (past tense, broadcast on the [`EventBus`])
/// - **Commands**: operator requests (imperative, executed by one controller)
///
/// ```text
/// ┌──────────┐   Command    ┌────────────┐   Event    ┌───────────┐
/// │ Operator │ ───────────> │ Controller │ ─────────> │ Event Bus │ ──> subscribers
/// │ console  │              │  (group)   │            │           │
/// └──────────┘              └────────────┘            └───────────┘
/// ```

pub mod bus;
pub mod commands;
pub mod events;

// Re-export commonly used types
pub use bus::{EventBus, SubscriberId};
pub use commands::{Command, CommandResult};
pub use events::Event;
