//! Core domain models shared across the dispatch fabric.

pub mod project;
pub mod routing;
pub mod schedule;
pub mod task;

pub use project::{ApiKey, Project};
pub use routing::{route_model, ModelTier};
pub use schedule::{Schedule, ScheduleStatus, Recurrence};
pub use task::{ChatAnchor, Task, TaskStatus, TaskUsage};
