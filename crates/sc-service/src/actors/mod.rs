//! Actor layer: the coordinator owns all mutable signaling state.

pub mod coordinator;
pub mod messages;

pub use coordinator::{CoordinatorActor, CoordinatorHandle};
pub use messages::{CoordinatorMessage, CoordinatorStatus};
