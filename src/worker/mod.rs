//! # Worker
//!
//! Worker-side execution of assigned step runs: an explicit [`ActionRegistry`]
//! of typed actions, a [`CancellationRegistry`] of running step runs, and the
//! [`WorkerRuntime`] that ties them to the worker's event channel.

pub mod action;
pub mod cancellation;
pub mod registry;
pub mod runtime;

pub use action::{Action, ActionContext, TypedAction};
pub use cancellation::{CancellationRegistry, CancellationToken, Registration};
pub use registry::ActionRegistry;
pub use runtime::{
    ActionEvent, ActionEventType, AssignedAction, AssignedActionType, WorkerRuntime,
};
