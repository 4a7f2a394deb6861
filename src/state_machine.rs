//! Streaming turn controller
//!
//! Implements the Elm Architecture pattern with pure state transitions.

mod effect;
pub mod event;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use effect::{Effect, TurnFailure};
pub use event::Event;
pub use state::{AttachmentUse, ConvContext, ConvState, PendingTurn};
pub use transition::{transition, Rejection, TransitionError, TransitionResult};
