//! Chat relay - incremental chat-session synchronization
//!
//! Streams model answers into a local conversation log, persists each
//! finished turn to a remote chat store, and stages one image attachment
//! per turn on an external content host.

pub mod attachment;
pub mod config;
pub mod conversation;
pub mod llm;
pub mod runtime;
pub mod state_machine;
pub mod sync;
