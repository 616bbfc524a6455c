//! Live stream multiplexing coordinator: reconciles independently-clocked
//! encoded audio/video chunks onto one monotonic output timeline, frames them
//! into a compact wire protocol and drives the muxer task lifecycle.

pub mod chunk;
pub mod coordinator;
pub mod metadata;
pub mod muxer;
pub mod protocol;
pub mod queue;
pub mod sync;
