//! Frame distribution pipeline
//!
//! Data Flow:
//! ```text
//!                                   ┌─► [FrameQueue] ─► send loop ─► WebSocket
//!                                   │
//! FrameSource ──► StreamSupervisor ─┼─► [FrameQueue] ─► send loop ─► relay TCP
//!   (camera,        (start/stop,    │
//!    relay link)     fan-out)       └─► [FrameQueue] ─► send loop ─► in-process link
//! ```
//!
//! Backpressure never reaches the supervisor:
//! 1. Fan-out enqueues without blocking; a full queue drops the incoming frame
//! 2. A send loop that wakes to several buffered frames sends only the newest
//! 3. The source only streams while at least one consumer is registered

pub mod consumer;
pub mod registry;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use consumer::{Consumer, FrameSink, run_send_loop};
pub use supervisor::{StreamSupervisor, SupervisorHandle, SupervisorOptions};
