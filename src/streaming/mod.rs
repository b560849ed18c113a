//! # Streaming Sessions
//!
//! Per-upload sessions and the machinery that feeds their clients.
//!
//! ## Key Components:
//! - **Manager**: registry of live sessions, creation limits and teardown
//! - **Session**: state machine, histories and delivery queues of one upload
//! - **Producer**: the background task that extracts and analyzes records
//! - **Queue**: bounded FIFO with an end-of-stream marker and backpressure
//! - **Protocol**: WebSocket envelope and client request handling

pub mod manager;   // SessionManager
pub mod producer;  // Production task
pub mod protocol;  // Wire messages
pub mod queue;     // StreamQueue
pub mod session;   // StreamSession

pub use manager::{ManagerSettings, SessionHandle, SessionManager};
pub use session::{SessionState, SessionStatus};
