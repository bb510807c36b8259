//! Agent command session and dispatch engine
//!
//! This crate turns an unreliable, asynchronous request/answer channel to a
//! remote agent into a service with ordering guarantees, timeouts,
//! cancellation and recovery across reconnects.
//!
//! # Architecture
//!
//! - `AgentSession`: per-agent dispatcher (admission, ordered queue, answer
//!   delivery, cancel, disconnect) plus `send_sync` with store reconciliation
//! - `SequenceAllocator`: randomly seeded per-session sequence numbers
//! - `SessionState`: Connecting/Up/Disconnected plus maintenance admission
//! - `ListenerRegistry` and `TimeoutScheduler`: completion callbacks and the
//!   shared alarm pool
//! - `Transport` and `CommandStateStore`: collaborator seams
//! - `AgentManager`: sessions keyed by agent id

pub mod config;
pub mod error;
pub mod listener;
pub mod manager;
pub mod observer;
pub mod pending;
mod reconcile;
pub mod sequence;
pub mod session;
pub mod state;
pub mod store;
pub mod timer;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use config::{DispatchOptions, SessionConfig};
pub use error::{AgentError, Result, StoreError, TransportError};
pub use listener::{Listener, ListenerRegistry, ListenerTimeout};
pub use manager::AgentManager;
pub use observer::{AnswerBus, AnswerObserver};
pub use pending::PendingQueue;
pub use sequence::SequenceAllocator;
pub use session::{AgentSession, SessionBuilder};
pub use state::{AdmissionPolicy, SessionState};
pub use store::{CommandState, CommandStateStore, MemoryCommandStateStore};
pub use timer::TimeoutScheduler;
pub use transport::{DirectTransport, ForwardedRequest, ForwardingTransport, Transport};
pub use types::{
    kinds, AgentId, Answer, Command, CommandResult, DisconnectReason, Request, Sequence,
    SessionStatus,
};
