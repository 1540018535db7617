//! Durable run-execution engine.
//!
//! Manages the lifecycle of long-running asynchronous task executions
//! ("runs") that may outlive the client's willingness to wait, and
//! maintains a durable, replayable per-run event log so disconnected
//! clients can resume watching a run exactly where they left off.
//!
//! The load-bearing guarantees:
//!
//! - a caller's bounded wait never cancels the underlying task; a
//!   wait timeout only marks the run deferred;
//! - the durable log is the single source of truth; the in-process
//!   bus is a liveness optimization that may drop items for slow
//!   subscribers;
//! - event streams handed to clients are gap-free and duplicate-free
//!   across the replay/live seam (subscribe-before-query protocol);
//! - a deferred run that finishes dispatches exactly one follow-up
//!   run, even under duplicate completion signals.

pub mod bus;
pub mod continuation;
pub mod engine;
pub mod heartbeat;
pub mod lifecycle;
pub mod reattach;
pub mod shield;
pub mod store;

pub use bus::EventBus;
pub use continuation::ContinuationDispatcher;
pub use engine::{
    Engine, EngineBuildError, EngineBuilder, EngineError, SubmitRequest, Submitted,
};
pub use heartbeat::HeartbeatMonitor;
pub use lifecycle::{Applied, RunLifecycle, RunOutcome, TransitionError};
pub use reattach::{attach, AttachError, EventStream};
pub use shield::{shielded_wait, WaitOutcome};
pub use store::EventStore;
