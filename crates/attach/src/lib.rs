// # -----------------------------
// # crates/attach/src/lib.rs
// # -----------------------------
//! Re-attach to a running job step.
//!
//! [`AttachCoordinator`] sends one re-attach request down a forwarding tree
//! rooted at the step's first node, while a [`Listener`] collects the task
//! launch and exit reports the step daemons send back. The reports land in
//! a [`TaskStateTracker`] that callers query or wait on.

pub mod backend;
pub mod bitmap;
pub mod coordinator;
pub mod error;
pub mod fanout;
pub mod handler;
pub mod listener;
pub mod port_pool;
pub mod tracker;

pub use backend::{StaticLayoutSource, StepLayoutSource};
pub use bitmap::TaskBitmap;
pub use coordinator::{
    collect_results, AttachCoordinator, AttachPhase, AttachReport, AttachSession, NodeFailure,
};
pub use error::AttachError;
pub use fanout::{build_forward, build_request, FanoutRequest};
pub use handler::{AuthDenied, AuthPolicy};
pub use listener::{estimate_ports, Listener, ListenerOptions};
pub use port_pool::PortPool;
pub use tracker::{TaskCallbacks, TaskState, TaskStateTracker};
