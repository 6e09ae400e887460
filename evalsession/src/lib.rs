//! A long-lived code-evaluation session for a dynamic scripting runtime.
//!
//! The [`Session`] supervises a spawned evaluator worker: client requests to
//! execute, inspect, or enumerate property names over a snippet of source
//! code are queued onto the single worker in order, and the worker's
//! streamed output, display updates, prompts and results come back through
//! the per-request [`Callbacks`]. See `evalsession-worker` for the other
//! side of the pipe.

pub mod callbacks;
pub mod completion;
pub mod connector;
pub mod docs;
pub mod expression;
pub mod inspection;
pub mod session;

pub use callbacks::{Callbacks, ClientRequest, Output, Replier};
pub use connector::{CommandConnector, Connection, Connector};
pub use docs::DocRecord;
pub use expression::Expression;
pub use inspection::InspectionResult;
pub use nix::sys::signal::Signal;
pub use session::{
    CodeTransform, ExitCallback, ExitOutcome, Session, SessionOptions, Transformed,
};
