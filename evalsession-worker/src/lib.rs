pub mod context;
pub mod introspect;
pub mod mimer;
pub mod server;
pub mod testkit;
pub mod value;

pub use context::{Context, Display};
pub use mimer::CustomMimer;
pub use server::{serve, serve_with_mimer};
pub use value::{BoxValue, DeferredValue, Evaluated, Evaluator, Value, ValueKind};
