use std::future::Future;
use std::pin::Pin;

use evalsession_core::session_api::{ErrorOutput, MimeBundle};

use crate::context::Context;

/// Coarse classification of a runtime value, as far as the worker needs to
/// distinguish values for inspection and MIME encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Function,
    Object,
}

/// A value produced by the evaluation primitive.
///
/// The worker never interprets values beyond this interface: it reads enough
/// structure to inspect them, enumerate their property names along the
/// prototype chain, and encode them into MIME bundles. Everything else stays
/// inside the evaluator.
pub trait Value: Send {
    fn kind(&self) -> ValueKind;

    /// Canonical debug rendering of the value (the form a REPL would print).
    fn inspect(&self) -> String;

    /// The value-of form, when the value has a meaningful primitive
    /// conversion. Used in preference to `inspect` for object results.
    fn string_value(&self) -> Option<String> {
        None
    }

    /// The name of the constructor that produced this value, readable when
    /// the value is a prototype on some chain.
    fn constructor_name(&self) -> Option<String> {
        None
    }

    fn prototype(&self) -> Option<BoxValue> {
        None
    }

    fn own_property_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn length(&self) -> Option<usize> {
        None
    }

    /// Stable identity, used to terminate walks over cyclic prototype chains.
    fn identity(&self) -> usize;

    // Hooks picked up by the MIME encoder.
    fn to_mime(&self) -> Option<MimeBundle> {
        None
    }
    fn to_html(&self) -> Option<String> {
        None
    }
    fn to_svg(&self) -> Option<String> {
        None
    }
    fn to_png(&self) -> Option<Vec<u8>> {
        None
    }
    fn to_jpeg(&self) -> Option<Vec<u8>> {
        None
    }
}

pub type BoxValue = Box<dyn Value>;

/// A deferred evaluation result. Awaiting it yields the fulfillment value or
/// the rejection reason.
pub type DeferredValue = Pin<Box<dyn Future<Output = Result<BoxValue, ErrorOutput>> + Send>>;

/// What an evaluation produced: either a value right away, or a deferred
/// value that the worker awaits before emitting a result.
pub enum Evaluated {
    Value(BoxValue),
    Deferred(DeferredValue),
}

/// The language-evaluation primitive, injected by the embedder.
///
/// `eval` takes a source string and returns a value or an error record; the
/// context gives the evaluator access to the per-request helper namespace
/// (streams, result emission, prompts) so it can expose those to user code
/// however the language calls for.
pub trait Evaluator: Send {
    fn eval(&mut self, code: &str, ctx: &Context) -> Result<Evaluated, ErrorOutput>;

    /// The global scope object, used to enumerate property names when a
    /// request names no scope at all.
    fn global(&mut self) -> Result<BoxValue, ErrorOutput>;
}
