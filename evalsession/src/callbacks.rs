use evalsession_core::session_api::{
    ClearOptions, CompletionMatches, ContextId, ErrorOutput, InputOptions, InputRequestId,
    MimeBundle, RequestFrame,
};
use tokio::sync::mpsc::UnboundedSender;

use crate::inspection::InspectionResult;

/// The successful result of a task, shaped by the action that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Result(MimeBundle),
    Completion(CompletionMatches),
    Inspection(InspectionResult),
    Names(Vec<String>),
}

/// A sub-request the worker directed at the client, with routing internals
/// stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Input(InputOptions),
    Clear(ClearOptions),
}

/// Answers an input request. Writes a reply frame carrying the original
/// context and request ids back to the worker.
#[derive(Clone)]
pub struct Replier {
    pub(crate) context: ContextId,
    pub(crate) request: InputRequestId,
    pub(crate) frames: UnboundedSender<RequestFrame>,
}

impl Replier {
    pub fn send(&self, payload: serde_json::Value) {
        // A reply to a worker that already went away is dropped.
        let _ = self.frames.send(RequestFrame::Reply {
            payload,
            context: self.context,
            request: self.request,
        });
    }
}

/// The per-request callback set. Every hook is optional; hooks fire from the
/// controller's message loop, in worker-send order, with `before_run` first
/// and `after_run` last.
#[derive(Default)]
pub struct Callbacks {
    pub before_run: Option<Box<dyn FnMut() + Send>>,
    pub after_run: Option<Box<dyn FnMut() + Send>>,
    pub on_success: Option<Box<dyn FnMut(Output) + Send>>,
    pub on_error: Option<Box<dyn FnMut(ErrorOutput) + Send>>,
    pub on_stdout: Option<Box<dyn FnMut(String) + Send>>,
    pub on_stderr: Option<Box<dyn FnMut(String) + Send>>,
    pub on_display: Option<Box<dyn FnMut(MimeBundle) + Send>>,
    pub on_request: Option<Box<dyn FnMut(ClientRequest, Option<Replier>) + Send>>,
}

impl Callbacks {
    pub(crate) fn fire_before_run(&mut self) {
        if let Some(hook) = self.before_run.as_mut() {
            hook();
        }
    }
    pub(crate) fn fire_after_run(&mut self) {
        if let Some(hook) = self.after_run.as_mut() {
            hook();
        }
    }
    pub(crate) fn fire_success(&mut self, output: Output) {
        if let Some(hook) = self.on_success.as_mut() {
            hook(output);
        }
    }
    pub(crate) fn fire_error(&mut self, error: ErrorOutput) {
        if let Some(hook) = self.on_error.as_mut() {
            hook(error);
        }
    }
    pub(crate) fn fire_stdout(&mut self, data: String) {
        if let Some(hook) = self.on_stdout.as_mut() {
            hook(data);
        }
    }
    pub(crate) fn fire_stderr(&mut self, data: String) {
        if let Some(hook) = self.on_stderr.as_mut() {
            hook(data);
        }
    }
    pub(crate) fn fire_display(&mut self, mime: MimeBundle) {
        if let Some(hook) = self.on_display.as_mut() {
            hook(mime);
        }
    }
    pub(crate) fn fire_request(&mut self, request: ClientRequest, replier: Option<Replier>) {
        if let Some(hook) = self.on_request.as_mut() {
            hook(request, replier);
        }
    }
}
