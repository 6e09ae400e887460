use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use evalsession_core::session_api::{
    content_type, ClearOptions, DisplayPayload, ErrorOutput, IdNum, Ids, InputOptions,
    InputRequestId, MessagePayload, MimeBundle, RequestPayload, WorkerMessage,
};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

use crate::mimer::{self, CustomMimer};
use crate::value::{DeferredValue, Value};

/// State shared by all contexts of one worker: the outgoing message sink,
/// the sub-request id allocator with its pending-reply table, and the
/// optional user-installed mimer.
pub(crate) struct WorkerShared {
    pub(crate) outbox: UnboundedSender<WorkerMessage>,
    pub(crate) request_ids: Mutex<Ids>,
    pub(crate) pending_inputs: Mutex<HashMap<IdNum, oneshot::Sender<serde_json::Value>>>,
    pub(crate) mimer: Option<CustomMimer>,
}

impl WorkerShared {
    pub(crate) fn new(
        outbox: UnboundedSender<WorkerMessage>,
        mimer: Option<CustomMimer>,
    ) -> Arc<Self> {
        Arc::new(WorkerShared {
            outbox,
            request_ids: Mutex::new(Ids::new()),
            pending_inputs: Mutex::new(HashMap::new()),
            mimer,
        })
    }

    pub(crate) fn send(&self, message: WorkerMessage) {
        // The controller hanging up mid-evaluation is not an error the
        // evaluator can do anything about.
        let _ = self.outbox.send(message);
    }

    pub(crate) fn deliver_reply(&self, request: IdNum, payload: serde_json::Value) -> Result<()> {
        let tx = self
            .pending_inputs
            .lock()
            .expect("pending input table mutex poisoned")
            .remove(&request);
        match tx {
            Some(tx) => {
                let _ = tx.send(payload);
                Ok(())
            }
            None => anyhow::bail!("reply for unknown request id {}", request),
        }
    }
}

struct ContextState {
    id: IdNum,
    async_flag: AtomicBool,
    done: AtomicBool,
}

/// The per-request runtime frame: carries the context id, the `async` and
/// `done` flags, and the helper namespace exposed to user code for the
/// duration of one evaluation. Cloning shares the frame, so user code may
/// hold on to a context and finalize the request later.
#[derive(Clone)]
pub struct Context {
    state: Arc<ContextState>,
    worker: Arc<WorkerShared>,
}

impl Context {
    pub(crate) fn new(id: IdNum, worker: Arc<WorkerShared>) -> Context {
        Context {
            state: Arc::new(ContextState {
                id,
                async_flag: AtomicBool::new(false),
                done: AtomicBool::new(false),
            }),
            worker,
        }
    }

    pub fn id(&self) -> IdNum {
        self.state.id
    }

    /// Extend the lifetime of this request past the synchronous end of the
    /// evaluation. Returns the new flag.
    pub fn set_async(&self, value: bool) -> bool {
        self.state.async_flag.store(value, Ordering::SeqCst);
        value
    }

    pub fn is_async(&self) -> bool {
        self.state.async_flag.load(Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        self.state.done.load(Ordering::SeqCst)
    }

    fn send(&self, payload: MessagePayload) {
        self.worker
            .send(WorkerMessage::with_context(self.state.id, payload));
    }

    /// Send a terminal message, unless one was already sent for this context.
    fn send_terminal(&self, payload: Option<MessagePayload>) {
        if self.state.done.swap(true, Ordering::SeqCst) {
            // Already finalized; accidental double-finalization is dropped.
            return;
        }
        self.worker.send(WorkerMessage {
            id: Some(self.state.id),
            end: true,
            payload,
        });
    }

    /// Terminal send for worker-internal results (inspections, name lists).
    pub(crate) fn finish_with(&self, payload: MessagePayload) {
        self.send_terminal(Some(payload));
    }

    fn send_bundle(&self, bundle: MimeBundle, keep_alive: bool) {
        if keep_alive {
            self.send(MessagePayload::Result(bundle));
        } else {
            self.send_terminal(Some(MessagePayload::Result(bundle)));
        }
    }

    /// Finalize the request. With a result, the result is serialized through
    /// the MIME encoder and attached; without one, a bare terminal message is
    /// sent.
    pub fn done(&self, result: Option<&dyn Value>) {
        match result {
            Some(value) => self.send_terminal(Some(MessagePayload::Result(self.encode(value)))),
            None => self.send_terminal(None),
        }
    }

    pub fn send_result(&self, value: &dyn Value, keep_alive: bool) {
        self.send_bundle(self.encode(value), keep_alive);
    }

    pub fn send_error(&self, error: ErrorOutput, keep_alive: bool) {
        if keep_alive {
            self.send(MessagePayload::Error(error));
        } else {
            self.send_terminal(Some(MessagePayload::Error(error)));
        }
    }

    pub fn mime(&self, bundle: MimeBundle, keep_alive: bool) {
        self.send_bundle(bundle, keep_alive);
    }

    pub fn text(&self, payload: impl Into<String>, keep_alive: bool) {
        self.send_bundle(MimeBundle::text_plain(payload), keep_alive);
    }

    pub fn html(&self, payload: impl Into<String>, keep_alive: bool) {
        self.send_bundle(
            MimeBundle::single(content_type::TEXT_HTML, payload),
            keep_alive,
        );
    }

    pub fn svg(&self, payload: impl Into<String>, keep_alive: bool) {
        self.send_bundle(
            MimeBundle::single(content_type::IMAGE_SVG, payload),
            keep_alive,
        );
    }

    pub fn png(&self, data: &[u8], keep_alive: bool) {
        self.send_bundle(
            MimeBundle::single(content_type::IMAGE_PNG, BASE64.encode(data)),
            keep_alive,
        );
    }

    pub fn jpeg(&self, data: &[u8], keep_alive: bool) {
        self.send_bundle(
            MimeBundle::single(content_type::IMAGE_JPEG, BASE64.encode(data)),
            keep_alive,
        );
    }

    pub fn json(&self, payload: &serde_json::Value, keep_alive: bool) {
        self.send_bundle(
            MimeBundle::single(content_type::APPLICATION_JSON, payload.to_string()),
            keep_alive,
        );
    }

    /// Issue a prompt request to the client. The async flag is set and the
    /// request goes out before this returns; the returned future resolves
    /// with the client's reply. The request stays open until user code
    /// finalizes it explicitly.
    pub fn input(
        &self,
        options: InputOptions,
    ) -> impl Future<Output = Result<serde_json::Value>> + Send + 'static {
        self.set_async(true);
        let id: InputRequestId = self
            .worker
            .request_ids
            .lock()
            .expect("request id allocator mutex poisoned")
            .next();
        let (tx, rx) = oneshot::channel();
        self.worker
            .pending_inputs
            .lock()
            .expect("pending input table mutex poisoned")
            .insert(id.num(), tx);
        self.send(MessagePayload::Request(RequestPayload::Input {
            options,
            id,
        }));
        async move {
            rx.await
                .context("input request abandoned before a reply arrived")
        }
    }

    /// Ask the client to clear its output area.
    pub fn clear(&self, options: ClearOptions) {
        self.send(MessagePayload::Request(RequestPayload::Clear(options)));
    }

    /// Create a display handle. With an id the display is announced to the
    /// client immediately, and later executions may update it by id.
    pub fn display(&self, display_id: Option<&str>) -> Display {
        Display::new(self, display_id.map(|s| s.to_string()))
    }

    /// Resolve a deferred value into this request's result: sets the async
    /// flag, then emits the fulfillment value as a terminal result, or the
    /// rejection as a terminal error.
    pub fn resolve(&self, deferred: DeferredValue) {
        self.set_async(true);
        let ctx = self.clone();
        tokio::spawn(async move {
            match deferred.await {
                Ok(value) => ctx.send_result(value.as_ref(), false),
                Err(error) => ctx.send_error(error, false),
            }
        });
    }

    pub fn stdout(&self) -> ContextWriter {
        ContextWriter {
            id: self.state.id,
            stream: Stream::Stdout,
            worker: self.worker.clone(),
        }
    }

    pub fn stderr(&self) -> ContextWriter {
        ContextWriter {
            id: self.state.id,
            stream: Stream::Stderr,
            worker: self.worker.clone(),
        }
    }

    fn encode(&self, value: &dyn Value) -> MimeBundle {
        mimer::encode(value, self.worker.mimer.as_ref())
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// A stream sink bound to one context. Each chunk written is forwarded to
/// the controller as a stream message for that context.
#[derive(Clone)]
pub struct ContextWriter {
    id: IdNum,
    stream: Stream,
    worker: Arc<WorkerShared>,
}

impl io::Write for ContextWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let chunk = String::from_utf8_lossy(buf).into_owned();
        let payload = match self.stream {
            Stream::Stdout => MessagePayload::Stdout(chunk),
            Stream::Stderr => MessagePayload::Stderr(chunk),
        };
        self.worker.send(WorkerMessage::with_context(self.id, payload));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A named, updatable output slot. The handle remembers the context it was
/// created under, so updates issued by later evaluations still carry the
/// original display id.
pub struct Display {
    context_id: IdNum,
    display_id: Option<String>,
    worker: Arc<WorkerShared>,
}

impl Display {
    fn new(ctx: &Context, display_id: Option<String>) -> Display {
        let display = Display {
            context_id: ctx.state.id,
            display_id,
            worker: ctx.worker.clone(),
        };
        if let Some(id) = &display.display_id {
            display.send(DisplayPayload::Open(id.clone()));
        }
        display
    }

    fn send(&self, payload: DisplayPayload) {
        self.worker.send(WorkerMessage::with_context(
            self.context_id,
            MessagePayload::Display(payload),
        ));
    }

    pub fn mime(&self, mime: MimeBundle) {
        self.send(DisplayPayload::Update {
            display_id: self.display_id.clone(),
            mime,
        });
    }

    pub fn text(&self, payload: impl Into<String>) {
        self.mime(MimeBundle::text_plain(payload));
    }

    pub fn html(&self, payload: impl Into<String>) {
        self.mime(MimeBundle::single(content_type::TEXT_HTML, payload));
    }

    pub fn svg(&self, payload: impl Into<String>) {
        self.mime(MimeBundle::single(content_type::IMAGE_SVG, payload));
    }

    pub fn png(&self, data: &[u8]) {
        self.mime(MimeBundle::single(content_type::IMAGE_PNG, BASE64.encode(data)));
    }

    pub fn jpeg(&self, data: &[u8]) {
        self.mime(MimeBundle::single(content_type::IMAGE_JPEG, BASE64.encode(data)));
    }

    pub fn json(&self, payload: &serde_json::Value) {
        self.mime(MimeBundle::single(
            content_type::APPLICATION_JSON,
            payload.to_string(),
        ));
    }

    pub fn close(self) {
        if let Some(id) = &self.display_id {
            self.send(DisplayPayload::Close(id.clone()));
        }
    }
}
