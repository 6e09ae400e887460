//! The session controller: owns the spawned evaluator worker, multiplexes
//! client requests onto it through a strictly-ordered queue, correlates
//! worker messages to in-flight tasks by context id, and rebuilds the worker
//! on restart.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::os::unix::process::ExitStatusExt as _;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use evalsession_core::session_api::{
    Action, ContextId, DisplayPayload, ErrorOutput, Id, IdNum, Ids, MessagePayload, RequestFrame,
    RequestPayload, WorkerMessage,
};
use nix::sys::signal::Signal;
use tokio::process::Child;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, warn};

use crate::callbacks::{Callbacks, ClientRequest, Output, Replier};
use crate::completion;
use crate::connector::{self, Connector, LinkEvent};
use crate::expression;
use crate::inspection::{self, InspectionResult};

/// How the worker process ended, as reported by the OS (both fields are
/// empty for in-memory workers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

pub type ExitCallback = Box<dyn FnOnce(ExitOutcome) + Send>;

/// Result of the user-installed code transform: a ready string, or a
/// deferred one that suspends dispatch until it resolves.
pub enum Transformed {
    Ready(String),
    Deferred(Pin<Box<dyn Future<Output = Result<String>> + Send>>),
}

pub type CodeTransform = Box<dyn FnMut(&str) -> Result<Transformed> + Send>;

pub struct SessionOptions {
    pub connector: Box<dyn Connector>,
    /// Applied to `run` tasks only; other actions bypass it.
    pub code_transform: Option<CodeTransform>,
}

impl SessionOptions {
    pub fn new(connector: impl Connector + 'static) -> Self {
        SessionOptions {
            connector: Box::new(connector),
            code_transform: None,
        }
    }

    pub fn command(program: impl Into<String>) -> Self {
        SessionOptions::new(crate::connector::CommandConnector::new(program))
    }

    pub fn with_code_transform(mut self, transform: CodeTransform) -> Self {
        self.code_transform = Some(transform);
        self
    }
}

pub(crate) struct Task {
    pub(crate) action: Action,
    pub(crate) code: String,
    pub(crate) callbacks: Callbacks,
}

enum Command {
    Submit(Task),
    Kill {
        signal: Option<Signal>,
        done: Option<ExitCallback>,
        respawn: bool,
    },
    Reaped {
        exit: ExitOutcome,
        done: Option<ExitCallback>,
        respawn: bool,
    },
    Transformed {
        context: IdNum,
        result: Result<String>,
    },
    Link {
        epoch: u64,
        event: LinkEvent,
    },
    Close,
}

/// A long-lived code-evaluation session. All operations return immediately;
/// results arrive through the per-request callbacks, invoked from the
/// session's message loop.
///
/// Must be created inside a tokio runtime.
pub struct Session {
    commands: UnboundedSender<Command>,
}

impl Session {
    pub fn start(options: SessionOptions) -> Session {
        let (commands, commands_rx) = unbounded_channel();
        let controller = Controller::new(options, commands.clone());
        tokio::spawn(controller.run(commands_rx));
        Session { commands }
    }

    fn submit(&self, task: Task) {
        if self.commands.send(Command::Submit(task)).is_err() {
            warn!("task submitted to a closed session");
        }
    }

    /// Evaluate a piece of source code on the worker.
    pub fn execute(&self, code: impl Into<String>, callbacks: Callbacks) {
        self.submit(Task {
            action: Action::Run,
            code: code.into(),
            callbacks,
        });
    }

    /// Complete the expression under the cursor. When nothing completable is
    /// there, an empty completion is delivered synchronously and the worker
    /// is not engaged.
    pub fn complete(&self, code: &str, cursor_pos: usize, mut callbacks: Callbacks) {
        let expression = match expression::parse(code, cursor_pos) {
            Some(expression) => expression,
            None => {
                callbacks.fire_before_run();
                callbacks.fire_success(Output::Completion(completion::empty(code, cursor_pos)));
                callbacks.fire_after_run();
                return;
            }
        };
        let code = code.to_string();
        let scope = expression.scope.clone();
        let mut on_success = callbacks.on_success.take();
        let wrapped = Callbacks {
            before_run: callbacks.before_run.take(),
            after_run: callbacks.after_run.take(),
            on_error: callbacks.on_error.take(),
            on_success: Some(Box::new(move |output| {
                if let Output::Names(names) = output {
                    let matches = completion::build(&expression, &code, cursor_pos, names);
                    if let Some(hook) = on_success.as_mut() {
                        hook(Output::Completion(matches));
                    }
                }
            })),
            ..Default::default()
        };
        self.submit(Task {
            action: Action::GetAllPropertyNames,
            code: scope,
            callbacks: wrapped,
        });
    }

    /// Inspect the expression under the cursor, resolving documentation for
    /// it where possible. When nothing inspectable is there, an empty
    /// inspection is delivered synchronously and the worker is not engaged.
    pub fn inspect(&self, code: &str, cursor_pos: usize, mut callbacks: Callbacks) {
        let expression =
            expression::parse(code, cursor_pos).filter(|e| !e.matched_text.is_empty());
        let expression = match expression {
            Some(expression) => expression,
            None => {
                callbacks.fire_before_run();
                callbacks.fire_success(Output::Inspection(inspection::empty(code, cursor_pos)));
                callbacks.fire_after_run();
                return;
            }
        };

        let commands = self.commands.clone();
        let code = code.to_string();
        let scope = expression.scope.clone();
        let selector = expression.selector.clone();
        let matched_text = expression.matched_text.clone();
        let finisher = Finisher::new(
            callbacks.on_success.take(),
            callbacks.on_error.take(),
            callbacks.after_run.take(),
        );

        let error_finisher = finisher.clone();
        let wrapped = Callbacks {
            before_run: callbacks.before_run.take(),
            on_error: Some(Box::new(move |e| error_finisher.error(e))),
            on_success: Some(Box::new(move |output| {
                let raw = match output {
                    Output::Inspection(raw) => raw,
                    _ => return,
                };
                let result = InspectionResult {
                    inspection: raw.inspection,
                    code: code.clone(),
                    cursor_pos,
                    matched_text: matched_text.clone(),
                    doc: None,
                };
                if scope.is_empty() {
                    let mut result = result;
                    result.doc = inspection::doc_for_name(&matched_text);
                    finisher.success(Output::Inspection(result));
                    return;
                }
                // Walk the scope's constructor chain for documentation with
                // a second inspection; the lookup is best-effort, an error
                // there still delivers the primary inspection.
                let slot = Arc::new(Mutex::new(Some(result)));
                let success_slot = slot.clone();
                let success_finisher = finisher.clone();
                let error_finisher = finisher.clone();
                let selector = selector.clone();
                let secondary = Task {
                    action: Action::Inspect,
                    code: scope.clone(),
                    callbacks: Callbacks {
                        on_success: Some(Box::new(move |output| {
                            let taken = success_slot
                                .lock()
                                .expect("inspection slot mutex poisoned")
                                .take();
                            if let Some(mut result) = taken {
                                if let Output::Inspection(scope_report) = output {
                                    if let Some(constructors) =
                                        &scope_report.inspection.constructor_list
                                    {
                                        result.doc = inspection::doc_from_constructors(
                                            constructors,
                                            &selector,
                                        );
                                    }
                                }
                                success_finisher.success(Output::Inspection(result));
                            }
                        })),
                        on_error: Some(Box::new(move |_| {
                            let taken = slot
                                .lock()
                                .expect("inspection slot mutex poisoned")
                                .take();
                            if let Some(result) = taken {
                                error_finisher.success(Output::Inspection(result));
                            }
                        })),
                        ..Default::default()
                    },
                };
                if commands.send(Command::Submit(secondary)).is_err() {
                    debug!("session closed before the documentation lookup ran");
                }
            })),
            ..Default::default()
        };
        self.submit(Task {
            action: Action::Inspect,
            code: expression.matched_text,
            callbacks: wrapped,
        });
    }

    /// Terminate the worker. The in-flight task, if any, is dropped without
    /// a result.
    pub fn kill(&self, signal: Option<Signal>, done: Option<ExitCallback>) {
        let _ = self.commands.send(Command::Kill {
            signal,
            done,
            respawn: false,
        });
    }

    /// Terminate the worker and spawn a fresh one. Queued tasks survive and
    /// dispatch once the replacement announces readiness.
    pub fn restart(&self, signal: Option<Signal>, done: Option<ExitCallback>) {
        let _ = self.commands.send(Command::Kill {
            signal,
            done,
            respawn: true,
        });
    }

    /// Shut the session down. Queued tasks are dropped.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// One-shot delivery of the user-facing result hooks, shared between the
/// paths that can produce the final result of a two-phase operation.
#[derive(Clone)]
struct Finisher {
    hooks: Arc<Mutex<Option<FinisherHooks>>>,
}

struct FinisherHooks {
    on_success: Option<Box<dyn FnMut(Output) + Send>>,
    on_error: Option<Box<dyn FnMut(ErrorOutput) + Send>>,
    after_run: Option<Box<dyn FnMut() + Send>>,
}

impl Finisher {
    fn new(
        on_success: Option<Box<dyn FnMut(Output) + Send>>,
        on_error: Option<Box<dyn FnMut(ErrorOutput) + Send>>,
        after_run: Option<Box<dyn FnMut() + Send>>,
    ) -> Finisher {
        Finisher {
            hooks: Arc::new(Mutex::new(Some(FinisherHooks {
                on_success,
                on_error,
                after_run,
            }))),
        }
    }

    fn take(&self) -> Option<FinisherHooks> {
        self.hooks.lock().expect("finisher mutex poisoned").take()
    }

    fn success(&self, output: Output) {
        if let Some(mut hooks) = self.take() {
            if let Some(hook) = hooks.on_success.as_mut() {
                hook(output);
            }
            if let Some(hook) = hooks.after_run.as_mut() {
                hook();
            }
        }
    }

    fn error(&self, error: ErrorOutput) {
        if let Some(mut hooks) = self.take() {
            if let Some(hook) = hooks.on_error.as_mut() {
                hook(error);
            }
            if let Some(hook) = hooks.after_run.as_mut() {
                hook();
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Starting,
    Online,
    Dead,
}

struct Link {
    frames: UnboundedSender<RequestFrame>,
    process: Option<Child>,
}

struct Controller {
    connector: Box<dyn Connector>,
    code_transform: Option<CodeTransform>,
    commands: UnboundedSender<Command>,
    ids: Ids,
    state: WorkerState,
    epoch: u64,
    link: Option<Link>,
    queue: VecDeque<Task>,
    /// Task arena; the context table, display table and last-task slot refer
    /// into it by id.
    tasks: HashMap<IdNum, Task>,
    live: HashSet<IdNum>,
    displays: HashMap<String, IdNum>,
    last_task: Option<IdNum>,
    in_flight: Option<IdNum>,
}

impl Controller {
    fn new(options: SessionOptions, commands: UnboundedSender<Command>) -> Controller {
        Controller {
            connector: options.connector,
            code_transform: options.code_transform,
            commands,
            ids: Ids::new(),
            state: WorkerState::Starting,
            epoch: 0,
            link: None,
            queue: VecDeque::new(),
            tasks: HashMap::new(),
            live: HashSet::new(),
            displays: HashMap::new(),
            last_task: None,
            in_flight: None,
        }
    }

    async fn run(mut self, mut commands: UnboundedReceiver<Command>) {
        self.connect();
        while let Some(command) = commands.recv().await {
            match command {
                Command::Submit(task) => {
                    self.queue.push_back(task);
                    self.dispatch_next();
                }
                Command::Kill {
                    signal,
                    done,
                    respawn,
                } => self.handle_kill(signal, done, respawn),
                Command::Reaped {
                    exit,
                    done,
                    respawn,
                } => {
                    if respawn {
                        self.connect();
                    }
                    if let Some(done) = done {
                        done(exit);
                    }
                }
                Command::Transformed { context, result } => {
                    self.handle_transformed(context, result)
                }
                Command::Link { epoch, event } => self.handle_link_event(epoch, event),
                Command::Close => break,
            }
        }
        self.shutdown();
    }

    fn connect(&mut self) {
        self.epoch += 1;
        match self.connector.connect() {
            Ok(connection) => {
                let (frames, frames_rx) = unbounded_channel();
                tokio::spawn(connector::forward_frames(connection.writer, frames_rx));
                let (events_tx, mut events_rx) = unbounded_channel();
                tokio::spawn(connector::forward_messages(
                    connection.reader,
                    self.epoch,
                    events_tx,
                ));
                let commands = self.commands.clone();
                tokio::spawn(async move {
                    while let Some((epoch, event)) = events_rx.recv().await {
                        if commands.send(Command::Link { epoch, event }).is_err() {
                            break;
                        }
                    }
                });
                self.link = Some(Link {
                    frames,
                    process: connection.process,
                });
                self.state = WorkerState::Starting;
            }
            Err(e) => {
                error!("failed to start the evalsession worker: {:#}", e);
                self.state = WorkerState::Dead;
            }
        }
    }

    fn dispatch_next(&mut self) {
        if self.state != WorkerState::Online || self.in_flight.is_some() {
            return;
        }
        if let Some(task) = self.queue.pop_front() {
            self.run_task(task);
        }
    }

    fn run_task(&mut self, mut task: Task) {
        let id: ContextId = self.ids.next();
        let context = id.num();
        let previous_last = self.last_task.replace(context);
        self.in_flight = Some(context);
        self.live.insert(context);
        task.callbacks.fire_before_run();
        let action = task.action;
        let code = task.code.clone();
        self.tasks.insert(context, task);
        if let Some(previous) = previous_last {
            self.maybe_drop_task(previous);
        }

        if action == Action::Run {
            if let Some(transform) = self.code_transform.as_mut() {
                match transform(&code) {
                    Ok(Transformed::Ready(code)) => self.send_execute(action, code, context),
                    Ok(Transformed::Deferred(deferred)) => {
                        // Dispatch suspends until the transform resolves;
                        // intake continues.
                        let commands = self.commands.clone();
                        tokio::spawn(async move {
                            let result = deferred.await;
                            let _ = commands.send(Command::Transformed { context, result });
                        });
                    }
                    Err(e) => self.synthesize_error(context, e),
                }
                return;
            }
        }
        self.send_execute(action, code, context);
    }

    fn send_execute(&mut self, action: Action, code: String, context: IdNum) {
        if let Some(link) = &self.link {
            let _ = link.frames.send(RequestFrame::Execute {
                action,
                code,
                context: Id::new(context),
            });
        }
    }

    /// A failure that did not come from the worker, shaped and routed like a
    /// worker-produced error.
    fn synthesize_error(&mut self, context: IdNum, e: anyhow::Error) {
        self.handle_message(WorkerMessage {
            id: Some(context),
            end: true,
            payload: Some(MessagePayload::Error(ErrorOutput::from_anyhow(&e))),
        });
    }

    fn handle_transformed(&mut self, context: IdNum, result: Result<String>) {
        if self.in_flight != Some(context) || !self.live.contains(&context) {
            // The worker was killed or restarted in the meantime.
            return;
        }
        match result {
            Ok(code) => self.send_execute(Action::Run, code, context),
            Err(e) => self.synthesize_error(context, e),
        }
    }

    fn handle_link_event(&mut self, epoch: u64, event: LinkEvent) {
        if epoch != self.epoch {
            return;
        }
        match event {
            LinkEvent::Message(message) => self.handle_message(message),
            LinkEvent::Closed => {
                debug!("worker channel closed");
                self.state = WorkerState::Dead;
                self.link = None;
                if let Some(context) = self.in_flight.take() {
                    self.live.remove(&context);
                    self.maybe_drop_task(context);
                }
            }
        }
    }

    fn handle_message(&mut self, message: WorkerMessage) {
        let WorkerMessage { id, end, payload } = message;
        match &payload {
            Some(MessagePayload::Log(text)) => {
                debug!(target: "evalsession::worker", "{}", text);
                return;
            }
            Some(MessagePayload::Status(status)) => {
                if status == "online" {
                    self.state = WorkerState::Online;
                    self.dispatch_next();
                } else {
                    warn!("unknown worker status: {}", status);
                }
                return;
            }
            _ => {}
        }

        let task_id = id
            .filter(|context| self.live.contains(context))
            .or(self.last_task);

        match payload {
            Some(MessagePayload::Display(DisplayPayload::Open(display_id))) => {
                if let Some(owner) = task_id {
                    self.displays.insert(display_id, owner);
                }
            }
            Some(MessagePayload::Display(DisplayPayload::Update { display_id, mime })) => {
                // The display table owns the update while its task is still
                // live; afterwards the update belongs to the execution that
                // triggered it.
                let owner = display_id
                    .and_then(|d| self.displays.get(&d).copied())
                    .filter(|owner| self.live.contains(owner))
                    .or(task_id);
                if let Some(owner) = owner {
                    self.with_task(owner, |task| task.callbacks.fire_display(mime));
                }
            }
            Some(MessagePayload::Display(DisplayPayload::Close(display_id))) => {
                if let Some(owner) = self.displays.remove(&display_id) {
                    self.maybe_drop_task(owner);
                }
            }
            Some(MessagePayload::Request(RequestPayload::Clear(options))) => {
                if let Some(owner) = task_id {
                    self.with_task(owner, |task| {
                        task.callbacks.fire_request(ClientRequest::Clear(options), None)
                    });
                }
            }
            Some(MessagePayload::Request(RequestPayload::Input {
                options,
                id: request,
            })) => {
                let replier = self.link.as_ref().zip(id).map(|(link, context)| Replier {
                    context: Id::new(context),
                    request,
                    frames: link.frames.clone(),
                });
                if let Some(owner) = task_id {
                    self.with_task(owner, |task| {
                        task.callbacks
                            .fire_request(ClientRequest::Input(options), replier)
                    });
                }
            }
            Some(MessagePayload::Stdout(data)) => {
                if let Some(owner) = task_id {
                    self.with_task(owner, |task| task.callbacks.fire_stdout(data));
                }
            }
            Some(MessagePayload::Stderr(data)) => {
                if let Some(owner) = task_id {
                    self.with_task(owner, |task| task.callbacks.fire_stderr(data));
                }
            }
            Some(MessagePayload::Error(error)) => {
                if let Some(owner) = task_id {
                    self.with_task(owner, |task| task.callbacks.fire_error(error));
                }
            }
            Some(MessagePayload::Result(mime)) => {
                if let Some(owner) = task_id {
                    self.with_task(owner, |task| {
                        task.callbacks.fire_success(Output::Result(mime))
                    });
                }
            }
            Some(MessagePayload::Completion(completion)) => {
                if let Some(owner) = task_id {
                    self.with_task(owner, |task| {
                        task.callbacks.fire_success(Output::Completion(completion))
                    });
                }
            }
            Some(MessagePayload::Inspection(report)) => {
                if let Some(owner) = task_id {
                    self.with_task(owner, |task| {
                        task.callbacks
                            .fire_success(Output::Inspection(InspectionResult {
                                inspection: report,
                                code: String::new(),
                                cursor_pos: 0,
                                matched_text: String::new(),
                                doc: None,
                            }))
                    });
                }
            }
            Some(MessagePayload::Names(names)) => {
                if let Some(owner) = task_id {
                    self.with_task(owner, |task| {
                        task.callbacks.fire_success(Output::Names(names))
                    });
                }
            }
            Some(MessagePayload::Log(_)) | Some(MessagePayload::Status(_)) | None => {}
        }

        if end {
            if let Some(context) = id {
                self.live.remove(&context);
            }
            if let Some(owner) = task_id {
                self.with_task(owner, |task| task.callbacks.fire_after_run());
            }
            if self.in_flight == task_id {
                self.in_flight = None;
            }
            if let Some(owner) = task_id {
                self.maybe_drop_task(owner);
            }
            self.dispatch_next();
        }
    }

    fn with_task(&mut self, context: IdNum, f: impl FnOnce(&mut Task)) {
        if let Some(task) = self.tasks.get_mut(&context) {
            f(task);
        }
    }

    fn maybe_drop_task(&mut self, context: IdNum) {
        let referenced = self.live.contains(&context)
            || self.in_flight == Some(context)
            || self.last_task == Some(context)
            || self.displays.values().any(|owner| *owner == context);
        if !referenced {
            self.tasks.remove(&context);
        }
    }

    fn handle_kill(
        &mut self,
        signal: Option<Signal>,
        done: Option<ExitCallback>,
        respawn: bool,
    ) {
        // Detach from the current worker; whatever it still sends is
        // discarded, and the in-flight task is dropped without a result.
        self.epoch += 1;
        self.state = WorkerState::Dead;
        if let Some(context) = self.in_flight.take() {
            self.live.remove(&context);
            self.maybe_drop_task(context);
        }
        // Displays and the last-task slot belong to the worker being
        // replaced; only the queue survives.
        let orphaned: Vec<IdNum> = self.displays.values().copied().collect();
        self.displays.clear();
        for owner in orphaned {
            self.maybe_drop_task(owner);
        }
        if let Some(last) = self.last_task.take() {
            self.maybe_drop_task(last);
        }
        let link = self.link.take();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let exit = terminate(link, signal).await;
            let _ = commands.send(Command::Reaped {
                exit,
                done,
                respawn,
            });
        });
    }

    fn shutdown(&mut self) {
        self.epoch += 1;
        self.state = WorkerState::Dead;
        if let Some(link) = self.link.take() {
            drop(link.frames);
            if let Some(mut child) = link.process {
                let _ = child.start_kill();
            }
        }
    }
}

async fn terminate(link: Option<Link>, signal: Option<Signal>) -> ExitOutcome {
    let Some(link) = link else {
        return ExitOutcome::default();
    };
    let Link { frames, process } = link;
    // Closing the frame channel ends the worker's input; an in-memory worker
    // exits on end-of-input.
    drop(frames);
    match process {
        None => ExitOutcome::default(),
        Some(mut child) => {
            let signal = signal.unwrap_or(Signal::SIGTERM);
            if let Some(pid) = child.id() {
                let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal);
            }
            match child.wait().await {
                Ok(status) => ExitOutcome {
                    code: status.code(),
                    signal: status.signal(),
                },
                Err(e) => {
                    debug!("error waiting for the worker to exit: {}", e);
                    ExitOutcome::default()
                }
            }
        }
    }
}
