use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub struct Ids {
    counter: u64,
}
impl Ids {
    pub fn new() -> Self {
        // Context ids are positive; 0 is never issued.
        Ids { counter: 1 }
    }
    pub fn next<T>(&mut self) -> Id<T> {
        let id = self.counter;
        self.counter += 1;
        Id::new(id)
    }
}
impl Default for Ids {
    fn default() -> Self {
        Ids::new()
    }
}

pub type IdNum = u64;

/// A unique identifier for a context or sub-request.
/// The type parameter T is used to check that the id is only used for the
/// kind of thing it was created for. This is a compile-time check only, and
/// only serves to help the programmer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T> {
    id: IdNum,
    // nothing, just to accept the compile-time only T
    #[serde(skip)]
    phantom: std::marker::PhantomData<T>,
}
impl<T> Id<T> {
    pub fn new(id: IdNum) -> Self {
        Id {
            id,
            phantom: std::marker::PhantomData,
        }
    }
    pub fn num(&self) -> IdNum {
        self.id
    }
}
impl<T> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
impl<T: Clone> Copy for Id<T> {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextType;
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRequestType;

pub type ContextId = Id<ContextType>;
pub type InputRequestId = Id<InputRequestType>;

/// Violations of the wire protocol between the controller and the worker.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

/// What the worker is asked to do with a piece of source code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Run,
    Inspect,
    GetAllPropertyNames,
}
impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Run => "run",
            Action::Inspect => "inspect",
            Action::GetAllPropertyNames => "getAllPropertyNames",
        }
    }
    pub fn parse(s: &str) -> Result<Action, ProtocolError> {
        match s {
            "run" => Ok(Action::Run),
            "inspect" => Ok(Action::Inspect),
            "getAllPropertyNames" => Ok(Action::GetAllPropertyNames),
            other => Err(ProtocolError::UnknownAction(other.to_string())),
        }
    }
}

/// A mapping from content-type to payload string, used both for results and
/// for display updates.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MimeBundle(pub BTreeMap<String, String>);

pub mod content_type {
    pub const TEXT_PLAIN: &str = "text/plain";
    pub const TEXT_HTML: &str = "text/html";
    pub const IMAGE_SVG: &str = "image/svg+xml";
    pub const IMAGE_PNG: &str = "image/png";
    pub const IMAGE_JPEG: &str = "image/jpeg";
    pub const APPLICATION_JSON: &str = "application/json";
}

impl MimeBundle {
    pub fn new() -> Self {
        MimeBundle(BTreeMap::new())
    }
    pub fn single(content_type: &str, payload: impl Into<String>) -> Self {
        let mut bundle = MimeBundle::new();
        bundle.0.insert(content_type.to_string(), payload.into());
        bundle
    }
    pub fn text_plain(payload: impl Into<String>) -> Self {
        MimeBundle::single(content_type::TEXT_PLAIN, payload)
    }
    pub fn get(&self, content_type: &str) -> Option<&str> {
        self.0.get(content_type).map(|s| s.as_str())
    }
    pub fn contains(&self, content_type: &str) -> bool {
        self.0.contains_key(content_type)
    }
    pub fn insert(&mut self, content_type: &str, payload: impl Into<String>) {
        self.0.insert(content_type.to_string(), payload.into());
    }
    /// Insert only if the content type is not present yet.
    pub fn fill(&mut self, content_type: &str, payload: impl Into<String>) {
        self.0
            .entry(content_type.to_string())
            .or_insert_with(|| payload.into());
    }
    pub fn merge(&mut self, other: MimeBundle) {
        for (k, v) in other.0 {
            self.0.insert(k, v);
        }
    }
}

/// An evaluation error as reported to the client: error name, message, and
/// a traceback with one entry per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorOutput {
    pub ename: String,
    pub evalue: String,
    pub traceback: Vec<String>,
}
impl ErrorOutput {
    pub fn new(ename: impl Into<String>, evalue: impl Into<String>) -> Self {
        let ename = ename.into();
        let evalue = evalue.into();
        let traceback = vec![format!("{}: {}", ename, evalue)];
        ErrorOutput {
            ename,
            evalue,
            traceback,
        }
    }

    /// Encode an internal error in the same shape as a worker-produced one.
    pub fn from_anyhow(e: &anyhow::Error) -> Self {
        let mut traceback: Vec<String> = vec![format!("Error: {}", e)];
        traceback.extend(e.chain().skip(1).map(|cause| format!("    caused by: {}", cause)));
        ErrorOutput {
            ename: "Error".to_string(),
            evalue: e.to_string(),
            traceback,
        }
    }
}

/// Structured report about a single value, produced by the worker's `inspect`
/// action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inspection {
    pub string: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(rename = "constructorList", skip_serializing_if = "Option::is_none")]
    pub constructor_list: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
}

/// The completion result delivered to `onSuccess` of a `complete` call.
/// `cursor_start`/`cursor_end` delimit the span of `code` the client should
/// replace with a candidate from `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionMatches {
    pub list: Vec<String>,
    pub code: String,
    pub cursor_pos: usize,
    pub matched_text: String,
    pub cursor_start: usize,
    pub cursor_end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputOptions {
    pub prompt: String,
    pub password: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearOptions {
    pub wait: bool,
}

/// Display lifecycle messages. `Open` and `Close` carry the display id;
/// `Update` carries the new bundle and, when issued through a display handle,
/// the display id it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayPayload {
    Open(String),
    Update {
        display_id: Option<String>,
        mime: MimeBundle,
    },
    Close(String),
}

/// Sub-requests the worker can make of the client while a task is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPayload {
    Input {
        options: InputOptions,
        id: InputRequestId,
    },
    Clear(ClearOptions),
}

/// Frames sent from the controller to the worker. On the wire these are
/// positional tuples, not records; see `frame_to_json`.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestFrame {
    Execute {
        action: Action,
        code: String,
        context: ContextId,
    },
    Reply {
        payload: Value,
        context: ContextId,
        request: InputRequestId,
    },
}

/// The payload of a message sent from the worker to the controller, keyed by
/// the single record field that identifies it on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    Log(String),
    Status(String),
    Stdout(String),
    Stderr(String),
    Display(DisplayPayload),
    Request(RequestPayload),
    Error(ErrorOutput),
    Result(MimeBundle),
    Completion(CompletionMatches),
    Inspection(Inspection),
    Names(Vec<String>),
}

/// A message from the worker. `id` is present when the message pertains to a
/// context; `end` marks the terminal message of that context. A bare
/// `{id, end: true}` (payload `None`) finalizes without a result.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerMessage {
    pub id: Option<IdNum>,
    pub end: bool,
    pub payload: Option<MessagePayload>,
}

impl WorkerMessage {
    pub fn log(text: impl Into<String>) -> Self {
        WorkerMessage {
            id: None,
            end: false,
            payload: Some(MessagePayload::Log(text.into())),
        }
    }
    pub fn online() -> Self {
        WorkerMessage {
            id: None,
            end: false,
            payload: Some(MessagePayload::Status("online".to_string())),
        }
    }
    pub fn with_context(id: IdNum, payload: MessagePayload) -> Self {
        WorkerMessage {
            id: Some(id),
            end: false,
            payload: Some(payload),
        }
    }
    pub fn terminal(id: IdNum, payload: MessagePayload) -> Self {
        WorkerMessage {
            id: Some(id),
            end: true,
            payload: Some(payload),
        }
    }
    pub fn bare_end(id: IdNum) -> Self {
        WorkerMessage {
            id: Some(id),
            end: true,
            payload: None,
        }
    }
}

/// Facade for the controller.
pub fn frame_to_json(frame: &RequestFrame) -> Result<String> {
    let value = match frame {
        RequestFrame::Execute {
            action,
            code,
            context,
        } => json!([action.as_str(), code, context.num()]),
        RequestFrame::Reply {
            payload,
            context,
            request,
        } => json!(["reply", payload, context.num(), request.num()]),
    };
    serde_json::to_string(&value).map_err(|e| e.into())
}

/// Facade for the worker.
pub fn frame_from_json(s: &str) -> Result<RequestFrame> {
    let value: Value = serde_json::from_str(s)?;
    let items = value
        .as_array()
        .ok_or_else(|| ProtocolError::MalformedFrame(format!("not a tuple: {}", s)))?;
    let tag = items
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::MalformedFrame(format!("missing action: {}", s)))?;
    if tag == "reply" {
        if items.len() != 4 {
            return Err(ProtocolError::MalformedFrame(format!("bad reply arity: {}", s)).into());
        }
        let context = items[2]
            .as_u64()
            .ok_or_else(|| ProtocolError::MalformedFrame(format!("bad context id: {}", s)))?;
        let request = items[3]
            .as_u64()
            .ok_or_else(|| ProtocolError::MalformedFrame(format!("bad request id: {}", s)))?;
        return Ok(RequestFrame::Reply {
            payload: items[1].clone(),
            context: Id::new(context),
            request: Id::new(request),
        });
    }
    let action = Action::parse(tag)?;
    if items.len() != 3 {
        return Err(ProtocolError::MalformedFrame(format!("bad arity: {}", s)).into());
    }
    let code = items[1]
        .as_str()
        .ok_or_else(|| ProtocolError::MalformedFrame(format!("code is not a string: {}", s)))?;
    let context = items[2]
        .as_u64()
        .ok_or_else(|| ProtocolError::MalformedFrame(format!("bad context id: {}", s)))?;
    Ok(RequestFrame::Execute {
        action,
        code: code.to_string(),
        context: Id::new(context),
    })
}

/// Facade for the worker.
pub fn message_to_json(message: &WorkerMessage) -> Result<String> {
    let mut record = Map::new();
    if let Some(id) = message.id {
        record.insert("id".to_string(), json!(id));
    }
    match &message.payload {
        None => {}
        Some(MessagePayload::Log(text)) => {
            record.insert("log".to_string(), json!(text));
        }
        Some(MessagePayload::Status(status)) => {
            record.insert("status".to_string(), json!(status));
        }
        Some(MessagePayload::Stdout(data)) => {
            record.insert("stdout".to_string(), json!(data));
        }
        Some(MessagePayload::Stderr(data)) => {
            record.insert("stderr".to_string(), json!(data));
        }
        Some(MessagePayload::Display(display)) => {
            let value = match display {
                DisplayPayload::Open(id) => json!({ "open": id }),
                DisplayPayload::Update { display_id, mime } => {
                    let mut inner = Map::new();
                    if let Some(display_id) = display_id {
                        inner.insert("display_id".to_string(), json!(display_id));
                    }
                    inner.insert("mime".to_string(), serde_json::to_value(mime)?);
                    Value::Object(inner)
                }
                DisplayPayload::Close(id) => json!({ "close": id }),
            };
            record.insert("display".to_string(), value);
        }
        Some(MessagePayload::Request(request)) => {
            let value = match request {
                RequestPayload::Input { options, id } => {
                    json!({ "input": options, "id": id.num() })
                }
                RequestPayload::Clear(options) => json!({ "clear": options }),
            };
            record.insert("request".to_string(), value);
        }
        Some(MessagePayload::Error(error)) => {
            record.insert("error".to_string(), serde_json::to_value(error)?);
        }
        Some(MessagePayload::Result(mime)) => {
            record.insert("mime".to_string(), serde_json::to_value(mime)?);
        }
        Some(MessagePayload::Completion(completion)) => {
            record.insert("completion".to_string(), serde_json::to_value(completion)?);
        }
        Some(MessagePayload::Inspection(inspection)) => {
            record.insert("inspection".to_string(), serde_json::to_value(inspection)?);
        }
        Some(MessagePayload::Names(names)) => {
            record.insert("names".to_string(), json!(names));
        }
    }
    if message.end {
        record.insert("end".to_string(), json!(true));
    }
    serde_json::to_string(&Value::Object(record)).map_err(|e| e.into())
}

/// Facade for the controller.
pub fn message_from_json(s: &str) -> Result<WorkerMessage> {
    let value: Value = serde_json::from_str(s)?;
    let mut record = match value {
        Value::Object(record) => record,
        _ => return Err(ProtocolError::MalformedMessage(format!("not a record: {}", s)).into()),
    };
    let id = match record.remove("id") {
        None => None,
        Some(v) => Some(
            v.as_u64()
                .ok_or_else(|| ProtocolError::MalformedMessage(format!("bad id: {}", s)))?,
        ),
    };
    let end = record
        .remove("end")
        .map(|v| v.as_bool().unwrap_or(false))
        .unwrap_or(false);

    let payload = if let Some(text) = record.remove("log") {
        Some(MessagePayload::Log(expect_string(text, s)?))
    } else if let Some(status) = record.remove("status") {
        Some(MessagePayload::Status(expect_string(status, s)?))
    } else if let Some(data) = record.remove("stdout") {
        Some(MessagePayload::Stdout(expect_string(data, s)?))
    } else if let Some(data) = record.remove("stderr") {
        Some(MessagePayload::Stderr(expect_string(data, s)?))
    } else if let Some(display) = record.remove("display") {
        Some(MessagePayload::Display(parse_display(display, s)?))
    } else if let Some(request) = record.remove("request") {
        Some(MessagePayload::Request(parse_request(request, s)?))
    } else if let Some(error) = record.remove("error") {
        Some(MessagePayload::Error(serde_json::from_value(error)?))
    } else if let Some(mime) = record.remove("mime") {
        Some(MessagePayload::Result(serde_json::from_value(mime)?))
    } else if let Some(completion) = record.remove("completion") {
        Some(MessagePayload::Completion(serde_json::from_value(completion)?))
    } else if let Some(inspection) = record.remove("inspection") {
        Some(MessagePayload::Inspection(serde_json::from_value(inspection)?))
    } else if let Some(names) = record.remove("names") {
        Some(MessagePayload::Names(serde_json::from_value(names)?))
    } else if record.is_empty() {
        None
    } else {
        return Err(ProtocolError::MalformedMessage(format!("unrecognized message: {}", s)).into());
    };

    Ok(WorkerMessage { id, end, payload })
}

fn expect_string(value: Value, context: &str) -> Result<String> {
    value
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| ProtocolError::MalformedMessage(format!("expected string: {}", context)).into())
}

fn parse_display(value: Value, context: &str) -> Result<DisplayPayload> {
    let mut record = match value {
        Value::Object(record) => record,
        _ => {
            return Err(
                ProtocolError::MalformedMessage(format!("bad display message: {}", context)).into(),
            )
        }
    };
    if let Some(id) = record.remove("open") {
        return Ok(DisplayPayload::Open(expect_string(id, context)?));
    }
    if let Some(id) = record.remove("close") {
        return Ok(DisplayPayload::Close(expect_string(id, context)?));
    }
    if let Some(mime) = record.remove("mime") {
        let display_id = match record.remove("display_id") {
            None => None,
            Some(v) => Some(expect_string(v, context)?),
        };
        return Ok(DisplayPayload::Update {
            display_id,
            mime: serde_json::from_value(mime)?,
        });
    }
    Err(ProtocolError::MalformedMessage(format!("bad display message: {}", context)).into())
}

fn parse_request(value: Value, context: &str) -> Result<RequestPayload> {
    let mut record = match value {
        Value::Object(record) => record,
        _ => {
            return Err(
                ProtocolError::MalformedMessage(format!("bad request message: {}", context)).into(),
            )
        }
    };
    if let Some(options) = record.remove("input") {
        let id = record
            .remove("id")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                ProtocolError::MalformedMessage(format!("input request without id: {}", context))
            })?;
        return Ok(RequestPayload::Input {
            options: serde_json::from_value(options)?,
            id: Id::new(id),
        });
    }
    if let Some(options) = record.remove("clear") {
        return Ok(RequestPayload::Clear(serde_json::from_value(options)?));
    }
    Err(ProtocolError::MalformedMessage(format!("bad request message: {}", context)).into())
}
