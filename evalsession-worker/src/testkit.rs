//! Scripted toy runtime for tests.
//!
//! The evaluation primitive is an external collaborator, so the tests in
//! this workspace run against a small scripted evaluator: it understands a
//! handful of literal forms and the exact snippets the end-to-end tests
//! submit, and models just enough of a dynamic object graph (prototype
//! chains, constructors, own properties) to exercise inspection, completion
//! and MIME encoding for real.

use std::collections::{BTreeMap, HashMap};
use std::io::Write as _;
use std::sync::{Arc, OnceLock};

use evalsession_core::session_api::{ErrorOutput, InputOptions};
use tokio::io::DuplexStream;

use crate::context::{Context, Display};
use crate::server::serve;
use crate::value::{BoxValue, Evaluated, Evaluator, Value, ValueKind};

#[derive(Clone)]
pub struct ToyValue(Arc<ToyNode>);

struct ToyNode {
    data: ToyData,
}

enum ToyData {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Function { name: String, arity: usize },
    Array(Vec<ToyValue>),
    Object { props: BTreeMap<String, ToyValue> },
    Prototype { name: &'static str, methods: &'static [&'static str] },
}

impl ToyValue {
    fn new(data: ToyData) -> ToyValue {
        ToyValue(Arc::new(ToyNode { data }))
    }
    pub fn undefined() -> ToyValue {
        ToyValue::new(ToyData::Undefined)
    }
    pub fn null() -> ToyValue {
        ToyValue::new(ToyData::Null)
    }
    pub fn bool(value: bool) -> ToyValue {
        ToyValue::new(ToyData::Bool(value))
    }
    pub fn number(value: f64) -> ToyValue {
        ToyValue::new(ToyData::Number(value))
    }
    pub fn string(value: impl Into<String>) -> ToyValue {
        ToyValue::new(ToyData::Str(value.into()))
    }
    pub fn function(name: impl Into<String>, arity: usize) -> ToyValue {
        ToyValue::new(ToyData::Function {
            name: name.into(),
            arity,
        })
    }
    pub fn array(items: Vec<ToyValue>) -> ToyValue {
        ToyValue::new(ToyData::Array(items))
    }
    pub fn object(props: BTreeMap<String, ToyValue>) -> ToyValue {
        ToyValue::new(ToyData::Object { props })
    }
    pub fn boxed(self) -> BoxValue {
        Box::new(self)
    }
}

struct ProtoSet {
    object: ToyValue,
    array: ToyValue,
    string: ToyValue,
    number: ToyValue,
    boolean: ToyValue,
    function: ToyValue,
}

fn prototypes() -> &'static ProtoSet {
    static PROTOTYPES: OnceLock<ProtoSet> = OnceLock::new();
    PROTOTYPES.get_or_init(|| ProtoSet {
        object: ToyValue::new(ToyData::Prototype {
            name: "Object",
            methods: &[
                "constructor",
                "hasOwnProperty",
                "isPrototypeOf",
                "propertyIsEnumerable",
                "toLocaleString",
                "toString",
                "valueOf",
            ],
        }),
        array: ToyValue::new(ToyData::Prototype {
            name: "Array",
            methods: &[
                "concat", "constructor", "entries", "every", "fill", "filter", "find",
                "forEach", "indexOf", "join", "keys", "length", "map", "pop", "push",
                "reverse", "shift", "slice", "some", "sort", "splice", "toString", "unshift",
            ],
        }),
        string: ToyValue::new(ToyData::Prototype {
            name: "String",
            methods: &[
                "charAt",
                "charCodeAt",
                "concat",
                "constructor",
                "endsWith",
                "includes",
                "indexOf",
                "length",
                "repeat",
                "replace",
                "slice",
                "split",
                "startsWith",
                "substring",
                "toLowerCase",
                "toUpperCase",
                "toString",
                "trim",
            ],
        }),
        number: ToyValue::new(ToyData::Prototype {
            name: "Number",
            methods: &[
                "constructor",
                "toExponential",
                "toFixed",
                "toPrecision",
                "toString",
                "valueOf",
            ],
        }),
        boolean: ToyValue::new(ToyData::Prototype {
            name: "Boolean",
            methods: &["constructor", "toString", "valueOf"],
        }),
        function: ToyValue::new(ToyData::Prototype {
            name: "Function",
            methods: &["apply", "bind", "call", "constructor", "length", "name"],
        }),
    })
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl Value for ToyValue {
    fn kind(&self) -> ValueKind {
        match &self.0.data {
            ToyData::Undefined => ValueKind::Undefined,
            ToyData::Null => ValueKind::Null,
            ToyData::Bool(_) => ValueKind::Boolean,
            ToyData::Number(_) => ValueKind::Number,
            ToyData::Str(_) => ValueKind::String,
            ToyData::Function { .. } => ValueKind::Function,
            ToyData::Array(_) | ToyData::Object { .. } | ToyData::Prototype { .. } => {
                ValueKind::Object
            }
        }
    }

    fn inspect(&self) -> String {
        match &self.0.data {
            ToyData::Undefined => "undefined".to_string(),
            ToyData::Null => "null".to_string(),
            ToyData::Bool(b) => b.to_string(),
            ToyData::Number(n) => format_number(*n),
            ToyData::Str(s) => format!("'{}'", s),
            ToyData::Function { name, .. } => format!("[Function: {}]", name),
            ToyData::Array(items) => {
                if items.is_empty() {
                    "[]".to_string()
                } else {
                    let rendered: Vec<String> = items.iter().map(|v| v.inspect()).collect();
                    format!("[ {} ]", rendered.join(", "))
                }
            }
            ToyData::Object { props } => {
                if props.is_empty() {
                    "{}".to_string()
                } else {
                    let rendered: Vec<String> = props
                        .iter()
                        .map(|(k, v)| format!("{}: {}", k, v.inspect()))
                        .collect();
                    format!("{{ {} }}", rendered.join(", "))
                }
            }
            ToyData::Prototype { name, .. } => format!("{} {{}}", name),
        }
    }

    fn string_value(&self) -> Option<String> {
        match &self.0.data {
            ToyData::Str(s) => Some(s.clone()),
            ToyData::Function { name, .. } => {
                Some(format!("function {}() {{ [native code] }}", name))
            }
            _ => None,
        }
    }

    fn constructor_name(&self) -> Option<String> {
        match &self.0.data {
            ToyData::Prototype { name, .. } => Some(name.to_string()),
            _ => None,
        }
    }

    fn prototype(&self) -> Option<BoxValue> {
        let protos = prototypes();
        let proto = match &self.0.data {
            ToyData::Undefined | ToyData::Null => return None,
            ToyData::Bool(_) => &protos.boolean,
            ToyData::Number(_) => &protos.number,
            ToyData::Str(_) => &protos.string,
            ToyData::Function { .. } => &protos.function,
            ToyData::Array(_) => &protos.array,
            ToyData::Object { .. } => &protos.object,
            ToyData::Prototype { name, .. } => {
                if *name == "Object" {
                    return None;
                }
                &protos.object
            }
        };
        Some(proto.clone().boxed())
    }

    fn own_property_names(&self) -> Vec<String> {
        match &self.0.data {
            ToyData::Array(items) => {
                let mut names: Vec<String> = (0..items.len()).map(|i| i.to_string()).collect();
                names.push("length".to_string());
                names
            }
            ToyData::Object { props } => props.keys().cloned().collect(),
            ToyData::Function { .. } => vec!["length".to_string(), "name".to_string()],
            ToyData::Prototype { methods, .. } => {
                methods.iter().map(|m| m.to_string()).collect()
            }
            _ => Vec::new(),
        }
    }

    fn length(&self) -> Option<usize> {
        match &self.0.data {
            ToyData::Str(s) => Some(s.chars().count()),
            ToyData::Array(items) => Some(items.len()),
            ToyData::Function { arity, .. } => Some(*arity),
            _ => None,
        }
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

/// The scripted evaluator. Bindings introduced with `var` persist across
/// requests, like a real session.
pub struct ToyEvaluator {
    env: BTreeMap<String, ToyValue>,
    displays: HashMap<String, Display>,
}

impl ToyEvaluator {
    pub fn new() -> ToyEvaluator {
        ToyEvaluator {
            env: BTreeMap::new(),
            displays: HashMap::new(),
        }
    }

    fn globals(&self) -> BTreeMap<String, ToyValue> {
        let mut bindings = BTreeMap::new();
        for (name, arity) in [
            ("Array", 1),
            ("Boolean", 1),
            ("Error", 1),
            ("Number", 1),
            ("Object", 1),
            ("String", 1),
            ("parseFloat", 1),
            ("parseInt", 2),
            ("setImmediate", 1),
            ("setInterval", 2),
            ("setTimeout", 2),
        ] {
            bindings.insert(name.to_string(), ToyValue::function(name, arity));
        }
        let mut console = BTreeMap::new();
        for name in ["error", "info", "log", "warn"] {
            console.insert(name.to_string(), ToyValue::function(name, 1));
        }
        bindings.insert("console".to_string(), ToyValue::object(console));
        let mut json = BTreeMap::new();
        json.insert("parse".to_string(), ToyValue::function("parse", 2));
        json.insert("stringify".to_string(), ToyValue::function("stringify", 3));
        bindings.insert("JSON".to_string(), ToyValue::object(json));
        for (name, value) in &self.env {
            bindings.insert(name.clone(), value.clone());
        }
        bindings
    }

    fn parse_literal(&self, source: &str) -> Option<ToyValue> {
        let source = source.trim();
        if source == "undefined" {
            return Some(ToyValue::undefined());
        }
        if source == "null" {
            return Some(ToyValue::null());
        }
        if source == "true" || source == "false" {
            return Some(ToyValue::bool(source == "true"));
        }
        if let Some(inner) = source
            .strip_prefix('\'')
            .and_then(|rest| rest.strip_suffix('\''))
        {
            return Some(ToyValue::string(inner));
        }
        if let Some(inner) = source
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
        {
            let inner = inner.trim();
            if inner.is_empty() {
                return Some(ToyValue::array(Vec::new()));
            }
            let mut items = Vec::new();
            for item in inner.split(',') {
                items.push(self.parse_literal(item)?);
            }
            return Some(ToyValue::array(items));
        }
        source.parse::<f64>().ok().map(ToyValue::number)
    }

    fn lookup(&self, name: &str) -> Option<ToyValue> {
        if let Some(value) = self.env.get(name) {
            return Some(value.clone());
        }
        self.globals().get(name).cloned()
    }

    /// Dotted property access: own properties first, then methods found
    /// along the prototype chain (modeled as fresh function values).
    fn property_of(&self, value: &ToyValue, name: &str) -> Option<ToyValue> {
        if let ToyData::Object { props } = &value.0.data {
            if let Some(found) = props.get(name) {
                return Some(found.clone());
            }
        }
        let mut cursor = value.prototype();
        while let Some(level) = cursor {
            if level.own_property_names().iter().any(|n| n == name) {
                return Some(ToyValue::function(name, 1));
            }
            cursor = level.prototype();
        }
        None
    }
}

impl Default for ToyEvaluator {
    fn default() -> Self {
        ToyEvaluator::new()
    }
}

fn extract_between<'a>(source: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = source.find(start)? + start.len();
    let to = source[from..].find(end)? + from;
    Some(&source[from..to])
}

fn reference_error(name: &str) -> ErrorOutput {
    let mut error = ErrorOutput::new("ReferenceError", format!("{} is not defined", name));
    error
        .traceback
        .push("    at evalmachine.<anonymous>:1:1".to_string());
    error
}

impl Evaluator for ToyEvaluator {
    fn eval(&mut self, code: &str, ctx: &Context) -> Result<Evaluated, ErrorOutput> {
        let code = code.trim();

        if code == "['Hello','World!'].join(', ');" {
            return Ok(Evaluated::Value(ToyValue::string("Hello, World!").boxed()));
        }

        if code.starts_with("throw new Error(") {
            let message = extract_between(code, "Error('", "')").unwrap_or_default();
            let mut error = ErrorOutput::new("Error", message);
            error
                .traceback
                .push("    at evalmachine.<anonymous>:1:7".to_string());
            return Err(error);
        }

        if let Some(message) = extract_between(code, "console.log('", "');") {
            let mut stdout = ctx.stdout();
            let _ = stdout.write_all(format!("{}\n", message).as_bytes());
            return Ok(Evaluated::Value(ToyValue::undefined().boxed()));
        }

        if code.starts_with("var ") && code.contains("$$.display(") {
            // var <name> = $$.display('<id>'); <name>.text(<n>);
            let name = code[4..].split('=').next().unwrap_or_default().trim();
            let display_id = extract_between(code, "$$.display('", "')");
            let display = ctx.display(display_id);
            if let Some(text) = extract_between(code, ".text(", ")") {
                display.text(text.trim());
            }
            self.displays.insert(name.to_string(), display);
            return Ok(Evaluated::Value(ToyValue::undefined().boxed()));
        }

        if let Some(text) = extract_between(code, ".text(", ");") {
            let name = code.split('.').next().unwrap_or_default().trim();
            match self.displays.get(name) {
                Some(display) => {
                    display.text(text.trim());
                    return Ok(Evaluated::Value(ToyValue::undefined().boxed()));
                }
                None => return Err(reference_error(name)),
            }
        }

        if code.contains("$$.input(") {
            let prompt = extract_between(code, "prompt:'", "'")
                .unwrap_or("?")
                .to_string();
            let password =
                code.contains("password:true") || code.contains("password: true");
            let reply = ctx.input(InputOptions { prompt, password });
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Ok(reply) = reply.await {
                    let text = reply
                        .get("input")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    ctx.done(Some(&ToyValue::string(text)));
                }
            });
            return Ok(Evaluated::Value(ToyValue::undefined().boxed()));
        }

        if code == "$$.async();" {
            ctx.set_async(true);
            return Ok(Evaluated::Value(ToyValue::undefined().boxed()));
        }

        if let Some(rest) = code.strip_prefix("var ") {
            let mut parts = rest.splitn(2, '=');
            let name = parts.next().unwrap_or_default().trim();
            let expr = parts
                .next()
                .unwrap_or_default()
                .trim()
                .trim_end_matches(';');
            match self.parse_literal(expr) {
                Some(value) => {
                    self.env.insert(name.to_string(), value);
                    return Ok(Evaluated::Value(ToyValue::undefined().boxed()));
                }
                None => {
                    return Err(ErrorOutput::new(
                        "SyntaxError",
                        format!("unsupported initializer: {}", expr),
                    ))
                }
            }
        }

        let bare = code.trim_end_matches(';');
        if let Some(value) = self.parse_literal(bare) {
            return Ok(Evaluated::Value(value.boxed()));
        }
        if !bare.is_empty()
            && bare
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '.')
        {
            let mut segments = bare.split('.');
            let head = segments.next().unwrap_or_default();
            let mut value = match self.lookup(head) {
                Some(value) => value,
                None => return Err(reference_error(head)),
            };
            for segment in segments {
                value = match self.property_of(&value, segment) {
                    Some(value) => value,
                    None => ToyValue::undefined(),
                };
            }
            return Ok(Evaluated::Value(value.boxed()));
        }

        Err(ErrorOutput::new(
            "SyntaxError",
            format!("the scripted evaluator does not understand: {}", code),
        ))
    }

    fn global(&mut self) -> Result<BoxValue, ErrorOutput> {
        Ok(ToyValue::object(self.globals()).boxed())
    }
}

/// Run a worker with the given evaluator over in-memory pipes, returning the
/// controller-side stream.
pub fn spawn(evaluator: ToyEvaluator) -> DuplexStream {
    let (controller_io, worker_io) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(worker_io);
    tokio::spawn(async move {
        let _ = serve(evaluator, reader, writer).await;
    });
    controller_io
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WorkerShared;
    use evalsession_core::session_api::{IdNum, WorkerMessage};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn scratch_context(id: IdNum) -> (Context, UnboundedReceiver<WorkerMessage>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Context::new(id, WorkerShared::new(tx, None)), rx)
    }

    #[test]
    fn test_var_binding_persists() {
        let (ctx, _rx) = scratch_context(1);
        let mut evaluator = ToyEvaluator::new();
        match evaluator.eval("var a = [1, 2, 3];", &ctx).unwrap() {
            Evaluated::Value(value) => assert_eq!(value.kind(), ValueKind::Undefined),
            Evaluated::Deferred(_) => panic!("expected an immediate value"),
        }
        match evaluator.eval("a", &ctx).unwrap() {
            Evaluated::Value(value) => {
                assert_eq!(value.inspect(), "[ 1, 2, 3 ]");
                assert_eq!(value.length(), Some(3));
            }
            Evaluated::Deferred(_) => panic!("expected an immediate value"),
        }
    }

    #[test]
    fn test_unknown_identifier_is_a_reference_error() {
        let (ctx, _rx) = scratch_context(1);
        let mut evaluator = ToyEvaluator::new();
        let error = match evaluator.eval("nope", &ctx) {
            Err(error) => error,
            Ok(_) => panic!("expected a reference error"),
        };
        assert_eq!(error.ename, "ReferenceError");
        assert_eq!(error.evalue, "nope is not defined");
    }

    #[test]
    fn test_globals_expose_the_timer_family() {
        let mut evaluator = ToyEvaluator::new();
        let global = evaluator.global().unwrap();
        let names = global.own_property_names();
        let timers: Vec<&str> = names
            .iter()
            .filter(|n| n.starts_with("set"))
            .map(|n| n.as_str())
            .collect();
        assert_eq!(timers, vec!["setImmediate", "setInterval", "setTimeout"]);
    }

    #[test]
    fn test_property_access_walks_the_prototype() {
        let (ctx, _rx) = scratch_context(1);
        let mut evaluator = ToyEvaluator::new();
        evaluator.eval("var a = [1, 2, 3];", &ctx).unwrap();
        match evaluator.eval("a.join", &ctx).unwrap() {
            Evaluated::Value(value) => assert_eq!(value.kind(), ValueKind::Function),
            Evaluated::Deferred(_) => panic!("expected an immediate value"),
        }
    }
}
