//! End-to-end tests driving a full controller/worker loop over in-memory
//! pipes, with the scripted evaluator from the worker testkit.

use std::time::Duration;

use anyhow::Result;
use evalsession::{
    Callbacks, ClientRequest, Connection, ExitOutcome, Output, Session, SessionOptions,
    Transformed,
};
use evalsession_core::session_api::{ErrorOutput, MimeBundle};
use evalsession_worker::testkit::{spawn, ToyEvaluator};
use serde_json::json;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, PartialEq)]
enum Event {
    BeforeRun,
    AfterRun,
    Success(Output),
    Error(ErrorOutput),
    Stdout(String),
    Stderr(String),
    Display(MimeBundle),
    Request(ClientRequest),
}

fn toy_connector() -> impl FnMut() -> Result<Connection> + Send {
    || {
        let io = spawn(ToyEvaluator::new());
        let (reader, writer) = tokio::io::split(io);
        Ok(Connection {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: None,
        })
    }
}

fn start_session() -> Session {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Session::start(SessionOptions::new(toy_connector()))
}

fn recording_callbacks(tx: UnboundedSender<Event>) -> Callbacks {
    let before = tx.clone();
    let after = tx.clone();
    let success = tx.clone();
    let error = tx.clone();
    let stdout = tx.clone();
    let stderr = tx.clone();
    let display = tx.clone();
    Callbacks {
        before_run: Some(Box::new(move || {
            let _ = before.send(Event::BeforeRun);
        })),
        after_run: Some(Box::new(move || {
            let _ = after.send(Event::AfterRun);
        })),
        on_success: Some(Box::new(move |output| {
            let _ = success.send(Event::Success(output));
        })),
        on_error: Some(Box::new(move |e| {
            let _ = error.send(Event::Error(e));
        })),
        on_stdout: Some(Box::new(move |data| {
            let _ = stdout.send(Event::Stdout(data));
        })),
        on_stderr: Some(Box::new(move |data| {
            let _ = stderr.send(Event::Stderr(data));
        })),
        on_display: Some(Box::new(move |mime| {
            let _ = display.send(Event::Display(mime));
        })),
        on_request: None,
    }
}

/// Receive events until `after_run` fires.
async fn drain_run(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for callbacks")
            .expect("event channel closed");
        let done = event == Event::AfterRun;
        events.push(event);
        if done {
            return events;
        }
    }
}

#[tokio::test]
async fn test_basic_expression() {
    let session = start_session();
    let (tx, mut rx) = unbounded_channel();
    session.execute("['Hello','World!'].join(', ');", recording_callbacks(tx));
    let events = drain_run(&mut rx).await;
    assert_eq!(
        events,
        vec![
            Event::BeforeRun,
            Event::Success(Output::Result(MimeBundle::text_plain("'Hello, World!'"))),
            Event::AfterRun,
        ]
    );
}

#[tokio::test]
async fn test_throw() {
    let session = start_session();
    let (tx, mut rx) = unbounded_channel();
    session.execute("throw new Error('Hello, World!');", recording_callbacks(tx));
    let events = drain_run(&mut rx).await;
    assert_eq!(events.len(), 3);
    assert_eq!(events[0], Event::BeforeRun);
    match &events[1] {
        Event::Error(error) => {
            assert_eq!(error.ename, "Error");
            assert_eq!(error.evalue, "Hello, World!");
            assert!(!error.traceback.is_empty());
        }
        other => panic!("expected an error, got {:?}", other),
    }
    assert_eq!(events[2], Event::AfterRun);
}

#[tokio::test]
async fn test_stdout_capture() {
    let session = start_session();
    let (tx, mut rx) = unbounded_channel();
    session.execute("console.log('Hello, World!');", recording_callbacks(tx));
    let events = drain_run(&mut rx).await;
    assert_eq!(
        events,
        vec![
            Event::BeforeRun,
            Event::Stdout("Hello, World!\n".to_string()),
            Event::Success(Output::Result(MimeBundle::text_plain("undefined"))),
            Event::AfterRun,
        ]
    );
}

#[tokio::test]
async fn test_completion_at_global_scope() {
    let session = start_session();
    let (tx, mut rx) = unbounded_channel();
    session.complete("set", 3, recording_callbacks(tx));
    let events = drain_run(&mut rx).await;
    assert_eq!(events[0], Event::BeforeRun);
    match &events[1] {
        Event::Success(Output::Completion(matches)) => {
            assert_eq!(
                matches.list,
                vec!["setImmediate", "setInterval", "setTimeout"]
            );
            assert_eq!(matches.matched_text, "set");
            assert_eq!(matches.cursor_start, 0);
            assert_eq!(matches.cursor_end, 3);
        }
        other => panic!("expected a completion, got {:?}", other),
    }

    let (tx, mut rx) = unbounded_channel();
    session.complete("set", 2, recording_callbacks(tx));
    let events = drain_run(&mut rx).await;
    match &events[1] {
        Event::Success(Output::Completion(matches)) => {
            assert_eq!(
                matches.list,
                vec!["setImmediate", "setInterval", "setTimeout"]
            );
            assert_eq!(matches.matched_text, "se");
            // The span still advances through the shared "set" prefix.
            assert_eq!(matches.cursor_end, 3);
        }
        other => panic!("expected a completion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_completion_with_nothing_under_the_cursor() {
    let session = start_session();
    let (tx, mut rx) = unbounded_channel();
    // Cursor right after an unparseable accessor: delivered synchronously,
    // without the worker.
    session.complete(".x", 2, recording_callbacks(tx));
    let events = drain_run(&mut rx).await;
    assert_eq!(events.len(), 3);
    match &events[1] {
        Event::Success(Output::Completion(matches)) => {
            assert!(matches.list.is_empty());
            assert_eq!(matches.cursor_start, 2);
            assert_eq!(matches.cursor_end, 2);
        }
        other => panic!("expected an empty completion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_inspection_of_an_identifier() {
    let session = start_session();
    let (tx, mut rx) = unbounded_channel();
    session.execute("var a = [1, 2, 3];", recording_callbacks(tx));
    drain_run(&mut rx).await;

    let (tx, mut rx) = unbounded_channel();
    session.inspect("var a = [1, 2, 3];", 5, recording_callbacks(tx));
    let events = drain_run(&mut rx).await;
    assert_eq!(events[0], Event::BeforeRun);
    match &events[1] {
        Event::Success(Output::Inspection(result)) => {
            assert_eq!(result.inspection.string, "[ 1, 2, 3 ]");
            assert_eq!(result.inspection.type_, "Array");
            assert_eq!(
                result.inspection.constructor_list,
                Some(vec!["Array".to_string(), "Object".to_string()])
            );
            assert_eq!(result.inspection.length, Some(3));
            assert_eq!(result.matched_text, "a");
            assert_eq!(result.cursor_pos, 5);
        }
        other => panic!("expected an inspection, got {:?}", other),
    }
    assert_eq!(events[2], Event::AfterRun);
}

#[tokio::test]
async fn test_inspection_with_documentation() {
    let session = start_session();
    let (tx, mut rx) = unbounded_channel();
    session.inspect("parseInt", 8, recording_callbacks(tx));
    let events = drain_run(&mut rx).await;
    match &events[1] {
        Event::Success(Output::Inspection(result)) => {
            assert_eq!(result.inspection.type_, "Function");
            let doc = result.doc.as_ref().expect("parseInt should be documented");
            assert!(doc.description.starts_with("The parseInt() function"));
            assert!(doc.url.ends_with("parseInt"));
        }
        other => panic!("expected an inspection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_inspection_documentation_via_the_constructor_chain() {
    let session = start_session();
    let (tx, mut rx) = unbounded_channel();
    session.execute("var a = [1, 2, 3];", recording_callbacks(tx));
    drain_run(&mut rx).await;

    let (tx, mut rx) = unbounded_channel();
    session.inspect("a.join", 6, recording_callbacks(tx));
    let events = drain_run(&mut rx).await;
    match &events[1] {
        Event::Success(Output::Inspection(result)) => {
            assert_eq!(result.inspection.type_, "Function");
            assert_eq!(result.matched_text, "a.join");
            let doc = result.doc.as_ref().expect("a.join should be documented");
            assert!(doc.url.ends_with("Array/join"), "got {}", doc.url);
        }
        other => panic!("expected an inspection, got {:?}", other),
    }
    assert_eq!(events.last(), Some(&Event::AfterRun));
}

#[tokio::test]
async fn test_display_update_across_executions() {
    let session = start_session();
    let (tx, mut rx) = unbounded_channel();
    session.execute("var d = $$.display('1'); d.text(1);", recording_callbacks(tx));
    let events = drain_run(&mut rx).await;
    assert!(
        events.contains(&Event::Display(MimeBundle::text_plain("1"))),
        "got {:?}",
        events
    );

    let (tx, mut rx) = unbounded_channel();
    session.execute("d.text(2);", recording_callbacks(tx));
    let events = drain_run(&mut rx).await;
    // The update is issued under the stale context of the first execution;
    // it routes to the second one.
    assert!(
        events.contains(&Event::Display(MimeBundle::text_plain("2"))),
        "got {:?}",
        events
    );
}

#[tokio::test]
async fn test_input_round_trip() {
    let session = start_session();
    let (tx, mut rx) = unbounded_channel();
    let mut callbacks = recording_callbacks(tx.clone());
    callbacks.on_request = Some(Box::new(move |request, replier| {
        let _ = tx.send(Event::Request(request));
        if let Some(replier) = replier {
            replier.send(json!({ "input": "opensesame" }));
        }
    }));
    session.execute(
        "$$.input({prompt:'?', password:true}, function(error, reply) { $$.done(reply.input); });",
        callbacks,
    );
    let events = drain_run(&mut rx).await;
    assert_eq!(events[0], Event::BeforeRun);
    match &events[1] {
        Event::Request(ClientRequest::Input(options)) => {
            assert_eq!(options.prompt, "?");
            assert!(options.password);
        }
        other => panic!("expected an input request, got {:?}", other),
    }
    assert_eq!(
        events[2],
        Event::Success(Output::Result(MimeBundle::text_plain("'opensesame'")))
    );
    assert_eq!(events[3], Event::AfterRun);
}

#[tokio::test]
async fn test_restart() {
    let session = start_session();
    let (tx, mut rx) = unbounded_channel();
    session.execute("['Hello','World!'].join(', ');", recording_callbacks(tx));
    drain_run(&mut rx).await;

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    session.restart(
        None,
        Some(Box::new(move |exit| {
            let _ = done_tx.send(exit);
        })),
    );
    let exit = tokio::time::timeout(Duration::from_secs(5), done_rx)
        .await
        .expect("timed out waiting for restart")
        .expect("restart callback dropped");
    assert_eq!(exit, ExitOutcome::default());

    // The reborn session accepts work again.
    let (tx, mut rx) = unbounded_channel();
    session.execute("['Hello','World!'].join(', ');", recording_callbacks(tx));
    let events = drain_run(&mut rx).await;
    assert_eq!(
        events[1],
        Event::Success(Output::Result(MimeBundle::text_plain("'Hello, World!'")))
    );
}

#[tokio::test]
async fn test_tasks_queued_while_dead_run_after_restart() {
    let session = start_session();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    session.kill(
        None,
        Some(Box::new(move |exit| {
            let _ = done_tx.send(exit);
        })),
    );
    done_rx.await.expect("kill callback dropped");

    let (tx, mut rx) = unbounded_channel();
    session.execute("['Hello','World!'].join(', ');", recording_callbacks(tx));
    session.restart(None, None);
    let events = drain_run(&mut rx).await;
    assert_eq!(
        events[1],
        Event::Success(Output::Result(MimeBundle::text_plain("'Hello, World!'")))
    );
}

#[tokio::test]
async fn test_fifo_ordering_of_queued_tasks() {
    let session = start_session();
    let (tx, mut rx) = unbounded_channel();

    let tag = |label: &'static str, tx: &UnboundedSender<(&'static str, Event)>| {
        let before = tx.clone();
        let after = tx.clone();
        let success = tx.clone();
        Callbacks {
            before_run: Some(Box::new(move || {
                let _ = before.send((label, Event::BeforeRun));
            })),
            after_run: Some(Box::new(move || {
                let _ = after.send((label, Event::AfterRun));
            })),
            on_success: Some(Box::new(move |output| {
                let _ = success.send((label, Event::Success(output)));
            })),
            ..Default::default()
        }
    };

    session.execute("['Hello','World!'].join(', ');", tag("a", &tx));
    session.execute("['Hello','World!'].join(', ');", tag("b", &tx));

    let mut events = Vec::new();
    while events.len() < 6 {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for callbacks")
            .expect("event channel closed");
        events.push(event);
    }
    let order: Vec<(&str, bool)> = events
        .iter()
        .map(|(label, event)| (*label, matches!(event, Event::BeforeRun | Event::AfterRun)))
        .collect();
    assert_eq!(
        order,
        vec![
            ("a", true),
            ("a", false),
            ("a", true),
            ("b", true),
            ("b", false),
            ("b", true),
        ]
    );
}

#[tokio::test]
async fn test_code_transform_rewrites_run_tasks() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let options =
        SessionOptions::new(toy_connector()).with_code_transform(Box::new(|code| {
            if code == "greet" {
                Ok(Transformed::Ready(
                    "['Hello','World!'].join(', ');".to_string(),
                ))
            } else {
                Ok(Transformed::Ready(code.to_string()))
            }
        }));
    let session = Session::start(options);
    let (tx, mut rx) = unbounded_channel();
    session.execute("greet", recording_callbacks(tx));
    let events = drain_run(&mut rx).await;
    assert_eq!(
        events[1],
        Event::Success(Output::Result(MimeBundle::text_plain("'Hello, World!'")))
    );
}

#[tokio::test]
async fn test_deferred_code_transform() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let options =
        SessionOptions::new(toy_connector()).with_code_transform(Box::new(|_code| {
            Ok(Transformed::Deferred(Box::pin(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok("['Hello','World!'].join(', ');".to_string())
            })))
        }));
    let session = Session::start(options);
    let (tx, mut rx) = unbounded_channel();
    session.execute("anything", recording_callbacks(tx));
    let events = drain_run(&mut rx).await;
    assert_eq!(
        events[1],
        Event::Success(Output::Result(MimeBundle::text_plain("'Hello, World!'")))
    );
}

#[tokio::test]
async fn test_failing_code_transform_reports_a_worker_shaped_error() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let options = SessionOptions::new(toy_connector())
        .with_code_transform(Box::new(|_code| anyhow::bail!("transform exploded")));
    let session = Session::start(options);
    let (tx, mut rx) = unbounded_channel();
    session.execute("anything", recording_callbacks(tx));
    let events = drain_run(&mut rx).await;
    assert_eq!(events.len(), 3);
    match &events[1] {
        Event::Error(error) => {
            assert_eq!(error.ename, "Error");
            assert_eq!(error.evalue, "transform exploded");
        }
        other => panic!("expected a transform error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stderr_events_reach_the_callbacks() {
    let session = start_session();
    let (tx, mut rx) = unbounded_channel();
    // The scripted evaluator rejects this; a real uncaught failure inside
    // the worker loop surfaces the same way, as stderr without a result.
    session.execute("var broken = {unsupported};", recording_callbacks(tx));
    let events = drain_run(&mut rx).await;
    match &events[1] {
        Event::Error(error) => assert_eq!(error.ename, "SyntaxError"),
        Event::Stderr(_) => {}
        other => panic!("expected an error or stderr, got {:?}", other),
    }
}
