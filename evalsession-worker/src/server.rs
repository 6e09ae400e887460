use std::sync::Arc;

use anyhow::Result;
use evalsession_core::session_api::{
    frame_from_json, message_to_json, Action, ErrorOutput, MessagePayload, ProtocolError,
    RequestFrame, WorkerMessage,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::unbounded_channel;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::context::{Context, WorkerShared};
use crate::introspect;
use crate::mimer::CustomMimer;
use crate::value::{BoxValue, Evaluated, Evaluator};

/// Run the worker loop with the default MIME encoder.
pub async fn serve<E, R, W>(evaluator: E, input: R, output: W) -> Result<()>
where
    E: Evaluator,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    serve_with_mimer(evaluator, None, input, output).await
}

/// Run the worker loop: announce readiness, then process one request frame
/// at a time until the controller hangs up.
///
/// The output side is drained by a dedicated task so that messages produced
/// by deferred results and stream sinks keep their send order.
pub async fn serve_with_mimer<E, R, W>(
    mut evaluator: E,
    mimer: Option<CustomMimer>,
    input: R,
    output: W,
) -> Result<()>
where
    E: Evaluator,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbox, mut outbox_rx) = unbounded_channel::<WorkerMessage>();
    let writer: JoinHandle<Result<()>> = tokio::spawn(async move {
        let mut output = output;
        while let Some(message) = outbox_rx.recv().await {
            let mut line = message_to_json(&message)?;
            line.push('\n');
            output.write_all(line.as_bytes()).await?;
            output.flush().await?;
        }
        Ok(())
    });

    let shared = WorkerShared::new(outbox, mimer);
    shared.send(WorkerMessage::online());

    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        debug!(target: "evalsession_worker::wire", "received: {}", line);
        match frame_from_json(&line) {
            Ok(frame) => {
                if let Err(e) = handle_frame(&mut evaluator, &shared, frame).await {
                    // Not an evaluation result; surface it on the error stream.
                    shared.send(uncaught(e));
                }
            }
            Err(e) => report_bad_frame(&shared, &line, e),
        }
    }

    // The controller hung up. Drop the evaluator (it may retain display
    // handles) so the writer can drain; contexts still held by spawned user
    // code keep it alive until they finish.
    drop(evaluator);
    drop(shared);
    writer.await??;
    Ok(())
}

fn uncaught(e: anyhow::Error) -> WorkerMessage {
    WorkerMessage {
        id: None,
        end: false,
        payload: Some(MessagePayload::Stderr(format!("{:?}\n", e))),
    }
}

async fn handle_frame<E: Evaluator>(
    evaluator: &mut E,
    shared: &Arc<WorkerShared>,
    frame: RequestFrame,
) -> Result<()> {
    match frame {
        RequestFrame::Execute {
            action,
            code,
            context,
        } => {
            let ctx = Context::new(context.num(), shared.clone());
            match action {
                Action::Run => run_action(evaluator, &ctx, &code),
                Action::Inspect => inspect_action(evaluator, &ctx, &code).await,
                Action::GetAllPropertyNames => names_action(evaluator, &ctx, &code).await,
            }
            Ok(())
        }
        RequestFrame::Reply {
            payload, request, ..
        } => {
            shared.deliver_reply(request.num(), payload)?;
            shared.send(WorkerMessage::log(format!(
                "reply delivered for input request {}",
                request.num()
            )));
            Ok(())
        }
    }
}

fn run_action<E: Evaluator>(evaluator: &mut E, ctx: &Context, code: &str) {
    match evaluator.eval(code, ctx) {
        Err(error) => ctx.send_error(error, false),
        Ok(Evaluated::Deferred(deferred)) => ctx.resolve(deferred),
        Ok(Evaluated::Value(value)) => {
            // An async or already-finalized request emits nothing further
            // here; user code owns the terminal message.
            if !ctx.is_async() && !ctx.is_done() {
                ctx.send_result(value.as_ref(), false);
            }
        }
    }
}

async fn inspect_action<E: Evaluator>(evaluator: &mut E, ctx: &Context, code: &str) {
    match evaluate_now(evaluator, ctx, code).await {
        Err(error) => ctx.send_error(error, false),
        Ok(value) => {
            let report = introspect::inspect(value.as_ref());
            ctx.finish_with(MessagePayload::Inspection(report));
        }
    }
}

async fn names_action<E: Evaluator>(evaluator: &mut E, ctx: &Context, code: &str) {
    let value = if code.is_empty() {
        evaluator.global()
    } else {
        evaluate_now(evaluator, ctx, code).await
    };
    match value {
        Err(error) => ctx.send_error(error, false),
        Ok(value) => {
            let names = introspect::all_property_names(value.as_ref());
            ctx.finish_with(MessagePayload::Names(names));
        }
    }
}

async fn evaluate_now<E: Evaluator>(
    evaluator: &mut E,
    ctx: &Context,
    code: &str,
) -> Result<BoxValue, ErrorOutput> {
    match evaluator.eval(code, ctx)? {
        Evaluated::Value(value) => Ok(value),
        Evaluated::Deferred(deferred) => deferred.await,
    }
}

/// A frame that did not parse. An unknown action with a recoverable context
/// id is reported as a terminal error for that context, like the protocol
/// demands; anything else goes to the error stream.
fn report_bad_frame(shared: &WorkerShared, line: &str, error: anyhow::Error) {
    let context_id = serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.as_array().and_then(|a| a.get(2).and_then(|v| v.as_u64())));
    match (error.downcast_ref::<ProtocolError>(), context_id) {
        (Some(ProtocolError::UnknownAction(action)), Some(id)) => {
            let error = ErrorOutput::new("Error", format!("unhandled action: {}", action));
            shared.send(WorkerMessage::terminal(id, MessagePayload::Error(error)));
        }
        _ => shared.send(uncaught(error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::ToyEvaluator;
    use evalsession_core::session_api::{frame_to_json, message_from_json, Id, MimeBundle};
    use tokio::io::{AsyncBufReadExt, BufReader};

    struct Client {
        writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
        lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>>,
    }

    impl Client {
        fn start() -> Client {
            let (client_io, worker_io) = tokio::io::duplex(64 * 1024);
            let (worker_read, worker_write) = tokio::io::split(worker_io);
            tokio::spawn(async move {
                let _ = serve(ToyEvaluator::new(), worker_read, worker_write).await;
            });
            let (client_read, client_write) = tokio::io::split(client_io);
            Client {
                writer: client_write,
                lines: BufReader::new(client_read).lines(),
            }
        }

        async fn send(&mut self, frame: &RequestFrame) {
            let mut line = frame_to_json(frame).unwrap();
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn recv(&mut self) -> WorkerMessage {
            let line = self.lines.next_line().await.unwrap().unwrap();
            message_from_json(&line).unwrap()
        }
    }

    fn execute(action: Action, code: &str, id: u64) -> RequestFrame {
        RequestFrame::Execute {
            action,
            code: code.to_string(),
            context: Id::new(id),
        }
    }

    #[tokio::test]
    async fn test_announces_online_then_evaluates() {
        let mut client = Client::start();
        assert_eq!(
            client.recv().await.payload,
            Some(MessagePayload::Status("online".to_string()))
        );
        client
            .send(&execute(Action::Run, "['Hello','World!'].join(', ');", 1))
            .await;
        let message = client.recv().await;
        assert_eq!(message.id, Some(1));
        assert!(message.end);
        match message.payload {
            Some(MessagePayload::Result(mime)) => {
                assert_eq!(mime, MimeBundle::text_plain("'Hello, World!'"));
            }
            other => panic!("expected mime result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stdout_precedes_the_result() {
        let mut client = Client::start();
        client.recv().await; // online
        client
            .send(&execute(Action::Run, "console.log('Hello, World!');", 1))
            .await;
        let first = client.recv().await;
        match first.payload {
            Some(MessagePayload::Stdout(chunk)) => assert_eq!(chunk, "Hello, World!\n"),
            other => panic!("expected stdout, got {:?}", other),
        }
        let second = client.recv().await;
        assert!(second.end);
        match second.payload {
            Some(MessagePayload::Result(mime)) => {
                assert_eq!(mime, MimeBundle::text_plain("undefined"));
            }
            other => panic!("expected undefined result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_throw_becomes_a_terminal_error() {
        let mut client = Client::start();
        client.recv().await;
        client
            .send(&execute(Action::Run, "throw new Error('Hello, World!');", 1))
            .await;
        let message = client.recv().await;
        assert!(message.end);
        match message.payload {
            Some(MessagePayload::Error(error)) => {
                assert_eq!(error.ename, "Error");
                assert_eq!(error.evalue, "Hello, World!");
                assert!(!error.traceback.is_empty());
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_all_property_names_of_the_global_scope() {
        let mut client = Client::start();
        client.recv().await;
        client.send(&execute(Action::GetAllPropertyNames, "", 1)).await;
        let message = client.recv().await;
        assert!(message.end);
        match message.payload {
            Some(MessagePayload::Names(names)) => {
                assert!(names.contains(&"setTimeout".to_string()), "got {:?}", names);
                assert!(names.contains(&"parseInt".to_string()), "got {:?}", names);
            }
            other => panic!("expected names, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_action_is_a_protocol_error() {
        let mut client = Client::start();
        client.recv().await;
        client.send_raw(r#"["frobnicate","x",7]"#).await;
        let message = client.recv().await;
        assert_eq!(message.id, Some(7));
        assert!(message.end);
        match message.payload {
            Some(MessagePayload::Error(error)) => {
                assert_eq!(error.ename, "Error");
                assert!(error.evalue.contains("frobnicate"), "got {}", error.evalue);
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reply_for_unknown_request_goes_to_stderr() {
        let mut client = Client::start();
        client.recv().await;
        client.send_raw(r#"["reply",{"input":"x"},1,42]"#).await;
        let message = client.recv().await;
        match message.payload {
            Some(MessagePayload::Stderr(text)) => {
                assert!(text.contains("42"), "got {}", text)
            }
            other => panic!("expected stderr, got {:?}", other),
        }
    }
}
