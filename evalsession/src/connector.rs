//! Worker transports.
//!
//! The default connector spawns the configured worker executable with piped
//! stdio; tests connect over in-memory pipes instead. Either way the
//! controller sees a pair of byte streams carrying line-delimited JSON.

use anyhow::{Context as _, Result};
use evalsession_core::session_api::{frame_to_json, message_from_json, RequestFrame, WorkerMessage};
use tokio::io::{AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// A connected worker: its byte streams, and the child process handle when
/// the worker runs out of process.
pub struct Connection {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub process: Option<Child>,
}

/// Produces worker connections; called again on every restart.
pub trait Connector: Send {
    fn connect(&mut self) -> Result<Connection>;
}

impl<F> Connector for F
where
    F: FnMut() -> Result<Connection> + Send,
{
    fn connect(&mut self) -> Result<Connection> {
        self()
    }
}

/// Spawns the worker executable. The program can be overridden with the
/// `EVALSESSION_WORKER` environment variable.
pub struct CommandConnector {
    program: String,
    args: Vec<String>,
}

impl CommandConnector {
    pub fn new(program: impl Into<String>) -> Self {
        CommandConnector {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl Connector for CommandConnector {
    fn connect(&mut self) -> Result<Connection> {
        let program =
            std::env::var("EVALSESSION_WORKER").unwrap_or_else(|_| self.program.clone());
        let mut child = tokio::process::Command::new(program)
            .args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .spawn()
            .context("while starting the evalsession worker process")?;
        let writer = child.stdin.take().unwrap();
        let reader = child.stdout.take().unwrap();
        Ok(Connection {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: Some(child),
        })
    }
}

/// Events the reader side feeds into the controller loop, tagged with the
/// connection epoch so that a late message from a replaced worker is
/// recognizable.
#[derive(Debug)]
pub(crate) enum LinkEvent {
    Message(WorkerMessage),
    Closed,
}

pub(crate) async fn forward_frames(
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut frames: UnboundedReceiver<RequestFrame>,
) {
    while let Some(frame) = frames.recv().await {
        match write_frame(&mut writer, &frame).await {
            Ok(()) => {}
            Err(e) => {
                debug!("error writing to the worker: {}", e);
                break;
            }
        }
    }
}

async fn write_frame(
    writer: &mut Box<dyn AsyncWrite + Send + Unpin>,
    frame: &RequestFrame,
) -> Result<()> {
    let json = frame_to_json(frame)?;
    debug!(target: "evalsession::wire", "sending: {}", json);
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn forward_messages(
    reader: Box<dyn AsyncRead + Send + Unpin>,
    epoch: u64,
    events: UnboundedSender<(u64, LinkEvent)>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(target: "evalsession::wire", "received: {}", line);
                match message_from_json(&line) {
                    Ok(message) => {
                        if events.send((epoch, LinkEvent::Message(message))).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!("error parsing worker message: {} ({})", e, line);
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("error reading from the worker: {}", e);
                break;
            }
        }
    }
    let _ = events.send((epoch, LinkEvent::Closed));
}
