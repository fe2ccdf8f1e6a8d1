//! Output channel for worker events.
//!
//! Everything the worker reports goes through an [`Emitter`]: a cloneable
//! handle feeding one writer task that owns stdout. Snippet output, module
//! cache saves and lifecycle events therefore share a single ordered stream
//! and nothing else can write frames.

use cloister_core::codec::encode;
use cloister_core::protocol::Envelope;
use cloister_core::Event;
use serde_json::Value;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Handle for sending events to the writer task.
#[derive(Debug, Clone)]
pub struct Emitter {
    tx: mpsc::UnboundedSender<Event>,
}

impl Emitter {
    /// Start a writer task on `output`.
    ///
    /// The task stops after writing an `exit` event, or once every handle
    /// is dropped, and hands the writer back.
    pub fn spawn<W>(output: W) -> (Self, JoinHandle<io::Result<W>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_frames(rx, output));
        (Self { tx }, task)
    }

    /// Queue an event. Returns false if the channel has already closed.
    pub fn emit(&self, event: Event) -> bool {
        let kind = event.kind();
        if self.tx.send(event).is_err() {
            warn!(kind, "event dropped, output channel closed");
            return false;
        }
        true
    }

    pub fn trace(&self, message: impl Into<String>) -> bool {
        self.emit(Event::trace(message))
    }
}

async fn write_frames<W>(mut rx: mpsc::UnboundedReceiver<Event>, mut output: W) -> io::Result<W>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = rx.recv().await {
        let last = matches!(event, Event::Exit(_));
        let frame = encode(&Envelope::from(event)).map_err(io::Error::other)?;
        trace!(bytes = frame.len(), "writing frame");
        output.write_all(&frame).await?;
        output.flush().await?;
        if last {
            debug!("exit frame written, closing output");
            rx.close();
            break;
        }
    }
    Ok(output)
}

/// Console-style output injected into the snippet and into modules.
#[derive(Debug, Clone)]
pub struct Console {
    emitter: Emitter,
}

impl Console {
    pub fn new(emitter: Emitter) -> Self {
        Self { emitter }
    }

    /// `console.log` and friends. Several arguments are joined with spaces.
    pub fn log(&self, args: Vec<Value>) {
        self.emitter.emit(Event::Console(join(args)));
    }

    /// `print`.
    pub fn print(&self, value: Value) {
        self.emitter.emit(Event::Print(value));
    }
}

fn join(mut args: Vec<Value>) -> Value {
    match args.len() {
        0 => Value::String(String::new()),
        1 => args.remove(0),
        _ => {
            let parts: Vec<String> = args
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect();
            Value::String(parts.join(" "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloister_core::codec::FrameDecoder;
    use cloister_core::protocol::parse_frame;
    use cloister_core::ExitStatus;
    use serde_json::json;

    fn decode(bytes: &[u8]) -> Vec<Event> {
        FrameDecoder::new()
            .decode(bytes)
            .unwrap()
            .into_iter()
            .map(|v| parse_frame(v).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_frames_written_in_order_until_exit() {
        let (emitter, task) = Emitter::spawn(Vec::new());
        let console = Console::new(emitter.clone());

        emitter.trace("Loading module: echo");
        console.log(vec![json!("a"), json!(1)]);
        console.print(json!({"k": true}));
        emitter.emit(Event::Exit(ExitStatus { code: 0 }));

        let out = task.await.unwrap().unwrap();
        assert_eq!(
            decode(&out),
            vec![
                Event::trace("Loading module: echo"),
                Event::Console(json!("a 1")),
                Event::Print(json!({"k": true})),
                Event::Exit(ExitStatus { code: 0 }),
            ]
        );
        assert!(!emitter.emit(Event::Result(json!(1))));
    }

    #[tokio::test]
    async fn test_writer_stops_when_handles_dropped() {
        let (emitter, task) = Emitter::spawn(Vec::new());
        emitter.emit(Event::Result(json!(42)));
        drop(emitter);
        let out = task.await.unwrap().unwrap();
        assert_eq!(out, br#"{"message":{"result":42}},"#);
    }

    #[test]
    fn test_join_single_value_is_kept() {
        assert_eq!(join(vec![json!({"a": 1})]), json!({"a": 1}));
        assert_eq!(join(vec![]), json!(""));
    }
}
