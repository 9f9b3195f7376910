//! Request/response correlation and event dispatch over one tool channel

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::commands::{lock, DaemonCommand, RequestTracker, ResponseHandle};
use crate::protocol::{self, InboundMessage, ParsedLine};
use devwatch_core::prelude::*;
use devwatch_core::DaemonMessage;

/// Number of stderr lines kept for diagnostics
pub const STDERR_LINES_TO_KEEP: usize = 100;

/// Receives decoded events, synchronously and in stream order
pub type MessageListener = Box<dyn Fn(DaemonMessage) + Send + Sync>;

/// Bounded tail of the tool's stderr.
///
/// Text arriving after an unterminated line is appended to that line.
#[derive(Debug, Default)]
pub(crate) struct StderrBuffer {
    lines: VecDeque<String>,
}

impl StderrBuffer {
    pub(crate) fn append(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut rest = text;
        if let Some(last) = self.lines.back_mut() {
            if !last.ends_with('\n') {
                let end = rest.find('\n').map(|i| i + 1).unwrap_or(rest.len());
                last.push_str(&rest[..end]);
                rest = &rest[end..];
            }
        }
        for line in rest.split_inclusive('\n') {
            if self.lines.len() == STDERR_LINES_TO_KEEP {
                self.lines.pop_front();
            }
            self.lines.push_back(line.to_string());
        }
    }

    pub(crate) fn tail(&self) -> String {
        self.lines.iter().map(String::as_str).collect()
    }
}

/// Protocol engine for one supervised tool instance.
///
/// Owns the pending-request table and the stderr tail. Outbound lines go to an
/// unbounded queue drained by the process's stdin writer, so [`send`] never
/// blocks.
///
/// [`send`]: ProtocolEngine::send
pub struct ProtocolEngine {
    tracker: RequestTracker,
    outbound: mpsc::UnboundedSender<String>,
    listener: MessageListener,
    stderr: Mutex<StderrBuffer>,
    disposed: AtomicBool,
}

impl ProtocolEngine {
    pub fn new(outbound: mpsc::UnboundedSender<String>, listener: MessageListener) -> Self {
        Self {
            tracker: RequestTracker::new(),
            outbound,
            listener,
            stderr: Mutex::new(StderrBuffer::default()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Issue a command and return its unsettled result handle.
    ///
    /// Fails with `EngineDisposed` after [`ProtocolEngine::dispose`].
    pub fn send(&self, method: &str, params: Value) -> Result<ResponseHandle> {
        self.tracker.register(method, |id| {
            let line = protocol::encode_command(id, method, &params)?;
            trace!("-> {}", line);
            self.outbound
                .send(line)
                .map_err(|_| Error::channel_send("tool stdin closed"))
        })
    }

    pub fn send_command(&self, command: DaemonCommand) -> Result<ResponseHandle> {
        debug!("Sending command: {}", command.description());
        self.send(command.method(), command.params())
    }

    /// Handle one line of tool stdout
    pub fn handle_line(&self, line: &str) {
        trace!("<- {}", line);

        match protocol::parse_and_validate(line) {
            ParsedLine::Incidental => {}
            ParsedLine::Malformed(e) => warn!("Dropping daemon line: {} ({})", e, line),
            ParsedLine::Message(InboundMessage::Response {
                id,
                result,
                error,
                trace,
            }) => self.handle_response(id, result, error, trace),
            ParsedLine::Message(InboundMessage::Event { event, params }) => {
                match protocol::decode_event(&event, params) {
                    Some(Ok(message)) => (self.listener)(message),
                    Some(Err(e)) => warn!("{}", e),
                    None => debug!("Ignoring unknown daemon event: {}", event),
                }
            }
        }
    }

    fn handle_response(
        &self,
        id: u64,
        result: Option<Value>,
        error: Option<Value>,
        trace: Option<Value>,
    ) {
        let outcome = match error {
            Some(error) => {
                let method = self.tracker.method_of(id).unwrap_or_default();
                Err(Error::remote(
                    method,
                    protocol::remote_error_text(&error, trace.as_ref()),
                ))
            }
            None => Ok(result.unwrap_or(Value::Null)),
        };

        if !self.tracker.settle(id, outcome) {
            warn!(
                "received a response for a request that wasn't sent: {}",
                id
            );
        }
    }

    /// Add text from the tool's stderr to the diagnostic tail
    pub fn append_stderr(&self, text: &str) {
        lock(&self.stderr).append(text);
    }

    /// The buffered stderr tail, oldest line first
    pub fn stderr_tail(&self) -> String {
        lock(&self.stderr).tail()
    }

    /// Reject further sends and settle outstanding requests with `EngineDisposed`
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let cancelled = self.tracker.cancel_all();
        if cancelled > 0 {
            debug!("Disposed protocol engine with {} pending requests", cancelled);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.tracker.pending_count()
    }
}

impl std::fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("pending", &self.pending_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex as StdMutex};

    fn engine_with_log() -> (
        Arc<ProtocolEngine>,
        mpsc::UnboundedReceiver<String>,
        Arc<StdMutex<Vec<DaemonMessage>>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let engine = ProtocolEngine::new(
            tx,
            Box::new(move |msg| sink.lock().unwrap().push(msg)),
        );
        (Arc::new(engine), rx, seen)
    }

    #[tokio::test]
    async fn test_round_trip_settles_matching_handle() {
        let (engine, mut rx, _) = engine_with_log();

        let mut handles: Vec<_> = (0..8)
            .map(|_| engine.send("device.enable", Value::Null).unwrap())
            .collect();
        let seventh = handles.remove(7);
        assert_eq!(seventh.id(), 7);

        let mut written = Vec::new();
        while let Ok(line) = rx.try_recv() {
            written.push(line);
        }
        assert_eq!(
            written[7],
            r#"[{"id":7,"method":"device.enable","params":null}]"#
        );

        engine.handle_line(r#"[{"id":7,"result":null}]"#);
        assert_eq!(seventh.await.unwrap(), Value::Null);
        assert_eq!(engine.pending_count(), 7);
    }

    #[tokio::test]
    async fn test_concurrent_sends_get_contiguous_ids() {
        let (engine, mut rx, _) = engine_with_log();

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let engine = Arc::clone(&engine);
            tasks.push(tokio::spawn(async move {
                engine.send("device.enable", json!({})).unwrap().id()
            }));
        }
        let mut ids = HashSet::new();
        for task in tasks {
            assert!(ids.insert(task.await.unwrap()));
        }
        assert_eq!(ids, (0..32).collect::<HashSet<u64>>());

        // Wire order matches id order
        let mut last = None;
        while let Ok(line) = rx.try_recv() {
            let value: Value = serde_json::from_str(&line[1..line.len() - 1]).unwrap();
            let id = value["id"].as_u64().unwrap();
            if let Some(prev) = last {
                assert!(id > prev);
            }
            last = Some(id);
        }
    }

    #[tokio::test]
    async fn test_error_response_settles_only_its_request() {
        let (engine, _rx, _) = engine_with_log();
        let first = engine.send("device.enable", json!({})).unwrap();
        let second = engine.send("daemon.version", json!({})).unwrap();

        engine.handle_line(r#"[{"id":0,"error":"not supported","trace":"frame 0"}]"#);
        engine.handle_line(r#"[{"id":1,"result":"0.6.1"}]"#);

        let err = first.await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "error from device.enable: not supported\nframe 0"
        );
        assert_eq!(second.await.unwrap(), json!("0.6.1"));
    }

    #[test]
    fn test_unmatched_and_malformed_lines_are_dropped() {
        let (engine, _rx, seen) = engine_with_log();
        engine.handle_line(r#"[{"id":42,"result":true}]"#);
        engine.handle_line(r#"[{"event":"device.added","params":"#);
        engine.handle_line("Flutter daemon starting...");
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_events_dispatched_in_order() {
        let (engine, _rx, seen) = engine_with_log();
        engine.handle_line(
            r#"[{"event":"device.added","params":{"id":"a","name":"Alpha","platform":"android","emulator":true}}]"#,
        );
        engine.handle_line(r#"[{"event":"app.log","params":{"log":"ignored"}}]"#);
        engine.handle_line(
            r#"[{"event":"device.removed","params":{"id":"a","name":"Alpha","platform":"android"}}]"#,
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].event_name(), "device.added");
        assert_eq!(seen[1].event_name(), "device.removed");
    }

    #[tokio::test]
    async fn test_dispose_settles_pending_and_rejects_sends() {
        let (engine, _rx, _) = engine_with_log();
        let handle = engine.send("device.enable", json!({})).unwrap();

        engine.dispose();
        engine.dispose();

        assert!(matches!(handle.await, Err(Error::EngineDisposed)));
        assert!(matches!(
            engine.send("device.enable", json!({})),
            Err(Error::EngineDisposed)
        ));
    }

    #[tokio::test]
    async fn test_dispose_racing_sends_leaves_nothing_pending() {
        for _ in 0..50 {
            let (engine, _rx, _) = engine_with_log();
            let senders: Vec<_> = (0..4)
                .map(|_| {
                    let engine = Arc::clone(&engine);
                    std::thread::spawn(move || {
                        (0..20)
                            .filter_map(|_| engine.send("device.enable", json!({})).ok())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            engine.dispose();

            let handles: Vec<ResponseHandle> = senders
                .into_iter()
                .flat_map(|sender| sender.join().unwrap())
                .collect();
            assert_eq!(engine.pending_count(), 0);
            for handle in handles {
                assert!(matches!(handle.await, Err(Error::EngineDisposed)));
            }
        }
    }

    #[test]
    fn test_send_fails_when_writer_gone() {
        let (engine, rx, _) = engine_with_log();
        drop(rx);
        assert!(matches!(
            engine.send_command(DaemonCommand::EnableDevices),
            Err(Error::ChannelSend { .. })
        ));
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn test_stderr_buffer_joins_partial_lines() {
        let mut buf = StderrBuffer::default();
        buf.append("Could not ");
        buf.append("find SDK\nsecond");
        buf.append(" line\n");
        assert_eq!(buf.tail(), "Could not find SDK\nsecond line\n");
        assert_eq!(buf.lines.len(), 2);
    }

    #[test]
    fn test_stderr_buffer_keeps_last_lines() {
        let mut buf = StderrBuffer::default();
        for i in 0..(STDERR_LINES_TO_KEEP + 5) {
            buf.append(&format!("line {i}\n"));
        }
        assert_eq!(buf.lines.len(), STDERR_LINES_TO_KEEP);
        assert!(buf.tail().starts_with("line 5\n"));
    }

    #[test]
    fn test_engine_stderr_tail() {
        let (engine, _rx, _) = engine_with_log();
        engine.append_stderr("oops\n");
        assert_eq!(engine.stderr_tail(), "oops\n");
    }
}
