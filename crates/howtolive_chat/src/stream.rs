//! Streaming bridge.
//!
//! Runs a handler in a background task and turns every message it emits into
//! an ordered sequence of text deltas:
//!
//! 1. A hook with a unique name is registered on the handler; it forwards each
//!    emitted message with non-blank text into a bounded channel.
//! 2. The background task awaits `reply` and then sends a sentinel carrying
//!    the result. Panics are caught and reported as failures.
//! 3. The consumer pulls with an idle timeout and computes deltas with
//!    [`DeltaAccumulator`].
//!
//! The stream yields exactly one delta with `is_final = true`. When it ends or
//! is dropped the hook is removed and the background task is aborted.

use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, Stream};
use howtolive_core::{message_hook, CoreError, CoreResult, Handler, Message};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::StreamingConfig;

/// Default bound of the hand-off channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Default maximum wait for the next emitted message.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Final text when a turn timed out before producing anything.
pub const TIMEOUT_MARKER: &str = "[Response timed out]";

/// Final text when a handler failed before producing anything.
pub fn error_marker(reason: &str) -> String {
    format!("[Error] {}", reason)
}

/// Bridge settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    pub idle_timeout: Duration,
    pub channel_capacity: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl From<&StreamingConfig> for StreamOptions {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            channel_capacity: config.channel_capacity.max(1),
        }
    }
}

/// One step of a streamed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamDelta {
    pub is_final: bool,
    /// New text since the previous delta
    pub delta: String,
    /// All text so far
    pub accumulated: String,
}

impl StreamDelta {
    fn partial(delta: String, accumulated: &str) -> Self {
        Self {
            is_final: false,
            delta,
            accumulated: accumulated.to_string(),
        }
    }

    fn last(delta: impl Into<String>, accumulated: impl Into<String>) -> Self {
        Self {
            is_final: true,
            delta: delta.into(),
            accumulated: accumulated.into(),
        }
    }
}

/// How a streamed reply ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    /// The handler returned this reply
    Completed(Message),
    /// The handler failed or panicked
    Failed(String),
    /// No message arrived within the idle timeout
    TimedOut,
}

impl StreamOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Tracks the full text seen so far and derives deltas from new full texts.
#[derive(Debug, Clone, Default)]
pub struct DeltaAccumulator {
    text: String,
}

impl DeltaAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the full text of an emitted message.
    ///
    /// If it extends the accumulated text the suffix is returned. Otherwise
    /// the text is appended after a newline and returned with that separator.
    /// Returns `None` when nothing new arrived.
    pub fn push(&mut self, full: &str) -> Option<String> {
        if full.trim().is_empty() {
            return None;
        }
        if let Some(suffix) = full.strip_prefix(self.text.as_str()) {
            if suffix.is_empty() {
                return None;
            }
            let delta = suffix.to_string();
            self.text = full.to_string();
            return Some(delta);
        }
        let delta = format!("\n{}", full);
        self.text.push_str(&delta);
        Some(delta)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

enum Envelope {
    Emitted(Message),
    Finished(CoreResult<Message>),
}

/// Lazy, finite, non-restartable sequence of deltas for one handler call.
pub struct DeltaStream {
    rx: mpsc::Receiver<Envelope>,
    handler: Arc<dyn Handler>,
    hook_name: String,
    task: Option<JoinHandle<()>>,
    idle_timeout: Duration,
    accumulator: DeltaAccumulator,
    seen: HashSet<String>,
    pending: VecDeque<StreamDelta>,
    outcome: Option<StreamOutcome>,
}

/// Start `handler` on `message` and stream its output.
///
/// Must be called from within a tokio runtime.
pub fn stream_reply(handler: Arc<dyn Handler>, message: Message, options: StreamOptions) -> DeltaStream {
    let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));
    let hook_name = format!("stream-{}", uuid::Uuid::new_v4().simple());

    let hook_tx = tx.clone();
    handler.register_hook(
        &hook_name,
        message_hook(move |emitted: Message| {
            let tx = hook_tx.clone();
            async move {
                if !emitted.text().trim().is_empty() {
                    let _ = tx.send(Envelope::Emitted(emitted)).await;
                }
            }
        }),
    );

    let runner = handler.clone();
    let task = tokio::spawn(async move {
        let result = AssertUnwindSafe(runner.reply(&message)).catch_unwind().await;
        let result = result.unwrap_or_else(|panic| {
            Err(CoreError::handler_failed(runner.name(), panic_message(panic.as_ref())))
        });
        let _ = tx.send(Envelope::Finished(result)).await;
    });

    debug!(handler = handler.name(), hook = %hook_name, "Streaming started");

    DeltaStream {
        rx,
        handler,
        hook_name,
        task: Some(task),
        idle_timeout: options.idle_timeout,
        accumulator: DeltaAccumulator::new(),
        seen: HashSet::new(),
        pending: VecDeque::new(),
        outcome: None,
    }
}

impl DeltaStream {
    /// Name of the handler being streamed.
    pub fn handler_name(&self) -> &str {
        self.handler.name()
    }

    /// Text accumulated so far.
    pub fn accumulated(&self) -> &str {
        self.accumulator.text()
    }

    /// How the stream ended; `None` until the final delta was produced.
    pub fn outcome(&self) -> Option<&StreamOutcome> {
        self.outcome.as_ref()
    }

    pub fn take_outcome(&mut self) -> Option<StreamOutcome> {
        self.outcome.take()
    }

    /// Whether the final delta has been produced.
    pub fn is_finished(&self) -> bool {
        self.task.is_none()
    }

    /// Next delta, or `None` once the final delta was returned.
    pub async fn next(&mut self) -> Option<StreamDelta> {
        if let Some(delta) = self.pending.pop_front() {
            return Some(delta);
        }
        if self.is_finished() {
            return None;
        }

        loop {
            let envelope = match tokio::time::timeout(self.idle_timeout, self.rx.recv()).await {
                Ok(envelope) => envelope,
                Err(_) => {
                    warn!(
                        handler = self.handler.name(),
                        timeout_secs = self.idle_timeout.as_secs_f64(),
                        "Handler idle timeout"
                    );
                    return Some(self.finish(StreamOutcome::TimedOut, TIMEOUT_MARKER.to_string()));
                }
            };

            match envelope {
                Some(Envelope::Emitted(message)) => {
                    self.seen.insert(message.id.clone());
                    if let Some(delta) = self.accumulator.push(&message.text()) {
                        return Some(StreamDelta::partial(delta, self.accumulator.text()));
                    }
                }
                Some(Envelope::Finished(Ok(reply))) => {
                    let text = reply.text();
                    let already_streamed =
                        self.seen.contains(&reply.id) || self.accumulator.text().ends_with(&text);
                    if !already_streamed {
                        if let Some(delta) = self.accumulator.push(&text) {
                            self.pending
                                .push_back(StreamDelta::partial(delta, self.accumulator.text()));
                        }
                    }
                    debug!(handler = self.handler.name(), "Handler completed");
                    let last = self.finish(StreamOutcome::Completed(reply), String::new());
                    self.pending.push_back(last);
                    return self.pending.pop_front();
                }
                Some(Envelope::Finished(Err(e))) => {
                    error!(handler = self.handler.name(), error = %e, "Handler failed");
                    let marker = error_marker(&e.to_string());
                    return Some(self.finish(StreamOutcome::Failed(e.to_string()), marker));
                }
                None => {
                    let reason = "handler task ended without a result".to_string();
                    error!(handler = self.handler.name(), "{}", reason);
                    let marker = error_marker(&reason);
                    return Some(self.finish(StreamOutcome::Failed(reason), marker));
                }
            }
        }
    }

    /// Record the outcome, release the handler and build the final delta.
    ///
    /// `marker` is used only when nothing was accumulated.
    fn finish(&mut self, outcome: StreamOutcome, marker: String) -> StreamDelta {
        self.release();
        self.outcome = Some(outcome);
        if self.accumulator.is_empty() && !marker.is_empty() {
            StreamDelta::last(marker.clone(), marker)
        } else {
            StreamDelta::last(String::new(), self.accumulator.text())
        }
    }

    fn release(&mut self) {
        self.handler.unregister_hook(&self.hook_name);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Drain the stream, returning the final accumulated text and outcome.
    pub async fn collect(mut self) -> (String, StreamOutcome) {
        let mut accumulated = String::new();
        while let Some(delta) = self.next().await {
            if delta.is_final {
                accumulated = delta.accumulated;
            }
        }
        let outcome = self.take_outcome().unwrap_or(StreamOutcome::TimedOut);
        (accumulated, outcome)
    }

    /// Adapt into a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = StreamDelta> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|delta| (delta, stream))
        })
    }
}

impl Drop for DeltaStream {
    fn drop(&mut self) {
        self.release();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use howtolive_core::mock::{ScriptedEnd, ScriptedHandler};
    use howtolive_core::Stateful;

    fn fast() -> StreamOptions {
        StreamOptions {
            idle_timeout: Duration::from_millis(200),
            channel_capacity: 4,
        }
    }

    async fn drain(stream: &mut DeltaStream) -> Vec<StreamDelta> {
        let mut deltas = Vec::new();
        while let Some(delta) = stream.next().await {
            deltas.push(delta);
        }
        deltas
    }

    #[test]
    fn test_accumulator_prefix_growth() {
        let mut acc = DeltaAccumulator::new();
        assert_eq!(acc.push("Hi").as_deref(), Some("Hi"));
        assert_eq!(acc.push("Hi there").as_deref(), Some(" there"));
        assert_eq!(acc.push("Hi there"), None);
        assert_eq!(acc.text(), "Hi there");
    }

    #[test]
    fn test_accumulator_disjoint_messages() {
        let mut acc = DeltaAccumulator::new();
        assert_eq!(acc.push("A").as_deref(), Some("A"));
        assert_eq!(acc.push("B").as_deref(), Some("\nB"));
        assert_eq!(acc.text(), "A\nB");
        assert_eq!(acc.push("A\nB and more").as_deref(), Some(" and more"));
        assert_eq!(acc.push("   "), None);
    }

    #[tokio::test]
    async fn test_prefix_growing_handler() {
        let handler = Arc::new(ScriptedHandler::new("howtocook").emit("Hi").emit("Hi there"));
        let mut stream = stream_reply(handler.clone(), Message::user("hello"), fast());

        let deltas = drain(&mut stream).await;
        let texts: Vec<&str> = deltas.iter().map(|d| d.delta.as_str()).collect();
        assert_eq!(texts, vec!["Hi", " there", ""]);
        assert_eq!(deltas.iter().filter(|d| d.is_final).count(), 1);
        assert!(deltas.last().unwrap().is_final);
        assert_eq!(deltas.last().unwrap().accumulated, "Hi there");
        assert!(stream.outcome().unwrap().is_completed());
        assert!(handler.hooks().is_empty());
    }

    #[tokio::test]
    async fn test_disjoint_handler() {
        let handler = Arc::new(ScriptedHandler::new("howtoeat").emit("A").emit("B"));
        let mut stream = stream_reply(handler, Message::user("x"), fast());

        let deltas = drain(&mut stream).await;
        assert_eq!(deltas[0].delta, "A");
        assert_eq!(deltas[1].delta, "\nB");
        assert_eq!(deltas[1].accumulated, "A\nB");
        assert_eq!(deltas[2].accumulated, "A\nB");
        assert!(deltas[2].is_final);
    }

    #[tokio::test]
    async fn test_unemitted_reply_is_streamed_before_final() {
        let handler = Arc::new(
            ScriptedHandler::new("howtosleep")
                .emit("Looking that up")
                .ending(ScriptedEnd::Reply("Sleep 8 hours.".into())),
        );
        let (text, outcome) = stream_reply(handler, Message::user("x"), fast()).collect().await;
        assert_eq!(text, "Looking that up\nSleep 8 hours.");
        assert!(matches!(outcome, StreamOutcome::Completed(m) if m.text() == "Sleep 8 hours."));
    }

    #[tokio::test]
    async fn test_idle_timeout_ends_and_aborts() {
        let handler = Arc::new(ScriptedHandler::new("howtocook").ending(ScriptedEnd::Hang));
        let probe = handler.probe();
        let started = tokio::time::Instant::now();

        let mut stream = stream_reply(
            handler.clone(),
            Message::user("x"),
            StreamOptions {
                idle_timeout: Duration::from_millis(100),
                channel_capacity: 4,
            },
        );
        let deltas = drain(&mut stream).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(deltas.len(), 1);
        assert!(deltas[0].is_final);
        assert_eq!(deltas[0].accumulated, TIMEOUT_MARKER);
        assert_eq!(stream.outcome(), Some(&StreamOutcome::TimedOut));
        assert!(handler.hooks().is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probe.call_count(), 1);
        assert_eq!(probe.active(), 0);
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_text() {
        let handler = Arc::new(
            ScriptedHandler::new("howtocook")
                .emit("Partial answer")
                .ending(ScriptedEnd::Hang),
        );
        let (text, outcome) = stream_reply(handler, Message::user("x"), fast()).collect().await;
        assert_eq!(text, "Partial answer");
        assert_eq!(outcome, StreamOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_failure_and_panic_become_failed_outcome() {
        let failing = Arc::new(ScriptedHandler::new("a").ending(ScriptedEnd::Fail("model down".into())));
        let (text, outcome) = stream_reply(failing, Message::user("x"), fast()).collect().await;
        assert!(text.starts_with("[Error]"));
        assert!(matches!(outcome, StreamOutcome::Failed(reason) if reason.contains("model down")));

        let panicking = Arc::new(ScriptedHandler::new("b").emit("so far").ending(ScriptedEnd::Panic("bug".into())));
        let (text, outcome) = stream_reply(panicking, Message::user("x"), fast()).collect().await;
        assert_eq!(text, "so far");
        assert!(matches!(outcome, StreamOutcome::Failed(reason) if reason.contains("bug")));
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_handler() {
        let handler = Arc::new(
            ScriptedHandler::new("howtoexercise")
                .emit("one")
                .ending(ScriptedEnd::Hang),
        );
        let probe = handler.probe();

        let mut stream = stream_reply(handler.clone(), Message::user("x"), fast());
        let first = stream.next().await.unwrap();
        assert_eq!(first.delta, "one");
        assert_eq!(handler.hooks().names().len(), 1);
        drop(stream);

        assert!(handler.hooks().is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(probe.active(), 0);
        assert_eq!(handler.memory().len(), 1);
    }

    #[tokio::test]
    async fn test_into_stream_adapter() {
        let handler = Arc::new(ScriptedHandler::new("howtocook").emit("Hi").emit("Hi there"));
        let deltas: Vec<StreamDelta> = stream_reply(handler, Message::user("x"), fast())
            .into_stream()
            .collect()
            .await;
        assert_eq!(deltas.len(), 3);
        assert!(deltas[2].is_final);
    }

    #[tokio::test]
    async fn test_blank_emissions_are_ignored() {
        let handler = Arc::new(ScriptedHandler::new("howtocook").emit("  ").emit("Done"));
        let deltas = drain(&mut stream_reply(handler, Message::user("x"), fast())).await;
        assert_eq!(deltas[0].delta, "Done");
        assert_eq!(deltas.len(), 2);
    }
}
