//! Server-Sent Events streams.
//!
//! Every open stream is one spawned task. The task walks an [`EventPlan`],
//! waits `fixedDelayMs` between data events, injects keepalive frames from an
//! independent ticker, and stops as soon as its [`CancellationToken`] fires.
//! The transport drains frames through [`SseStream::next_frame`].

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write as _;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Streaming configuration of an HTTP mock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SseConfigDocument", into = "SseConfigDocument")]
pub struct SseConfig {
    pub source: EventSource,
    pub timing: SseTiming,
    pub lifecycle: SseLifecycle,
}

/// Where the data events come from. Exactly one applies.
#[derive(Debug, Clone, PartialEq)]
pub enum EventSource {
    /// Emitted once, in order
    Events(Vec<SseEvent>),
    Generator(EventGenerator),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum EventGenerator {
    /// Replays `events` `repeat` times; 0 repeats forever
    Template {
        events: Vec<SseEvent>,
        #[serde(default)]
        repeat: u64,
    },
    /// Counts from `start` to `end` (inclusive), substituting `{{value}}` in `format`
    Sequence {
        #[serde(default)]
        start: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end: Option<i64>,
        #[serde(default = "default_sequence_format")]
        format: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
    },
}

fn default_sequence_format() -> String {
    "{{value}}".to_string()
}

/// One configured event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SseEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    /// String data is sent verbatim, anything else as compact JSON
    #[serde(default)]
    pub data: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,
}

impl SseEvent {
    pub fn data(data: impl Into<Value>) -> Self {
        Self {
            event: None,
            data: data.into(),
            id: None,
            retry: None,
        }
    }

    pub fn named(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// The wire frame, or `None` for an event without data.
    pub fn to_frame(&self) -> Option<SseFrame> {
        let data = match &self.data {
            Value::Null => return None,
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        Some(SseFrame::Event {
            event: self.event.clone(),
            data,
            id: self.id.clone(),
            retry: self.retry,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SseTiming {
    /// Gap between consecutive data events
    #[serde(default)]
    pub fixed_delay_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SseLifecycle {
    #[serde(default)]
    pub termination: Termination,

    /// 0 disables keepalives
    #[serde(default)]
    pub keepalive_interval_ms: u64,

    /// Stop after this many data events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_events: Option<u64>,
}

impl SseLifecycle {
    fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_ms > 0).then(|| Duration::from_millis(self.keepalive_interval_ms))
    }
}

/// What happens once the data events run out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Termination {
    #[default]
    Complete,
    /// Hold the connection with keepalives until cancelled
    KeepOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct SseConfigDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    events: Option<Vec<SseEvent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    generator: Option<EventGenerator>,
    #[serde(default)]
    timing: SseTiming,
    #[serde(default)]
    lifecycle: SseLifecycle,
}

impl TryFrom<SseConfigDocument> for SseConfig {
    type Error = ValidationError;

    fn try_from(doc: SseConfigDocument) -> Result<Self, Self::Error> {
        let source = match (doc.events, doc.generator) {
            (Some(_), Some(_)) => {
                return Err(ValidationError::MutuallyExclusive {
                    context: "sse",
                    first: "events",
                    second: "generator",
                })
            }
            (Some(events), None) => EventSource::Events(events),
            (None, Some(generator)) => EventSource::Generator(generator),
            (None, None) => {
                return Err(ValidationError::MissingOneOf {
                    context: "sse",
                    options: "events, generator",
                })
            }
        };
        let config = SseConfig {
            source,
            timing: doc.timing,
            lifecycle: doc.lifecycle,
        };
        config.validate()?;
        Ok(config)
    }
}

impl From<SseConfig> for SseConfigDocument {
    fn from(config: SseConfig) -> Self {
        let (events, generator) = match config.source {
            EventSource::Events(events) => (Some(events), None),
            EventSource::Generator(generator) => (None, Some(generator)),
        };
        SseConfigDocument {
            events,
            generator,
            timing: config.timing,
            lifecycle: config.lifecycle,
        }
    }
}

impl SseConfig {
    pub fn events(events: Vec<SseEvent>) -> Self {
        Self {
            source: EventSource::Events(events),
            timing: SseTiming::default(),
            lifecycle: SseLifecycle::default(),
        }
    }

    pub fn template(events: Vec<SseEvent>, repeat: u64) -> Self {
        Self {
            source: EventSource::Generator(EventGenerator::Template { events, repeat }),
            timing: SseTiming::default(),
            lifecycle: SseLifecycle::default(),
        }
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.timing.fixed_delay_ms = delay_ms;
        self
    }

    pub fn with_keepalive_ms(mut self, interval_ms: u64) -> Self {
        self.lifecycle.keepalive_interval_ms = interval_ms;
        self
    }

    pub fn with_termination(mut self, termination: Termination) -> Self {
        self.lifecycle.termination = termination;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match &self.source {
            EventSource::Events(_) => {}
            EventSource::Generator(EventGenerator::Template { events, repeat }) => {
                if events.is_empty() {
                    return Err(ValidationError::Missing("sse.generator.events"));
                }
                // An endless template with nothing to send would never yield.
                if *repeat == 0 && events.iter().all(|e| e.data.is_null()) {
                    return Err(ValidationError::Invalid(
                        "sse.generator: an endless template needs at least one event with data"
                            .into(),
                    ));
                }
            }
            EventSource::Generator(EventGenerator::Sequence { start, end, .. }) => {
                if matches!(end, Some(end) if end < start) {
                    return Err(ValidationError::Invalid(format!(
                        "sse.generator: sequence end {} is before start {start}",
                        end.unwrap_or_default()
                    )));
                }
            }
        }
        if self.lifecycle.max_events == Some(0) {
            return Err(ValidationError::Invalid(
                "sse.lifecycle.maxEvents must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Whether the stream can end on its own.
    pub fn is_bounded(&self) -> bool {
        if self.lifecycle.termination == Termination::KeepOpen {
            return false;
        }
        if self.lifecycle.max_events.is_some() {
            return true;
        }
        match &self.source {
            EventSource::Events(_) => true,
            EventSource::Generator(EventGenerator::Template { repeat, .. }) => *repeat > 0,
            EventSource::Generator(EventGenerator::Sequence { end, .. }) => end.is_some(),
        }
    }
}

/// A frame on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    Event {
        event: Option<String>,
        data: String,
        id: Option<String>,
        retry: Option<u64>,
    },
    Keepalive,
}

impl SseFrame {
    pub fn is_keepalive(&self) -> bool {
        matches!(self, SseFrame::Keepalive)
    }

    /// Data of an event frame.
    pub fn data(&self) -> Option<&str> {
        match self {
            SseFrame::Event { data, .. } => Some(data),
            SseFrame::Keepalive => None,
        }
    }

    /// `text/event-stream` encoding, including the blank line terminator.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        match self {
            SseFrame::Keepalive => out.push_str(": keepalive\n\n"),
            SseFrame::Event {
                event,
                data,
                id,
                retry,
            } => {
                if let Some(event) = event {
                    let _ = writeln!(out, "event: {event}");
                }
                if let Some(id) = id {
                    let _ = writeln!(out, "id: {id}");
                }
                if let Some(retry) = retry {
                    let _ = writeln!(out, "retry: {retry}");
                }
                for line in data.split('\n') {
                    let _ = writeln!(out, "data: {line}");
                }
                out.push('\n');
            }
        }
        out
    }
}

/// Lifecycle of one open stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Emitting,
    Terminating,
    Closed,
}

/// The data events of a stream, in emission order.
#[derive(Debug, Clone)]
pub struct EventPlan {
    source: PlanSource,
}

#[derive(Debug, Clone)]
enum PlanSource {
    Replay {
        events: Vec<SseEvent>,
        cursor: usize,
        /// `None` replays forever
        rounds_left: Option<u64>,
    },
    Count {
        next: i64,
        end: Option<i64>,
        format: String,
        event: Option<String>,
    },
}

impl EventPlan {
    pub fn new(source: &EventSource) -> Self {
        let source = match source {
            EventSource::Events(events) => PlanSource::Replay {
                events: events.clone(),
                cursor: 0,
                rounds_left: Some(1),
            },
            EventSource::Generator(EventGenerator::Template { events, repeat }) => {
                PlanSource::Replay {
                    events: events.clone(),
                    cursor: 0,
                    rounds_left: (*repeat > 0).then_some(*repeat),
                }
            }
            EventSource::Generator(EventGenerator::Sequence {
                start,
                end,
                format,
                event,
            }) => PlanSource::Count {
                next: *start,
                end: *end,
                format: format.clone(),
                event: event.clone(),
            },
        };
        Self { source }
    }
}

impl Iterator for EventPlan {
    type Item = SseEvent;

    fn next(&mut self) -> Option<SseEvent> {
        match &mut self.source {
            PlanSource::Replay {
                events,
                cursor,
                rounds_left,
            } => {
                if events.is_empty() || *rounds_left == Some(0) {
                    return None;
                }
                let event = events[*cursor].clone();
                *cursor += 1;
                if *cursor == events.len() {
                    *cursor = 0;
                    if let Some(rounds) = rounds_left {
                        *rounds -= 1;
                    }
                }
                Some(event)
            }
            PlanSource::Count {
                next,
                end,
                format,
                event,
            } => {
                if matches!(end, Some(end) if *next > *end) {
                    return None;
                }
                let value = *next;
                *next = next.checked_add(1)?;
                Some(SseEvent {
                    event: event.clone(),
                    data: Value::String(format.replace("{{value}}", &value.to_string())),
                    id: Some(value.to_string()),
                    retry: None,
                })
            }
        }
    }
}

/// Handle to an open stream, owned by the transport.
///
/// Dropping the handle cancels the stream.
#[derive(Debug)]
pub struct SseStream {
    frames: mpsc::Receiver<SseFrame>,
    state: watch::Receiver<StreamState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SseStream {
    /// Spawn the emitter for `config`. The stream stops when `shutdown` fires
    /// or the handle is cancelled or dropped.
    pub fn start(
        mock_id: &str,
        config: SseConfig,
        shutdown: &CancellationToken,
        buffer: usize,
    ) -> Self {
        let (tx, frames) = mpsc::channel(buffer.max(1));
        let (state_tx, state) = watch::channel(StreamState::Idle);
        let cancel = shutdown.child_token();

        info!(mock_id = %mock_id, bounded = config.is_bounded(), "SSE stream opened");
        let task = tokio::spawn(emit(
            mock_id.to_string(),
            config,
            tx,
            state_tx,
            cancel.clone(),
        ));

        Self {
            frames,
            state,
            cancel,
            task: Some(task),
        }
    }

    /// Next frame, or `None` once the stream is closed or cancelled.
    pub async fn next_frame(&mut self) -> Option<SseFrame> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            frame = self.frames.recv() => frame,
        }
    }

    /// Report a client disconnect.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Wait for the emitter task to finish.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "SSE emitter task failed");
            }
        }
    }
}

impl Drop for SseStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The emitter observed cancellation or lost its receiver.
struct Closed;

async fn emit(
    mock_id: String,
    config: SseConfig,
    tx: mpsc::Sender<SseFrame>,
    state: watch::Sender<StreamState>,
    cancel: CancellationToken,
) {
    state.send_replace(StreamState::Emitting);

    let mut keepalive = config.lifecycle.keepalive_interval().map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let delay = Duration::from_millis(config.timing.fixed_delay_ms);
    let max_events = config.lifecycle.max_events;

    let mut emitted = 0u64;
    let mut outcome = Ok(());
    for (index, event) in EventPlan::new(&config.source).enumerate() {
        if max_events.is_some_and(|max| emitted >= max) {
            break;
        }
        let Some(frame) = event.to_frame() else {
            warn!(mock_id = %mock_id, index, "Skipping SSE event without data");
            continue;
        };
        if emitted > 0 && !delay.is_zero() {
            outcome = pause(Some(delay), &mut keepalive, &tx, &cancel).await;
            if outcome.is_err() {
                break;
            }
        }
        outcome = send(&tx, frame, &cancel).await;
        if outcome.is_err() {
            break;
        }
        emitted += 1;
    }

    if outcome.is_ok() {
        state.send_replace(StreamState::Terminating);
        if config.lifecycle.termination == Termination::KeepOpen {
            let _ = pause(None, &mut keepalive, &tx, &cancel).await;
        }
    }

    state.send_replace(StreamState::Closed);
    debug!(
        mock_id = %mock_id,
        emitted,
        cancelled = cancel.is_cancelled(),
        "SSE stream closed"
    );
}

/// Wait for `duration` (forever when `None`) while still sending keepalives.
async fn pause(
    duration: Option<Duration>,
    keepalive: &mut Option<Interval>,
    tx: &mpsc::Sender<SseFrame>,
    cancel: &CancellationToken,
) -> Result<(), Closed> {
    let sleep = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Closed),
            _ = &mut sleep => return Ok(()),
            _ = tick(keepalive) => send(tx, SseFrame::Keepalive, cancel).await?,
        }
    }
}

async fn tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn send(
    tx: &mpsc::Sender<SseFrame>,
    frame: SseFrame,
    cancel: &CancellationToken,
) -> Result<(), Closed> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Closed),
        sent = tx.send(frame) => sent.map_err(|_| Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data_frames(frames: &[SseFrame]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|f| f.data().map(String::from))
            .collect()
    }

    async fn drain(stream: &mut SseStream) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = stream.next_frame().await {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_events_and_generator_are_exclusive() {
        let yaml = r#"
events:
  - data: one
generator:
  type: template
  events:
    - data: two
"#;
        let err = serde_yaml::from_str::<SseConfig>(yaml).unwrap_err().to_string();
        assert!(err.contains("mutually exclusive"), "{err}");
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
generator:
  type: template
  repeat: 3
  events:
    - event: tick
      data: {n: 1}
timing:
  fixedDelayMs: 250
lifecycle:
  keepaliveIntervalMs: 1000
  termination:
    type: keepOpen
"#;
        let config: SseConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.timing.fixed_delay_ms, 250);
        assert_eq!(config.lifecycle.termination, Termination::KeepOpen);
        assert!(!config.is_bounded());
        assert!(matches!(
            config.source,
            EventSource::Generator(EventGenerator::Template { repeat: 3, .. })
        ));
    }

    #[test]
    fn test_frame_encoding() {
        let frame = SseEvent {
            event: Some("update".into()),
            data: json!("line1\nline2"),
            id: Some("7".into()),
            retry: None,
        }
        .to_frame()
        .unwrap();
        assert_eq!(
            frame.encode(),
            "event: update\nid: 7\ndata: line1\ndata: line2\n\n"
        );
        assert_eq!(SseFrame::Keepalive.encode(), ": keepalive\n\n");

        let frame = SseEvent::data(json!({"a": 1})).to_frame().unwrap();
        assert_eq!(frame.data(), Some(r#"{"a":1}"#));
        assert!(SseEvent::data(Value::Null).to_frame().is_none());
    }

    #[test]
    fn test_sequence_plan() {
        let source = EventSource::Generator(EventGenerator::Sequence {
            start: 1,
            end: Some(3),
            format: "count={{value}}".into(),
            event: None,
        });
        let data: Vec<Value> = EventPlan::new(&source).map(|e| e.data).collect();
        assert_eq!(data, vec![json!("count=1"), json!("count=2"), json!("count=3")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_template_repeats_then_closes() {
        let config = SseConfig::template(vec![SseEvent::data("e1"), SseEvent::data("e2")], 3)
            .with_delay_ms(10);
        let shutdown = CancellationToken::new();
        let mut stream = SseStream::start("sse-test", config, &shutdown, 1);

        let frames = drain(&mut stream).await;
        assert_eq!(
            data_frames(&frames),
            vec!["e1", "e2", "e1", "e2", "e1", "e2"]
        );
        stream.join().await;
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_endless_stream_stops_on_cancel() {
        let config = SseConfig::template(vec![SseEvent::data("tick")], 0).with_delay_ms(5);
        let shutdown = CancellationToken::new();
        let mut stream = SseStream::start("sse-test", config, &shutdown, 1);

        for _ in 0..10 {
            assert!(stream.next_frame().await.is_some());
        }
        stream.cancel();
        // Ready at once, without waiting for the next tick
        tokio_test::assert_ready_eq!(tokio_test::task::spawn(stream.next_frame()).poll(), None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(stream.next_frame().await.is_none());
        stream.join().await;
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_shutdown_cancels_stream() {
        let config = SseConfig::template(vec![SseEvent::data("tick")], 0).with_delay_ms(5);
        let shutdown = CancellationToken::new();
        let mut stream = SseStream::start("sse-test", config, &shutdown, 1);

        assert!(stream.next_frame().await.is_some());
        shutdown.cancel();
        assert!(stream.next_frame().await.is_none());
        stream.join().await;
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_interleaves_with_delay() {
        let config = SseConfig::events(vec![SseEvent::data("a"), SseEvent::data("b")])
            .with_delay_ms(100)
            .with_keepalive_ms(40);
        let shutdown = CancellationToken::new();
        let mut stream = SseStream::start("sse-test", config, &shutdown, 1);

        let frames = drain(&mut stream).await;
        assert_eq!(data_frames(&frames), vec!["a", "b"]);
        let keepalives = frames.iter().filter(|f| f.is_keepalive()).count();
        assert!((2..=3).contains(&keepalives), "got {keepalives} keepalives");
        assert_eq!(frames.first().and_then(|f| f.data()), Some("a"));
        assert_eq!(frames.last().and_then(|f| f.data()), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_null_events_skipped_and_max_events_caps() {
        let mut config = SseConfig::template(
            vec![SseEvent::data("x"), SseEvent::data(Value::Null)],
            0,
        );
        config.lifecycle.max_events = Some(4);
        let shutdown = CancellationToken::new();
        let mut stream = SseStream::start("sse-test", config, &shutdown, 1);

        let frames = drain(&mut stream).await;
        assert_eq!(data_frames(&frames), vec!["x", "x", "x", "x"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_events_take_no_delay() {
        let config = SseConfig::events(vec![
            SseEvent::data("a"),
            SseEvent::data(Value::Null),
            SseEvent::data(Value::Null),
            SseEvent::data("b"),
            SseEvent::data(Value::Null),
        ])
        .with_delay_ms(100);
        let shutdown = CancellationToken::new();
        let mut stream = SseStream::start("sse-test", config, &shutdown, 1);

        assert_eq!(stream.next_frame().await.unwrap().data(), Some("a"));
        let start = Instant::now();
        assert_eq!(stream.next_frame().await.unwrap().data(), Some("b"));
        let gap = start.elapsed();
        assert!(
            gap >= Duration::from_millis(100) && gap < Duration::from_millis(200),
            "gap was {gap:?}"
        );
        assert!(stream.next_frame().await.is_none());
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_open_holds_until_cancelled() {
        let config = SseConfig::events(vec![SseEvent::data("only")])
            .with_keepalive_ms(50)
            .with_termination(Termination::KeepOpen);
        let shutdown = CancellationToken::new();
        let mut stream = SseStream::start("sse-test", config, &shutdown, 1);

        let first = stream.next_frame().await.unwrap();
        assert_eq!(first.data(), Some("only"));
        assert_eq!(stream.next_frame().await, Some(SseFrame::Keepalive));
        assert_eq!(stream.state(), StreamState::Terminating);
        stream.cancel();
        stream.join().await;
        assert_eq!(stream.state(), StreamState::Closed);
    }
}
