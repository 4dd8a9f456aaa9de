// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Requester side of a broadcast conversation.
//!
//! Each conversation runs as one task that owns its reply channel and its
//! timer. The task ends exactly once, by completion, timeout, or cancel, and
//! closes the reply channel before emitting the terminal event.

use super::{new_conversation_id, reply_channel, request_channel, BroadcastError, Frame, RequestFrame};
use crate::transport::{Channel, Hub};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Default wait for the first frame.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default wait between frames.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Timeout check period.
const TICK: Duration = Duration::from_millis(10);

/// Per-request options.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Hosts expected to answer. `None` means nobody.
    pub expect: Option<BTreeSet<String>>,

    pub connect_timeout: Duration,

    pub idle_timeout: Duration,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            expect: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl RequestOptions {
    /// Expect exactly these hosts.
    pub fn expecting<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expect = Some(hosts.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Something that happened in a conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    /// First ack from a host.
    Ack { host: String },

    /// One response body from a host.
    Data { host: String, body: Value },

    /// A host sent `end`; carries everything it sent.
    HostEnd { host: String, responses: Vec<Value> },

    /// Terminal: completed, or timed out after at least one host engaged.
    End(Outcome),

    /// Terminal: nobody engaged before the timeout, or the conversation was cancelled.
    Error(ConversationError),
}

impl ConversationEvent {
    /// Whether this is the last event of the conversation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End(_) | Self::Error(_))
    }
}

/// Aggregated result of a conversation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    /// Responses per host that engaged, in arrival order.
    pub responses: BTreeMap<String, Vec<Value>>,

    /// Expected hosts that never ended.
    pub outstanding: Vec<String>,
}

impl Outcome {
    /// Every expected host ended.
    pub fn is_complete(&self) -> bool {
        self.outstanding.is_empty()
    }
}

/// Why a conversation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    ConnectTimeout(Duration),
    IdleTimeout(Duration),
    Cancelled,
    /// The reply channel stopped delivering (transport lost).
    ChannelClosed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectTimeout(t) => write!(f, "no response within {} ms", t.as_millis()),
            Self::IdleTimeout(t) => write!(f, "idle for more than {} ms", t.as_millis()),
            Self::Cancelled => write!(f, "cancelled"),
            Self::ChannelClosed => write!(f, "reply channel closed"),
        }
    }
}

/// Failed conversation.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Conversation {id} on '{topic}' failed: {reason} (outstanding: {outstanding:?})")]
pub struct ConversationError {
    pub id: String,
    pub topic: String,
    pub reason: FailureReason,
    pub outstanding: Vec<String>,
}

/// Handle on a running conversation.
///
/// Dropping the handle cancels the conversation.
pub struct Conversation {
    id: String,
    topic: String,
    expected: BTreeSet<String>,
    events: mpsc::UnboundedReceiver<ConversationEvent>,
    cancel: Option<oneshot::Sender<()>>,
    done: bool,
}

impl Conversation {
    /// Conversation id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Hosts this conversation waits for.
    pub fn expected(&self) -> &BTreeSet<String> {
        &self.expected
    }

    /// Next event; `None` after the terminal one.
    pub async fn next_event(&mut self) -> Option<ConversationEvent> {
        if self.done {
            return None;
        }
        let event = self.events.recv().await?;
        if event.is_terminal() {
            self.done = true;
        }
        Some(event)
    }

    /// Stop waiting. The conversation ends with [`FailureReason::Cancelled`]
    /// unless it already terminated.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// Skip intermediate events and wait for the result.
    pub async fn finish(mut self) -> Result<Outcome, ConversationError> {
        while let Some(event) = self.next_event().await {
            match event {
                ConversationEvent::End(outcome) => return Ok(outcome),
                ConversationEvent::Error(e) => return Err(e),
                _ => {}
            }
        }
        Err(ConversationError {
            id: self.id.clone(),
            topic: self.topic.clone(),
            reason: FailureReason::ChannelClosed,
            outstanding: self.expected.iter().cloned().collect(),
        })
    }
}

impl fmt::Debug for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversation")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("expected", &self.expected)
            .field("done", &self.done)
            .finish()
    }
}

/// Start a conversation on `topic` as `initiator`.
///
/// The reply channel is listened on before the request goes out, so no frame
/// can be missed. With nobody expected the conversation ends right away
/// without touching the network.
pub async fn request(
    hub: &Hub,
    initiator: &str,
    topic: &str,
    body: Value,
    options: RequestOptions,
) -> Result<Conversation, BroadcastError> {
    let id = new_conversation_id();
    let expected = options.expect.unwrap_or_default();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    if expected.is_empty() {
        debug!("Conversation {} on '{}' has nobody to ask", id, topic);
        let _ = events_tx.send(ConversationEvent::End(Outcome::default()));
        return Ok(Conversation {
            id,
            topic: topic.to_string(),
            expected,
            events: events_rx,
            cancel: None,
            done: false,
        });
    }

    let mut replies = hub.open(reply_channel(topic, &id));
    replies.listen().await?;

    let frame = RequestFrame {
        id: id.clone(),
        host: initiator.to_string(),
        body,
    };
    if let Err(e) = hub.open(request_channel(topic)).send(&frame).await {
        if let Err(close) = replies.close() {
            warn!("Failed to close reply channel for {}: {}", id, close);
        }
        return Err(e.into());
    }
    debug!(
        "Conversation {} on '{}' started, expecting {:?}",
        id, topic, expected
    );

    let (cancel_tx, cancel_rx) = oneshot::channel();
    let state = State::new(
        id.clone(),
        topic.to_string(),
        expected.clone(),
        options.connect_timeout,
        options.idle_timeout,
        events_tx,
    );
    tokio::spawn(drive(state, replies, cancel_rx));

    Ok(Conversation {
        id,
        topic: topic.to_string(),
        expected,
        events: events_rx,
        cancel: Some(cancel_tx),
        done: false,
    })
}

async fn drive(mut state: State, mut replies: Channel, mut cancel: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let terminal = loop {
        tokio::select! {
            _ = &mut cancel => break state.fail(FailureReason::Cancelled),

            message = replies.recv() => match message {
                Some(raw) => match serde_json::from_value::<Frame>(raw) {
                    Ok(frame) => {
                        if let Progress::Complete = state.on_frame(frame, Instant::now()) {
                            break state.finish();
                        }
                    }
                    Err(e) => warn!("Malformed frame in conversation {}: {}", state.id, e),
                },
                None => break state.expire(FailureReason::ChannelClosed),
            },

            _ = ticker.tick() => {
                if let Some(reason) = state.expired(Instant::now()) {
                    break state.expire(reason);
                }
            }
        }
    };

    drop(ticker);
    if let Err(e) = replies.close() {
        warn!("Failed to close reply channel for {}: {}", state.id, e);
    }
    state.emit(terminal);
}

#[derive(Debug, PartialEq, Eq)]
enum Progress {
    Pending,
    Complete,
}

/// Per-conversation bookkeeping.
struct State {
    id: String,
    topic: String,
    expected: BTreeSet<String>,
    remaining: BTreeSet<String>,
    acked: HashSet<String>,
    ended: HashSet<String>,
    responses: BTreeMap<String, Vec<Value>>,
    started: Instant,
    last_frame: Option<Instant>,
    connect_timeout: Duration,
    idle_timeout: Duration,
    events: mpsc::UnboundedSender<ConversationEvent>,
}

impl State {
    fn new(
        id: String,
        topic: String,
        expected: BTreeSet<String>,
        connect_timeout: Duration,
        idle_timeout: Duration,
        events: mpsc::UnboundedSender<ConversationEvent>,
    ) -> Self {
        Self {
            id,
            topic,
            remaining: expected.clone(),
            expected,
            acked: HashSet::new(),
            ended: HashSet::new(),
            responses: BTreeMap::new(),
            started: Instant::now(),
            last_frame: None,
            connect_timeout,
            idle_timeout,
            events,
        }
    }

    fn on_frame(&mut self, frame: Frame, now: Instant) -> Progress {
        let host = frame.host().to_string();
        if !self.expected.contains(&host) {
            warn!(
                "Ignoring {} from unexpected host {} in conversation {}",
                frame.kind(),
                host,
                self.id
            );
            return Progress::Pending;
        }
        if self.ended.contains(&host) {
            debug!(
                "Ignoring {} from {} after its end in conversation {}",
                frame.kind(),
                host,
                self.id
            );
            return Progress::Pending;
        }

        trace!("Conversation {}: {} from {}", self.id, frame.kind(), host);
        self.last_frame = Some(now);

        match frame {
            Frame::Ack { .. } => {
                self.responses.entry(host.clone()).or_default();
                if self.acked.insert(host.clone()) {
                    self.emit(ConversationEvent::Ack { host });
                }
            }
            Frame::Data { body, .. } => {
                self.responses
                    .entry(host.clone())
                    .or_default()
                    .push(body.clone());
                self.emit(ConversationEvent::Data { host, body });
            }
            Frame::End { .. } => {
                self.ended.insert(host.clone());
                self.remaining.remove(&host);
                let responses = self.responses.entry(host.clone()).or_default().clone();
                self.emit(ConversationEvent::HostEnd { host, responses });
                if self.remaining.is_empty() {
                    return Progress::Complete;
                }
            }
        }
        Progress::Pending
    }

    fn expired(&self, now: Instant) -> Option<FailureReason> {
        match self.last_frame {
            None if now.duration_since(self.started) > self.connect_timeout => {
                Some(FailureReason::ConnectTimeout(self.connect_timeout))
            }
            Some(last) if now.duration_since(last) > self.idle_timeout => {
                Some(FailureReason::IdleTimeout(self.idle_timeout))
            }
            _ => None,
        }
    }

    fn outstanding(&self) -> Vec<String> {
        self.remaining.iter().cloned().collect()
    }

    fn finish(&mut self) -> ConversationEvent {
        debug!("Conversation {} on '{}' complete", self.id, self.topic);
        ConversationEvent::End(Outcome {
            responses: std::mem::take(&mut self.responses),
            outstanding: self.outstanding(),
        })
    }

    fn fail(&mut self, reason: FailureReason) -> ConversationEvent {
        debug!("Conversation {} on '{}' failed: {}", self.id, self.topic, reason);
        ConversationEvent::Error(ConversationError {
            id: self.id.clone(),
            topic: self.topic.clone(),
            reason,
            outstanding: self.outstanding(),
        })
    }

    /// Partial end if anyone engaged, failure otherwise.
    fn expire(&mut self, reason: FailureReason) -> ConversationEvent {
        if self.responses.is_empty() {
            return self.fail(reason);
        }
        debug!(
            "Conversation {} on '{}' ended early ({}), outstanding {:?}",
            self.id,
            self.topic,
            reason,
            self.remaining
        );
        ConversationEvent::End(Outcome {
            responses: std::mem::take(&mut self.responses),
            outstanding: self.outstanding(),
        })
    }

    fn emit(&self, event: ConversationEvent) {
        if self.events.send(event).is_err() {
            trace!("Conversation {} has no observer", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::RequestStream;
    use crate::transport::MemoryBroker;
    use serde_json::json;
    use std::sync::Arc;

    fn hosts(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|h| h.to_string()).collect()
    }

    fn state(expected: &[&str]) -> (State, mpsc::UnboundedReceiver<ConversationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = State::new(
            "c1".into(),
            "t".into(),
            hosts(expected),
            Duration::from_millis(100),
            Duration::from_millis(100),
            tx,
        );
        (state, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ConversationEvent>) -> Vec<ConversationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Worker that answers every request with `replies`, then ends.
    async fn spawn_worker(hub: Hub, topic: &str, host: &str, replies: Vec<Value>) {
        let mut stream = RequestStream::open(&hub, topic, host).await.unwrap();
        tokio::spawn(async move {
            while let Some(mut request) = stream.next().await {
                for body in &replies {
                    request.responder.send_data(body).await.unwrap();
                }
                request.responder.end().await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_duplicate_ack_emits_once() {
        let (mut state, mut rx) = state(&["a"]);
        let now = Instant::now();

        state.on_frame(Frame::Ack { host: "a".into() }, now);
        state.on_frame(Frame::Ack { host: "a".into() }, now);

        assert_eq!(
            drain(&mut rx),
            vec![ConversationEvent::Ack { host: "a".into() }]
        );
    }

    #[tokio::test]
    async fn test_unexpected_host_and_data_after_end_ignored() {
        let (mut state, mut rx) = state(&["a", "b"]);
        let now = Instant::now();

        state.on_frame(Frame::End { host: "stranger".into() }, now);
        assert!(state.last_frame.is_none());

        state.on_frame(
            Frame::Data {
                host: "a".into(),
                body: json!(1),
            },
            now,
        );
        assert_eq!(
            state.on_frame(Frame::End { host: "a".into() }, now),
            Progress::Pending
        );
        state.on_frame(
            Frame::Data {
                host: "a".into(),
                body: json!(2),
            },
            now,
        );

        assert_eq!(
            drain(&mut rx),
            vec![
                ConversationEvent::Data {
                    host: "a".into(),
                    body: json!(1)
                },
                ConversationEvent::HostEnd {
                    host: "a".into(),
                    responses: vec![json!(1)]
                },
            ]
        );
        assert_eq!(state.responses["a"], vec![json!(1)]);
        assert!(!state.responses.contains_key("stranger"));
        assert_eq!(state.outstanding(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_expiry_rules() {
        let (mut state, _rx) = state(&["a", "b"]);
        let start = state.started;

        assert_eq!(state.expired(start + Duration::from_millis(100)), None);
        assert_eq!(
            state.expired(start + Duration::from_millis(101)),
            Some(FailureReason::ConnectTimeout(Duration::from_millis(100)))
        );

        // Once a frame arrived only the idle timeout applies.
        let seen = start + Duration::from_millis(90);
        state.on_frame(Frame::Ack { host: "a".into() }, seen);
        assert_eq!(state.expired(start + Duration::from_millis(150)), None);
        assert_eq!(
            state.expired(seen + Duration::from_millis(101)),
            Some(FailureReason::IdleTimeout(Duration::from_millis(100)))
        );

        // Someone engaged, so expiry yields a partial end.
        match state.expire(FailureReason::IdleTimeout(Duration::from_millis(100))) {
            ConversationEvent::End(outcome) => {
                assert_eq!(outcome.responses["a"], Vec::<Value>::new());
                assert_eq!(outcome.outstanding, vec!["a".to_string(), "b".to_string()]);
                assert!(!outcome.is_complete());
            }
            other => panic!("expected End, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_hosts_respond() {
        let broker = Arc::new(MemoryBroker::new());
        spawn_worker(Hub::new(broker.clone()), "status", "w1", vec![json!("ok")]).await;
        spawn_worker(Hub::new(broker.clone()), "status", "w2", vec![json!(1), json!(2)]).await;

        let control = Hub::new(broker);
        let mut conversation = request(
            &control,
            "control",
            "status",
            json!({}),
            RequestOptions::default().expecting(["w1", "w2"]),
        )
        .await
        .unwrap();

        let mut acks = BTreeSet::new();
        let mut host_ends = BTreeSet::new();
        let outcome = loop {
            match conversation.next_event().await.unwrap() {
                ConversationEvent::Ack { host } => {
                    assert!(!host_ends.contains(&host));
                    acks.insert(host);
                }
                ConversationEvent::Data { .. } => {}
                ConversationEvent::HostEnd { host, .. } => {
                    host_ends.insert(host);
                }
                ConversationEvent::End(outcome) => break outcome,
                ConversationEvent::Error(e) => panic!("unexpected error: {}", e),
            }
        };

        assert_eq!(acks, hosts(&["w1", "w2"]));
        assert_eq!(host_ends, hosts(&["w1", "w2"]));
        assert!(outcome.is_complete());
        assert_eq!(outcome.responses["w1"], vec![json!("ok")]);
        assert_eq!(outcome.responses["w2"], vec![json!(1), json!(2)]);
        assert!(conversation.next_event().await.is_none());
        assert!(!control.is_listening(&reply_channel("status", conversation.id())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_host_event_sequence() {
        let broker = Arc::new(MemoryBroker::new());
        spawn_worker(Hub::new(broker.clone()), "status", "w1", vec![json!("x")]).await;

        let control = Hub::new(broker);
        let mut conversation = request(
            &control,
            "control",
            "status",
            Value::Null,
            RequestOptions::default().expecting(["w1"]),
        )
        .await
        .unwrap();

        let mut events = Vec::new();
        while let Some(event) = conversation.next_event().await {
            events.push(event);
        }

        assert_eq!(
            events,
            vec![
                ConversationEvent::Ack { host: "w1".into() },
                ConversationEvent::Data {
                    host: "w1".into(),
                    body: json!("x")
                },
                ConversationEvent::HostEnd {
                    host: "w1".into(),
                    responses: vec![json!("x")]
                },
                ConversationEvent::End(Outcome {
                    responses: BTreeMap::from([("w1".to_string(), vec![json!("x")])]),
                    outstanding: Vec::new(),
                }),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_nobody_answers_is_connect_error() {
        let broker = Arc::new(MemoryBroker::new());
        let control = Hub::new(broker);

        let started = Instant::now();
        let conversation = request(
            &control,
            "control",
            "status",
            Value::Null,
            RequestOptions::default()
                .expecting(["ghost"])
                .with_connect_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap();

        let err = conversation.finish().await.unwrap_err();
        assert_eq!(
            err.reason,
            FailureReason::ConnectTimeout(Duration::from_millis(200))
        );
        assert_eq!(err.outstanding, vec!["ghost".to_string()]);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_host_yields_partial_end() {
        let broker = Arc::new(MemoryBroker::new());
        spawn_worker(Hub::new(broker.clone()), "status", "w1", vec![json!("up")]).await;

        let control = Hub::new(broker);
        let outcome = request(
            &control,
            "control",
            "status",
            Value::Null,
            RequestOptions::default()
                .expecting(["w1", "w2"])
                .with_idle_timeout(Duration::from_millis(300)),
        )
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();

        assert_eq!(outcome.outstanding, vec!["w2".to_string()]);
        assert_eq!(outcome.responses.len(), 1);
        assert_eq!(outcome.responses["w1"], vec![json!("up")]);
    }

    #[tokio::test]
    async fn test_empty_expectation_ends_without_network() {
        let broker = Arc::new(MemoryBroker::new());
        let control = Hub::new(broker);
        let mut watcher = control.open(request_channel("status"));
        watcher.listen().await.unwrap();

        let outcome = request(
            &control,
            "control",
            "status",
            Value::Null,
            RequestOptions::default().expecting(Vec::<String>::new()),
        )
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();

        assert_eq!(outcome, Outcome::default());
        assert!(tokio::time::timeout(Duration::from_millis(20), watcher.recv())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_tears_down() {
        let broker = Arc::new(MemoryBroker::new());
        let control = Hub::new(broker);

        let mut conversation = request(
            &control,
            "control",
            "status",
            Value::Null,
            RequestOptions::default().expecting(["w1"]),
        )
        .await
        .unwrap();
        let reply = reply_channel("status", conversation.id());
        assert!(control.is_listening(&reply));

        conversation.cancel();
        match conversation.next_event().await.unwrap() {
            ConversationEvent::Error(e) => assert_eq!(e.reason, FailureReason::Cancelled),
            other => panic!("expected Error, got {:?}", other),
        }
        assert!(!control.is_listening(&reply));
        assert!(conversation.next_event().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_from_strangers_do_not_count() {
        let broker = Arc::new(MemoryBroker::new());
        let control = Hub::new(broker.clone());
        let stranger = Hub::new(broker);

        let conversation = request(
            &control,
            "control",
            "status",
            Value::Null,
            RequestOptions::default()
                .expecting(["w1"])
                .with_connect_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();

        stranger
            .open(reply_channel("status", conversation.id()))
            .send(&Frame::End {
                host: "stranger".into(),
            })
            .await
            .unwrap();

        let err = conversation.finish().await.unwrap_err();
        assert!(matches!(err.reason, FailureReason::ConnectTimeout(_)));
    }
}
