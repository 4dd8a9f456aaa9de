// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Command dispatch.
//!
//! A [`Command`] is a named plugin whose lifecycle spans both ends of one
//! broadcast conversation:
//!
//! | Hook | Side | When |
//! |------|------|------|
//! | `validate` | requester | before anything is sent |
//! | `before` | requester | after validation, before the request |
//! | `exec` | listener | once per inbound request |
//! | `host_end` | requester | once per host that ended and accepted |
//! | `end` | requester | once, after every `host_end` |
//!
//! The first frame a listener sends is a marker, `{"$command": "accept"}` or
//! `{"$command": "reject"}`. Rejecting hosts are filtered out on the
//! requester side; accepting hosts have the marker stripped.

use crate::broadcast::{
    BroadcastError, ConversationError, ConversationEvent, FailureReason, IncomingRequest,
    Outcome, RequestOptions, RequestStream, Responder,
};
use crate::fleet::{Fleet, FleetError};
use crate::queue::ProcessingQueue;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Key of the accept/reject marker object.
pub const MARKER_KEY: &str = "$command";

/// Command errors.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Unknown command '{0}'")]
    Unknown(String),

    #[error("Invalid arguments for '{command}': {message}")]
    Invalid { command: String, message: String },

    #[error("Command '{command}' failed: {message}")]
    Failed { command: String, message: String },

    #[error("Reply already decided ({0:?})")]
    AlreadyDecided(Verdict),

    #[error("Command was rejected, no data can be sent")]
    Rejected,

    #[error("Broadcast error: {0}")]
    Broadcast(#[from] BroadcastError),

    #[error("Fleet error: {0}")]
    Fleet(#[from] FleetError),

    #[error("{0}")]
    Conversation(#[from] ConversationError),
}

impl CommandError {
    /// Hook failure with a message.
    pub fn failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            command: command.into(),
            message: message.into(),
        }
    }
}

/// A listener's answer to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

impl Verdict {
    fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
        }
    }

    /// Marker frame body.
    pub fn marker(self) -> Value {
        let mut marker = serde_json::Map::new();
        marker.insert(MARKER_KEY.to_string(), Value::from(self.as_str()));
        Value::Object(marker)
    }

    /// Parse a marker frame body.
    pub fn from_marker(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if object.len() != 1 {
            return None;
        }
        match object.get(MARKER_KEY)?.as_str()? {
            "accept" => Some(Self::Accept),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

/// What a hook knows about the invocation.
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Command (and topic) name.
    pub command: String,

    /// Arguments sent with the request.
    pub args: Value,

    /// Host running this hook.
    pub host: String,

    /// Host that issued the command.
    pub requester: String,

    /// Conversation id, once the request went out.
    pub conversation_id: Option<String>,
}

/// A named command plugin. Every hook has a default.
#[async_trait]
pub trait Command: Send + Sync + 'static {
    /// Command name, also the broadcast topic.
    fn name(&self) -> &str;

    /// Check arguments before anything is sent. `Err` carries the message.
    fn validate(&self, _args: &Value) -> Result<(), String> {
        Ok(())
    }

    /// Requester-side setup.
    async fn before(&self, _ctx: &CommandContext) -> Result<(), CommandError> {
        Ok(())
    }

    /// Listener-side handler. Rejects unless overridden.
    async fn exec(&self, _ctx: &CommandContext, reply: &mut Reply) -> Result<(), CommandError> {
        reply.reject().await
    }

    /// One host finished (and accepted).
    async fn host_end(&self, _ctx: &CommandContext, _host: &str, _responses: &[Value]) {}

    /// Every host finished or timed out.
    async fn end(
        &self,
        _ctx: &CommandContext,
        _responses: &BTreeMap<String, Vec<Value>>,
        _expired: &[String],
    ) {
    }

    /// Overrides both conversation timeouts.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Command name -> implementation.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command under its name, returning any command it replaces.
    pub fn register<C: Command>(&mut self, command: C) -> Option<Arc<dyn Command>> {
        self.register_arc(Arc::new(command))
    }

    pub fn register_arc(&mut self, command: Arc<dyn Command>) -> Option<Arc<dyn Command>> {
        let name = command.name().to_string();
        let previous = self.commands.insert(name.clone(), command);
        if previous.is_some() {
            warn!("Command '{}' registered twice, keeping the latest", name);
        }
        previous
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Command>> {
        self.commands.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn Command>)> {
        self.commands.iter()
    }
}

/// Listener-side reply handle passed to [`Command::exec`].
pub struct Reply {
    responder: Responder,
    verdict: Option<Verdict>,
}

impl Reply {
    fn new(responder: Responder) -> Self {
        Self {
            responder,
            verdict: None,
        }
    }

    /// Decision sent so far.
    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict
    }

    /// Handle the command.
    pub async fn accept(&mut self) -> Result<(), CommandError> {
        self.decide(Verdict::Accept).await
    }

    /// Decline the command; the requester ignores this host.
    pub async fn reject(&mut self) -> Result<(), CommandError> {
        self.decide(Verdict::Reject).await
    }

    /// Send one response body, accepting first if needed.
    pub async fn send<T: Serialize + ?Sized>(&mut self, body: &T) -> Result<(), CommandError> {
        match self.verdict {
            None => self.accept().await?,
            Some(Verdict::Reject) => return Err(CommandError::Rejected),
            Some(Verdict::Accept) => {}
        }
        self.responder.send_data(body).await?;
        Ok(())
    }

    async fn decide(&mut self, verdict: Verdict) -> Result<(), CommandError> {
        match self.verdict {
            Some(current) if current == verdict => Ok(()),
            Some(current) => Err(CommandError::AlreadyDecided(current)),
            None => {
                self.responder.send_data(&verdict.marker()).await?;
                self.verdict = Some(verdict);
                Ok(())
            }
        }
    }

    /// Accept if nothing was decided, then end the conversation.
    async fn finish(mut self) -> Result<(), CommandError> {
        if self.verdict.is_none() {
            if let Err(e) = self.accept().await {
                warn!(
                    "Failed to accept conversation {}: {}",
                    self.responder.id(),
                    e
                );
            }
        }
        self.responder.end().await?;
        Ok(())
    }
}

/// Requester-side result of a command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutcome {
    /// Accepted hosts and their responses, markers removed.
    pub responses: BTreeMap<String, Vec<Value>>,

    /// Hosts that rejected the command.
    pub rejected: Vec<String>,

    /// Expected hosts that never ended.
    pub outstanding: Vec<String>,
}

enum HostReply {
    Accepted(Vec<Value>),
    Rejected,
}

fn classify(mut responses: Vec<Value>) -> HostReply {
    match responses.first().and_then(Verdict::from_marker) {
        Some(Verdict::Reject) => HostReply::Rejected,
        Some(Verdict::Accept) => {
            responses.remove(0);
            HostReply::Accepted(responses)
        }
        None => HostReply::Accepted(responses),
    }
}

/// Run `command` across the fleet from this node.
///
/// `host_end` runs for each accepting host as it ends; `end` runs once after
/// all of them. If the conversation fails, `end` still runs (with no
/// responses) before the error is returned.
pub async fn run(
    fleet: &Fleet,
    command: Arc<dyn Command>,
    args: Value,
) -> Result<CommandOutcome, CommandError> {
    let name = command.name().to_string();
    command
        .validate(&args)
        .map_err(|message| CommandError::Invalid {
            command: name.clone(),
            message,
        })?;

    let mut ctx = CommandContext {
        command: name.clone(),
        args: args.clone(),
        host: fleet.host().to_string(),
        requester: fleet.host().to_string(),
        conversation_id: None,
    };
    command.before(&ctx).await?;

    let (connect_timeout, idle_timeout) = match command.timeout() {
        Some(timeout) => (timeout, timeout),
        None => fleet.config().command_timeouts(&name),
    };
    let options = RequestOptions {
        expect: None,
        connect_timeout,
        idle_timeout,
    };

    let mut conversation = fleet.request(&name, args, options).await?;
    ctx.conversation_id = Some(conversation.id().to_string());
    let ctx = Arc::new(ctx);
    let queue = ProcessingQueue::new();
    let mut rejected = BTreeSet::new();

    let result = loop {
        let Some(event) = conversation.next_event().await else {
            break Err(ConversationError {
                id: conversation.id().to_string(),
                topic: name.clone(),
                reason: FailureReason::ChannelClosed,
                outstanding: conversation.expected().iter().cloned().collect(),
            });
        };
        match event {
            ConversationEvent::Ack { host } => trace!("'{}' acked by {}", name, host),
            ConversationEvent::Data { .. } => {}
            ConversationEvent::HostEnd { host, responses } => match classify(responses) {
                HostReply::Rejected => {
                    debug!("{} rejected '{}'", host, name);
                    rejected.insert(host);
                }
                HostReply::Accepted(bodies) => {
                    let command = command.clone();
                    let ctx = ctx.clone();
                    queue.push(async move {
                        command.host_end(&ctx, &host, &bodies).await;
                    });
                }
            },
            ConversationEvent::End(outcome) => break Ok(outcome),
            ConversationEvent::Error(e) => break Err(e),
        }
    };

    let (outcome, failure) = match result {
        Ok(outcome) => (outcome, None),
        Err(e) => {
            let outcome = Outcome {
                responses: BTreeMap::new(),
                outstanding: e.outstanding.clone(),
            };
            (outcome, Some(e))
        }
    };

    let mut responses = BTreeMap::new();
    for (host, bodies) in outcome.responses {
        match classify(bodies) {
            HostReply::Rejected => {
                rejected.insert(host);
            }
            HostReply::Accepted(bodies) => {
                responses.insert(host, bodies);
            }
        }
    }
    let summary = CommandOutcome {
        responses,
        rejected: rejected.into_iter().collect(),
        outstanding: outcome.outstanding,
    };

    {
        let command = command.clone();
        let ctx = ctx.clone();
        let summary = summary.clone();
        queue.push(async move {
            command
                .end(&ctx, &summary.responses, &summary.outstanding)
                .await;
        });
    }
    queue.drained().await;

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(summary),
    }
}

/// Run the registered command called `name`.
pub async fn run_named(
    fleet: &Fleet,
    registry: &CommandRegistry,
    name: &str,
    args: Value,
) -> Result<CommandOutcome, CommandError> {
    let command = registry
        .get(name)
        .ok_or_else(|| CommandError::Unknown(name.to_string()))?;
    run(fleet, command, args).await
}

/// Listener side: serves every registered command until shut down.
pub struct CommandServer {
    host: String,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl CommandServer {
    /// Listen on every command's topic.
    pub async fn start(fleet: &Fleet, registry: &CommandRegistry) -> Result<Self, CommandError> {
        let (shutdown, _) = watch::channel(false);
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(registry.len());

        for (name, command) in registry.iter() {
            let stream = match fleet.listen(name).await {
                Ok(stream) => stream,
                Err(e) => {
                    for task in &tasks {
                        task.abort();
                    }
                    return Err(e.into());
                }
            };
            tasks.push(tokio::spawn(serve_command(
                stream,
                command.clone(),
                fleet.host().to_string(),
                shutdown.subscribe(),
            )));
        }

        info!(
            "{} serving {} command(s): {:?}",
            fleet.host(),
            tasks.len(),
            registry.names()
        );

        Ok(Self {
            host: fleet.host().to_string(),
            shutdown,
            tasks,
        })
    }

    /// Stop listening. Requests already being handled run to completion.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                warn!("Command listener task failed: {}", e);
            }
        }
        info!("{} stopped serving commands", self.host);
    }
}

impl Drop for CommandServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn serve_command(
    mut stream: RequestStream,
    command: Arc<dyn Command>,
    host: String,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            request = stream.next() => match request {
                Some(request) => {
                    tokio::spawn(handle_request(command.clone(), host.clone(), request));
                }
                None => {
                    debug!("Request stream for '{}' closed", stream.topic());
                    break;
                }
            },
        }
    }

    if let Err(e) = stream.close() {
        warn!("Failed to close '{}' listener: {}", stream.topic(), e);
    }
}

async fn handle_request(command: Arc<dyn Command>, host: String, request: IncomingRequest) {
    let IncomingRequest {
        id,
        from,
        body,
        responder,
    } = request;

    let ctx = CommandContext {
        command: command.name().to_string(),
        args: body,
        host,
        requester: from,
        conversation_id: Some(id.clone()),
    };
    debug!(
        "Running '{}' for {} (conversation {})",
        ctx.command, ctx.requester, id
    );

    let mut reply = Reply::new(responder);
    if let Err(e) = command.exec(&ctx, &mut reply).await {
        warn!("Command '{}' failed in conversation {}: {}", ctx.command, id, e);
    }
    if let Err(e) = reply.finish().await {
        warn!("Failed to end conversation {}: {}", id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{reply_channel, request_channel, Frame, RequestFrame};
    use crate::transport::{Channel, Hub, MemoryBroker};
    use serde_json::json;

    #[test]
    fn test_marker_round_trip() {
        assert_eq!(
            Verdict::Accept.marker(),
            json!({"$command": "accept"})
        );
        assert_eq!(
            Verdict::from_marker(&json!({"$command": "reject"})),
            Some(Verdict::Reject)
        );
        assert_eq!(Verdict::from_marker(&json!({"$command": "maybe"})), None);
        assert_eq!(
            Verdict::from_marker(&json!({"$command": "accept", "extra": 1})),
            None
        );
        assert_eq!(Verdict::from_marker(&json!("accept")), None);
    }

    #[test]
    fn test_classify_strips_accept_marker() {
        match classify(vec![Verdict::Accept.marker(), json!("a"), json!("b")]) {
            HostReply::Accepted(bodies) => assert_eq!(bodies, vec![json!("a"), json!("b")]),
            HostReply::Rejected => panic!("expected accepted"),
        }
        assert!(matches!(
            classify(vec![Verdict::Reject.marker()]),
            HostReply::Rejected
        ));
        match classify(vec![json!("unmarked")]) {
            HostReply::Accepted(bodies) => assert_eq!(bodies, vec![json!("unmarked")]),
            HostReply::Rejected => panic!("expected accepted"),
        }
    }

    struct Named(&'static str);

    #[async_trait]
    impl Command for Named {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_registry() {
        let mut registry = CommandRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.register(Named("b")).is_none());
        assert!(registry.register(Named("a")).is_none());
        assert!(registry.register(Named("a")).is_some());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.get("a").is_some());
        assert!(registry.get("c").is_none());
    }

    async fn reply_pair() -> (Reply, Channel) {
        let broker = Arc::new(MemoryBroker::new());
        let worker = Hub::new(broker.clone());
        let control = Hub::new(broker);

        let mut stream = RequestStream::open(&worker, "cmd", "w1").await.unwrap();
        let mut replies = control.open(reply_channel("cmd", "c1"));
        replies.listen().await.unwrap();
        control
            .open(request_channel("cmd"))
            .send(&RequestFrame {
                id: "c1".into(),
                host: "control".into(),
                body: Value::Null,
            })
            .await
            .unwrap();

        let request = stream.next().await.unwrap();
        // Skip the ack.
        replies.recv().await.unwrap();
        (Reply::new(request.responder), replies)
    }

    async fn bodies(mut replies: Channel) -> Vec<Value> {
        let mut bodies = Vec::new();
        while let Some(raw) = replies.recv().await {
            match serde_json::from_value::<Frame>(raw).unwrap() {
                Frame::Data { body, .. } => bodies.push(body),
                Frame::End { .. } => return bodies,
                Frame::Ack { .. } => panic!("unexpected ack"),
            }
        }
        bodies
    }

    #[tokio::test]
    async fn test_send_accepts_implicitly() {
        let (mut reply, replies) = reply_pair().await;
        reply.send(&json!(1)).await.unwrap();
        reply.send(&json!(2)).await.unwrap();
        assert_eq!(reply.verdict(), Some(Verdict::Accept));
        reply.finish().await.unwrap();

        assert_eq!(
            bodies(replies).await,
            vec![Verdict::Accept.marker(), json!(1), json!(2)]
        );
    }

    #[tokio::test]
    async fn test_silent_exec_still_accepts() {
        let (reply, replies) = reply_pair().await;
        reply.finish().await.unwrap();
        assert_eq!(bodies(replies).await, vec![Verdict::Accept.marker()]);
    }

    #[tokio::test]
    async fn test_reject_blocks_data() {
        let (mut reply, replies) = reply_pair().await;
        reply.reject().await.unwrap();
        reply.reject().await.unwrap();
        assert!(matches!(
            reply.send(&json!("nope")).await,
            Err(CommandError::Rejected)
        ));
        assert!(matches!(
            reply.accept().await,
            Err(CommandError::AlreadyDecided(Verdict::Reject))
        ));
        reply.finish().await.unwrap();

        assert_eq!(bodies(replies).await, vec![Verdict::Reject.marker()]);
    }
}
