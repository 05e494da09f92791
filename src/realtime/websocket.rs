//! Phoenix-channel realtime provider over a single websocket
//!
//! All channels share one socket, opened lazily on the first join and closed
//! when the last channel leaves. A socket failure is reported as a channel
//! error on every joined channel; recovering is left to the connection state
//! machines, which open fresh channels.

use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

use super::{
    ChannelHandle, ChannelStatus, EventCallback, ListenFilter, ListenerId, RealtimeProvider,
    StatusCallback,
};
use crate::{
    config::RealtimeConfig,
    error::{AppError, AppResult},
    models::{ChangeEvent, EventFilter, PresenceEvent, RealtimeEvent},
    repository::lock,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PHOENIX_TOPIC: &str = "phoenix";

/// Wire frame of the Phoenix protocol (`vsn=1.0.0`, JSON objects)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub join_ref: Option<String>,
}

enum Command {
    Join(String),
    Leave { topic: String, join_ref: Option<String> },
    Push { topic: String, event: String, payload: Value },
}

struct Listener {
    id: ListenerId,
    filter: ListenFilter,
    callback: EventCallback,
}

struct ChannelShared {
    name: String,
    topic: String,
    listeners: Mutex<Vec<Listener>>,
    status: Mutex<Option<StatusCallback>>,
    /// Ref of the join sent on the current socket
    join_ref: Mutex<Option<String>>,
    joined: AtomicBool,
    closed: AtomicBool,
    next_listener: AtomicU64,
}

impl ChannelShared {
    fn notify(&self, status: ChannelStatus) {
        let callback = lock(&self.status).clone();
        if let Some(callback) = callback {
            callback(status);
        }
    }

    fn dispatch(&self, event: &RealtimeEvent) {
        let callbacks: Vec<EventCallback> = lock(&self.listeners)
            .iter()
            .filter(|l| l.filter.accepts(event))
            .map(|l| l.callback.clone())
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }

    /// `postgres_changes` bindings requested by the listeners, deduplicated
    fn change_bindings(&self) -> Vec<Value> {
        let mut bindings: Vec<Value> = Vec::new();
        for listener in lock(&self.listeners).iter() {
            let filter = &listener.filter;
            if filter.event == EventFilter::Presence {
                continue;
            }
            let mut binding = json!({
                "event": filter.event.as_str(),
                "schema": filter.schema,
                "table": filter.table,
            });
            if let Some(row_filter) = &filter.filter {
                binding["filter"] = Value::String(row_filter.clone());
            }
            if !bindings.contains(&binding) {
                bindings.push(binding);
            }
        }
        bindings
    }
}

struct ProviderShared {
    endpoint: String,
    access_token: String,
    heartbeat: Duration,
    channels: Mutex<HashMap<String, Arc<ChannelShared>>>,
    commands: mpsc::UnboundedSender<Command>,
    next_ref: AtomicU64,
}

impl ProviderShared {
    fn next_ref(&self) -> String {
        (self.next_ref.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    fn channel_for(&self, topic: &str) -> Option<Arc<ChannelShared>> {
        lock(&self.channels).get(topic).cloned()
    }

    fn is_idle(&self) -> bool {
        lock(&self.channels).is_empty()
    }

    fn join_payload(&self, channel: &ChannelShared) -> Value {
        json!({
            "config": {
                "broadcast": {"self": false},
                "presence": {"key": ""},
                "postgres_changes": channel.change_bindings(),
            },
            "access_token": self.access_token,
        })
    }

    /// Join frame for `topic`, unless it was already sent on this socket
    fn join_message(&self, topic: &str) -> Option<PhoenixMessage> {
        let channel = self.channel_for(topic)?;
        let mut join_ref = lock(&channel.join_ref);
        if join_ref.is_some() {
            return None;
        }
        let reference = self.next_ref();
        *join_ref = Some(reference.clone());
        Some(PhoenixMessage {
            topic: topic.to_string(),
            event: "phx_join".to_string(),
            payload: self.join_payload(&channel),
            reference: Some(reference.clone()),
            join_ref: Some(reference),
        })
    }

    fn heartbeat_message(&self) -> PhoenixMessage {
        PhoenixMessage {
            topic: PHOENIX_TOPIC.to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            reference: Some(self.next_ref()),
            join_ref: None,
        }
    }

    fn push_message(&self, topic: String, event: String, payload: Value) -> Option<PhoenixMessage> {
        let channel = self.channel_for(&topic)?;
        let join_ref = lock(&channel.join_ref).clone()?;
        Some(PhoenixMessage {
            topic,
            event,
            payload,
            reference: Some(self.next_ref()),
            join_ref: Some(join_ref),
        })
    }

    /// Report a socket failure to every channel and forget them
    fn fail_all(&self, reason: &str) {
        let channels: Vec<Arc<ChannelShared>> =
            lock(&self.channels).drain().map(|(_, channel)| channel).collect();
        for channel in channels {
            *lock(&channel.join_ref) = None;
            channel.joined.store(false, Ordering::SeqCst);
            channel.notify(ChannelStatus::ChannelError(reason.to_string()));
        }
    }

    fn handle_text(&self, text: &str) {
        match serde_json::from_str::<PhoenixMessage>(text) {
            Ok(message) => self.handle_message(message),
            Err(e) => tracing::warn!("Ignoring malformed realtime frame: {}", e),
        }
    }

    fn handle_message(&self, message: PhoenixMessage) {
        if message.topic == PHOENIX_TOPIC {
            return;
        }
        let Some(channel) = self.channel_for(&message.topic) else {
            tracing::debug!("Frame for unknown topic {}", message.topic);
            return;
        };

        match message.event.as_str() {
            "phx_reply" => {
                let is_join_reply = message.reference.is_some()
                    && message.reference == *lock(&channel.join_ref);
                if !is_join_reply {
                    return;
                }
                let status = message.payload.get("status").and_then(Value::as_str);
                if status == Some("ok") {
                    channel.joined.store(true, Ordering::SeqCst);
                    channel.notify(ChannelStatus::Subscribed);
                } else {
                    let reason = message
                        .payload
                        .pointer("/response/reason")
                        .and_then(Value::as_str)
                        .unwrap_or("join refused");
                    channel.notify(ChannelStatus::ChannelError(reason.to_string()));
                }
            }
            "system" => {
                if message.payload.get("status").and_then(Value::as_str) == Some("error") {
                    let reason = message
                        .payload
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("realtime system error");
                    channel.notify(ChannelStatus::ChannelError(reason.to_string()));
                }
            }
            "phx_error" => channel.notify(ChannelStatus::ChannelError("channel crashed".to_string())),
            "phx_close" => {
                channel.joined.store(false, Ordering::SeqCst);
                channel.notify(ChannelStatus::Closed);
            }
            "postgres_changes" => match ChangeEvent::from_postgres_changes(&message.payload) {
                Ok(change) => channel.dispatch(&change.into()),
                Err(e) => tracing::warn!("Dropping change on {}: {}", channel.name, e),
            },
            "presence_state" => match PresenceEvent::from_presence_state(&message.payload) {
                Ok(sync) => channel.dispatch(&sync.into()),
                Err(e) => tracing::warn!("Dropping presence state on {}: {}", channel.name, e),
            },
            "presence_diff" => match PresenceEvent::from_presence_diff(&message.payload) {
                Ok(events) => {
                    for event in events {
                        channel.dispatch(&event.into());
                    }
                }
                Err(e) => tracing::warn!("Dropping presence diff on {}: {}", channel.name, e),
            },
            other => tracing::debug!("Unhandled event {} on {}", other, channel.name),
        }
    }
}

/// Handle returned by [`WebSocketProvider::channel`]
pub struct WebSocketChannel {
    shared: Arc<ChannelShared>,
    provider: Arc<ProviderShared>,
}

impl ChannelHandle for WebSocketChannel {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn on(&self, filter: ListenFilter, callback: EventCallback) -> ListenerId {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.listeners).push(Listener {
            id,
            filter,
            callback,
        });
        id
    }

    fn off(&self, listener: ListenerId) {
        lock(&self.shared.listeners).retain(|l| l.id != listener);
    }

    fn subscribe(&self, on_status: StatusCallback) {
        *lock(&self.shared.status) = Some(on_status);
        if self.shared.closed.load(Ordering::SeqCst) {
            return;
        }
        lock(&self.provider.channels).insert(self.shared.topic.clone(), self.shared.clone());
        if self
            .provider
            .commands
            .send(Command::Join(self.shared.topic.clone()))
            .is_err()
        {
            self.shared
                .notify(ChannelStatus::ChannelError("realtime connection task stopped".to_string()));
        }
    }

    fn unsubscribe(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut channels = lock(&self.provider.channels);
            if channels
                .get(&self.shared.topic)
                .map_or(false, |current| Arc::ptr_eq(current, &self.shared))
            {
                channels.remove(&self.shared.topic);
            }
        }
        let join_ref = lock(&self.shared.join_ref).take();
        self.shared.joined.store(false, Ordering::SeqCst);
        let _ = self.provider.commands.send(Command::Leave {
            topic: self.shared.topic.clone(),
            join_ref,
        });
        self.shared.notify(ChannelStatus::Closed);
    }

    fn track(&self, payload: Value) -> AppResult<()> {
        if !self.shared.joined.load(Ordering::SeqCst) {
            return Err(AppError::Connection(format!(
                "channel {} is not joined",
                self.shared.name
            )));
        }
        self.provider
            .commands
            .send(Command::Push {
                topic: self.shared.topic.clone(),
                event: "presence".to_string(),
                payload: json!({"type": "presence", "event": "track", "payload": payload}),
            })
            .map_err(|_| AppError::Connection("realtime connection task stopped".to_string()))
    }
}

/// Realtime provider speaking the Phoenix channel protocol
#[derive(Clone)]
pub struct WebSocketProvider {
    shared: Arc<ProviderShared>,
}

impl WebSocketProvider {
    /// Create the provider and start its connection task. Must be called from
    /// within a tokio runtime.
    pub fn new(config: &RealtimeConfig) -> AppResult<Self> {
        let endpoint = websocket_endpoint(&config.url, &config.api_key)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AppError::Internal(format!("realtime provider needs a runtime: {}", e)))?;

        let (commands, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(ProviderShared {
            endpoint,
            access_token: config.api_key.clone(),
            heartbeat: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            channels: Mutex::new(HashMap::new()),
            commands,
            next_ref: AtomicU64::new(0),
        });

        runtime.spawn(run(shared.clone(), receiver));
        Ok(Self { shared })
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }
}

impl RealtimeProvider for WebSocketProvider {
    fn channel(&self, name: &str) -> Arc<dyn ChannelHandle> {
        Arc::new(WebSocketChannel {
            shared: Arc::new(ChannelShared {
                name: name.to_string(),
                topic: format!("realtime:{}", name),
                listeners: Mutex::new(Vec::new()),
                status: Mutex::new(None),
                join_ref: Mutex::new(None),
                joined: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                next_listener: AtomicU64::new(0),
            }),
            provider: self.shared.clone(),
        })
    }
}

/// Build the websocket URL from the service base URL
pub fn websocket_endpoint(url: &str, api_key: &str) -> AppResult<String> {
    let url = url.trim().trim_end_matches('/');
    let base = if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        return Err(AppError::BadRequest(format!(
            "realtime url must be http(s) or ws(s): '{}'",
            url
        )));
    };

    let path = if base.ends_with("/websocket") {
        String::new()
    } else {
        "/realtime/v1/websocket".to_string()
    };
    Ok(format!("{}{}?apikey={}&vsn=1.0.0", base, path, api_key))
}

async fn send<S>(write: &mut S, message: &PhoenixMessage) -> Result<(), String>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(message).map_err(|e| e.to_string())?;
    write
        .send(WsMessage::Text(text.into()))
        .await
        .map_err(|e| format!("failed to send {}: {}", message.event, e))
}

/// Connection task: idle until a channel joins, then run a socket session
async fn run(shared: Arc<ProviderShared>, mut commands: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        // no socket: leaves and pushes have nothing to act on
        let Command::Join(topic) = command else {
            continue;
        };
        if shared.channel_for(&topic).is_none() {
            continue;
        }

        tracing::info!("Connecting to realtime service");
        match connect_async(shared.endpoint.as_str()).await {
            Ok((socket, _)) => {
                tracing::info!("Realtime socket open");
                match session(&shared, socket, &mut commands).await {
                    Ok(()) => tracing::info!("Realtime socket closed, no channels left"),
                    Err(reason) => {
                        tracing::warn!("{}", AppError::Connection(reason.clone()));
                        shared.fail_all(&reason);
                    }
                }
            }
            Err(e) => {
                let reason = format!("failed to open realtime socket: {}", e);
                tracing::warn!("{}", AppError::Connection(reason.clone()));
                shared.fail_all(&reason);
            }
        }
    }
    tracing::debug!("Realtime connection task stopped");
}

async fn session(
    shared: &ProviderShared,
    socket: Socket,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> Result<(), String> {
    let (mut write, mut read) = socket.split();

    let topics: Vec<String> = lock(&shared.channels).keys().cloned().collect();
    for topic in topics {
        if let Some(join) = shared.join_message(&topic) {
            send(&mut write, &join).await?;
        }
    }

    let start = tokio::time::Instant::now() + shared.heartbeat;
    let mut heartbeat = tokio::time::interval_at(start, shared.heartbeat);

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    let _ = write.close().await;
                    return Ok(());
                };
                match command {
                    Command::Join(topic) => {
                        if let Some(join) = shared.join_message(&topic) {
                            send(&mut write, &join).await?;
                        }
                    }
                    Command::Leave { topic, join_ref } => {
                        let leave = PhoenixMessage {
                            topic,
                            event: "phx_leave".to_string(),
                            payload: json!({}),
                            reference: Some(shared.next_ref()),
                            join_ref,
                        };
                        send(&mut write, &leave).await?;
                        if shared.is_idle() {
                            let _ = write.close().await;
                            return Ok(());
                        }
                    }
                    Command::Push { topic, event, payload } => {
                        if let Some(push) = shared.push_message(topic, event, payload) {
                            send(&mut write, &push).await?;
                        }
                    }
                }
            }

            _ = heartbeat.tick() => {
                send(&mut write, &shared.heartbeat_message()).await?;
            }

            message = read.next() => {
                match message {
                    Some(Ok(WsMessage::Text(text))) => shared.handle_text(text.as_str()),
                    Some(Ok(WsMessage::Close(frame))) => {
                        return Err(format!("realtime socket closed by server: {:?}", frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(format!("realtime socket error: {}", e)),
                    None => return Err("realtime socket ended".to_string()),
                }
            }
        }
    }
}
