//! Connection state machine for one subscription key
//!
//! State changes go through [`ConnectionState::next`]. Provider callbacks
//! carry the generation that was current when the channel was opened; any
//! callback from an older generation (a channel torn down by `disconnect()`
//! or by a reconnect) is ignored.

use chrono::Utc;
use serde_json::Value;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    error::{AppError, AppResult},
    models::{
        ConnectionSignal, ConnectionState, ConnectionStatus, RealtimeEvent, ResourceDescriptor,
        SubscriptionKey,
    },
    realtime::{
        ChannelHandle, ChannelStatus, EventCallback, ListenFilter, ListenerId, RealtimeProvider,
        StatusCallback,
    },
    repository::{lock, ChannelRegistry},
};

/// Reconnect behaviour after provider failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub auto_reconnect: bool,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Automatic reconnects allowed before giving up
    pub max_attempts: u32,
    /// Pause between disconnect and connect on a manual reconnect
    pub manual_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            manual_delay: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, max)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Hooks invoked on state changes and incoming events
#[derive(Clone)]
pub struct ConnectionCallbacks {
    pub on_event: EventCallback,
    pub on_connect: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_disconnect: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl ConnectionCallbacks {
    pub fn new(on_event: EventCallback) -> Self {
        Self {
            on_event,
            on_connect: None,
            on_disconnect: None,
            on_error: None,
        }
    }
}

struct ActiveChannel {
    handle: Arc<dyn ChannelHandle>,
    /// Whether this machine opened the channel (and so must close it)
    owned: bool,
    listener: ListenerId,
}

#[derive(Default)]
struct MachineState {
    state: ConnectionState,
    attempts: u32,
    generation: u64,
    channel: Option<ActiveChannel>,
    timer: Option<JoinHandle<()>>,
    pending_delay: Option<Duration>,
    error: Option<String>,
    last_update: Option<chrono::DateTime<Utc>>,
}

impl MachineState {
    fn snapshot(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            error: self.error.clone(),
            last_update: self.last_update,
            attempts: self.attempts,
        }
    }

    /// Leave the current generation: callbacks from the old channel become stale
    fn retire_channel(&mut self) -> Option<ActiveChannel> {
        self.generation += 1;
        self.channel.take()
    }
}

struct MachineInner {
    descriptor: ResourceDescriptor,
    key: SubscriptionKey,
    provider: Arc<dyn RealtimeProvider>,
    registry: Arc<ChannelRegistry>,
    policy: ReconnectPolicy,
    callbacks: ConnectionCallbacks,
    state: Mutex<MachineState>,
    status: watch::Sender<ConnectionStatus>,
}

impl Drop for MachineInner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}

/// One instance per subscription key; cheap to clone
#[derive(Clone)]
pub struct ConnectionStateMachine {
    inner: Arc<MachineInner>,
}

impl ConnectionStateMachine {
    pub fn new(
        descriptor: ResourceDescriptor,
        provider: Arc<dyn RealtimeProvider>,
        registry: Arc<ChannelRegistry>,
        policy: ReconnectPolicy,
        callbacks: ConnectionCallbacks,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        Self {
            inner: Arc::new(MachineInner {
                key: descriptor.key(),
                descriptor,
                provider,
                registry,
                policy,
                callbacks,
                state: Mutex::new(MachineState::default()),
                status,
            }),
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.inner.key
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.state).state
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.inner.state).snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Delay of the automatic reconnect currently scheduled, if any
    pub fn pending_reconnect(&self) -> Option<Duration> {
        lock(&self.inner.state).pending_delay
    }

    fn auto_reconnect(&self) -> bool {
        self.inner.policy.auto_reconnect && self.inner.descriptor.auto_reconnect
    }

    fn publish(&self, state: &MachineState) {
        self.inner.status.send_replace(state.snapshot());
    }

    /// Open (or reuse) the channel for this key.
    ///
    /// The Connecting state is entered synchronously before anything else, so
    /// a second call arriving before the provider answers is a no-op.
    pub fn connect(&self) {
        let (generation, failed) = {
            let mut st = lock(&self.inner.state);
            let Some(next) = st.state.next(ConnectionSignal::Connect) else {
                tracing::debug!("Connect on {} ignored: already {}", self.inner.key, st.state);
                return;
            };
            st.state = next;
            // coming from Error the failed channel is still held and registered
            let failed = st.retire_channel();
            st.pending_delay = None;
            if let Some(timer) = st.timer.take() {
                timer.abort();
            }
            self.publish(&st);
            (st.generation, failed)
        };

        self.release(failed);
        self.open_channel(generation);
    }

    fn open_channel(&self, generation: u64) {
        let inner = &self.inner;
        let filter = ListenFilter::from(&inner.descriptor);

        if let Some(handle) = inner.registry.acquire(&inner.key) {
            self.reuse(generation, handle, filter);
            return;
        }

        let handle = inner.provider.channel(inner.key.as_str());
        let listener = handle.on(filter.clone(), self.event_sink(generation));
        if !inner.registry.register(inner.key.clone(), handle.clone()) {
            // another machine registered this key first
            handle.off(listener);
            handle.unsubscribe();
            match inner.registry.acquire(&inner.key) {
                Some(existing) => self.reuse(generation, existing, filter),
                None => self.on_failure(generation, "channel registration refused".to_string()),
            }
            return;
        }

        if !self.attach(generation, handle.clone(), true, listener) {
            handle.off(listener);
            inner.registry.release_if(&inner.key, &handle);
            handle.unsubscribe();
            return;
        }

        tracing::info!("Opening channel {}", inner.key);
        handle.subscribe(self.status_sink(generation));
    }

    /// Listen on a handle opened by someone else; it is never ours to close
    fn reuse(&self, generation: u64, handle: Arc<dyn ChannelHandle>, filter: ListenFilter) {
        tracing::debug!("Reusing registered channel {}", self.inner.key);
        let listener = handle.on(filter, self.event_sink(generation));
        if !self.attach(generation, handle.clone(), false, listener) {
            handle.off(listener);
            return;
        }
        self.on_subscribed(generation);
    }

    /// Store the channel unless the machine moved on while it was being opened
    fn attach(&self, generation: u64, handle: Arc<dyn ChannelHandle>, owned: bool, listener: ListenerId) -> bool {
        let mut st = lock(&self.inner.state);
        if st.generation != generation {
            return false;
        }
        st.channel = Some(ActiveChannel {
            handle,
            owned,
            listener,
        });
        true
    }

    fn event_sink(&self, generation: u64) -> EventCallback {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |event: &RealtimeEvent| {
            if let Some(inner) = weak.upgrade() {
                ConnectionStateMachine { inner }.on_event(generation, event);
            }
        })
    }

    fn status_sink(&self, generation: u64) -> StatusCallback {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |status: ChannelStatus| {
            if let Some(inner) = weak.upgrade() {
                ConnectionStateMachine { inner }.on_status(generation, status);
            }
        })
    }

    fn on_event(&self, generation: u64, event: &RealtimeEvent) {
        {
            let mut st = lock(&self.inner.state);
            if st.generation != generation {
                return;
            }
            st.last_update = Some(Utc::now());
            self.publish(&st);
        }
        (self.inner.callbacks.on_event)(event);
    }

    fn on_status(&self, generation: u64, status: ChannelStatus) {
        match status {
            ChannelStatus::Subscribed => self.on_subscribed(generation),
            ChannelStatus::ChannelError(message) => self.on_failure(generation, message),
            ChannelStatus::TimedOut => self.on_failure(generation, "subscription timed out".to_string()),
            ChannelStatus::Closed => self.on_closed(generation),
        }
    }

    fn on_subscribed(&self, generation: u64) {
        {
            let mut st = lock(&self.inner.state);
            if st.generation != generation {
                return;
            }
            let Some(next) = st.state.next(ConnectionSignal::Subscribed) else {
                return;
            };
            st.state = next;
            st.attempts = 0;
            st.error = None;
            st.last_update = Some(Utc::now());
            self.publish(&st);
        }

        tracing::info!("Channel {} connected", self.inner.key);
        if let Some(on_connect) = &self.inner.callbacks.on_connect {
            on_connect();
        }
    }

    fn on_failure(&self, generation: u64, message: String) {
        let (retry, attempt) = {
            let mut st = lock(&self.inner.state);
            if st.generation != generation {
                return;
            }
            let Some(next) = st.state.next(ConnectionSignal::Failed) else {
                return;
            };
            st.state = next;
            st.error = Some(message.clone());
            if st.pending_delay.is_some() {
                // a retry is already scheduled for this failure
                self.publish(&st);
                return;
            }

            let retry = if self.auto_reconnect() && st.attempts < self.inner.policy.max_attempts {
                let delay = self.inner.policy.delay_for(st.attempts);
                st.attempts += 1;
                st.pending_delay = Some(delay);
                Some(delay)
            } else {
                st.pending_delay = None;
                None
            };
            self.publish(&st);
            (retry, st.attempts)
        };

        tracing::warn!("{}", AppError::Connection(format!("{}: {}", self.inner.key, message)));
        if let Some(on_error) = &self.inner.callbacks.on_error {
            on_error(&message);
        }

        match retry {
            Some(delay) => {
                tracing::info!(
                    "Reconnecting {} in {:?} (attempt {}/{})",
                    self.inner.key,
                    delay,
                    attempt,
                    self.inner.policy.max_attempts
                );
                self.schedule(generation, delay, Self::fire_auto_reconnect);
            }
            None if self.auto_reconnect() => tracing::warn!(
                "Giving up on {} after {} reconnect attempts",
                self.inner.key,
                attempt
            ),
            None => {}
        }
    }

    fn on_closed(&self, generation: u64) {
        let channel = {
            let mut st = lock(&self.inner.state);
            if st.generation != generation {
                return;
            }
            let Some(next) = st.state.next(ConnectionSignal::Closed) else {
                return;
            };
            st.state = next;
            st.pending_delay = None;
            let channel = st.retire_channel();
            self.publish(&st);
            channel
        };

        // closed by the remote side: nothing left to unsubscribe
        if let Some(channel) = channel {
            channel.handle.off(channel.listener);
            if channel.owned {
                self.inner.registry.release_if(&self.inner.key, &channel.handle);
            }
        }

        tracing::info!("Channel {} closed", self.inner.key);
        if let Some(on_disconnect) = &self.inner.callbacks.on_disconnect {
            on_disconnect();
        }
    }

    /// Run `fire` after `delay` unless the generation changes first
    fn schedule(&self, generation: u64, delay: Duration, fire: fn(&ConnectionStateMachine, u64)) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime available to reconnect {}", self.inner.key);
            return;
        };

        let deadline = tokio::time::Instant::now() + delay;
        let weak: Weak<MachineInner> = Arc::downgrade(&self.inner);
        let task = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                fire(&ConnectionStateMachine { inner }, generation);
            }
        });

        let mut st = lock(&self.inner.state);
        if st.generation == generation {
            if let Some(previous) = st.timer.replace(task) {
                previous.abort();
            }
        } else {
            task.abort();
        }
    }

    fn fire_auto_reconnect(&self, generation: u64) {
        let channel = {
            let mut st = lock(&self.inner.state);
            if st.generation != generation || st.state != ConnectionState::Error {
                return;
            }
            st.timer = None;
            st.pending_delay = None;
            st.retire_channel()
        };
        self.release(channel);
        self.connect();
    }

    fn fire_manual_reconnect(&self, generation: u64) {
        {
            let mut st = lock(&self.inner.state);
            if st.generation != generation {
                return;
            }
            st.timer = None;
        }
        self.connect();
    }

    fn release(&self, channel: Option<ActiveChannel>) {
        let Some(channel) = channel else {
            return;
        };
        channel.handle.off(channel.listener);
        if channel.owned {
            self.inner.registry.release_if(&self.inner.key, &channel.handle);
            channel.handle.unsubscribe();
        }
    }

    /// Close the channel and cancel any scheduled reconnect. Idempotent.
    pub fn disconnect(&self) {
        let (channel, timer, was) = {
            let mut st = lock(&self.inner.state);
            let was = st.state;
            if let Some(next) = st.state.next(ConnectionSignal::Disconnect) {
                st.state = next;
            }
            st.pending_delay = None;
            let channel = st.retire_channel();
            let timer = st.timer.take();
            self.publish(&st);
            (channel, timer, was)
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        self.release(channel);

        if was != ConnectionState::Disconnected {
            tracing::info!("Channel {} disconnected", self.inner.key);
            if let Some(on_disconnect) = &self.inner.callbacks.on_disconnect {
                on_disconnect();
            }
        }
    }

    /// Disconnect, then connect again after the manual delay with a fresh
    /// retry budget
    pub fn reconnect(&self) {
        self.disconnect();
        let generation = {
            let mut st = lock(&self.inner.state);
            st.attempts = 0;
            st.error = None;
            self.publish(&st);
            st.generation
        };

        if tokio::runtime::Handle::try_current().is_err() {
            self.connect();
            return;
        }
        self.schedule(generation, self.inner.policy.manual_delay, Self::fire_manual_reconnect);
    }

    /// Publish a presence payload on the current channel
    pub fn track(&self, payload: Value) -> AppResult<()> {
        let handle = {
            let st = lock(&self.inner.state);
            match (&st.channel, st.state) {
                (Some(channel), ConnectionState::Connected) => channel.handle.clone(),
                _ => {
                    return Err(AppError::Connection(format!(
                        "{} is not connected",
                        self.inner.key
                    )))
                }
            }
        };
        handle.track(payload)
    }
}
