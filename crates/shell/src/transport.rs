//! Broker connection manager.
//!
//! A single tokio task owns the rumqttc `EventLoop`. It delivers inbound
//! publishes in arrival order, matches publish acknowledgements to waiting
//! callers, replays subscriptions after every ConnAck, and reconnects with
//! exponential backoff until `disconnect()` cancels it. Each connection
//! attempt gets a fresh client and request channel, so nothing queued for a
//! dead connection is sent on the next one.
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──ConnAck──▶ Connected
//!      ▲                        ▲     │                  │
//!      │                        │   error              error
//!      │                        │     ▼                  │
//!      └────disconnect()─────── Failed(reason) ◀─────────┘
//!                               (backoff sleep, then Connecting)
//! ```

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerSettings;
use crate::error::{ConnectError, PublishError, TransportError};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed(ConnectError),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Short status text for the UI.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "未连接",
            Self::Connecting => "连接中",
            Self::Connected => "已连接",
            Self::Failed(_) => "连接失败",
        }
    }
}

/// Receives every inbound publish, on the network task, in arrival order.
pub trait InboundSink: Send + Sync {
    fn deliver(&self, topic: &str, payload: &[u8]);
}

/// Receives every state transition, including each reconnect attempt.
pub trait StatusSink: Send + Sync {
    fn status_changed(&self, state: &ConnectionState);
}

/// Exponential reconnect delay with equal jitter: the delay for attempt `n`
/// lies in `[c/2, c]` where `c = min(cap, base * 2^n)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.jittered(attempt, fastrand::f64())
    }

    /// `unit` is the random draw in `[0, 1]`.
    pub fn jittered(&self, attempt: u32, unit: f64) -> Duration {
        let half = self.ceiling(attempt) / 2;
        half + half.mul_f64(unit.clamp(0.0, 1.0))
    }
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub backoff: Backoff,
    /// How long `connect()` waits for the first outcome before returning.
    pub connect_timeout: Duration,
    /// Request channel size: at most this many outbound messages buffer
    /// while the event loop is busy.
    pub outbound_capacity: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            connect_timeout: Duration::from_secs(10),
            outbound_capacity: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Publish acknowledgement tracking
// ---------------------------------------------------------------------------

type AckSender = oneshot::Sender<Result<(), PublishError>>;

/// Waiters are queued in request order; the event loop emits
/// `Outgoing::Publish(pkid)` in that same order, which is when a waiter is
/// bound to its packet id.
#[derive(Default)]
struct AckTracker {
    queued: VecDeque<AckSender>,
    inflight: HashMap<u16, AckSender>,
}

impl AckTracker {
    fn enqueue(&mut self) -> oneshot::Receiver<Result<(), PublishError>> {
        let (tx, rx) = oneshot::channel();
        self.queued.push_back(tx);
        rx
    }

    fn assign(&mut self, pkid: u16) {
        match self.queued.pop_front() {
            Some(tx) => {
                self.inflight.insert(pkid, tx);
            }
            None => debug!(pkid, "outgoing publish without a waiter (retransmit)"),
        }
    }

    fn acknowledge(&mut self, pkid: u16) {
        if let Some(tx) = self.inflight.remove(&pkid) {
            // receiver may have timed out already
            let _ = tx.send(Ok(()));
        }
    }

    fn fail_all(&mut self, err: &PublishError) {
        let waiters = self
            .queued
            .drain(..)
            .chain(self.inflight.drain().map(|(_, tx)| tx));
        for tx in waiters {
            let _ = tx.send(Err(err.clone()));
        }
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.queued.len() + self.inflight.len()
    }
}

// ---------------------------------------------------------------------------
// Shared between the handle and the network task
// ---------------------------------------------------------------------------

struct Shared {
    state: watch::Sender<ConnectionState>,
    /// Request handle of the current connection attempt. Swapped under the
    /// `acks` lock.
    client: Mutex<Option<AsyncClient>>,
    status: Arc<dyn StatusSink>,
    inbound: Arc<dyn InboundSink>,
    subscriptions: Mutex<Vec<String>>,
    acks: Mutex<AckTracker>,
    backoff: Backoff,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        self.state.send_replace(next.clone());
        self.status.status_changed(&next);
    }

    fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    fn client(&self) -> Option<AsyncClient> {
        self.client.lock().clone()
    }

    fn replay_subscriptions(&self) {
        let Some(client) = self.client() else {
            return;
        };
        let topics = self.subscriptions.lock().clone();
        for topic in topics {
            match client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                Ok(()) => debug!(%topic, "subscribe requested"),
                Err(e) => warn!(%topic, "subscribe failed: {e}"),
            }
        }
    }
}

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct Transport {
    shared: Arc<Shared>,
    session: tokio::sync::Mutex<Option<Session>>,
    connect_timeout: Duration,
    outbound_capacity: usize,
}

/// How long `disconnect()` lets the event loop flush DISCONNECT.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

impl Transport {
    pub fn new(
        inbound: Arc<dyn InboundSink>,
        status: Arc<dyn StatusSink>,
        options: TransportOptions,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                state,
                client: Mutex::new(None),
                status,
                inbound,
                subscriptions: Mutex::new(Vec::new()),
                acks: Mutex::new(AckTracker::default()),
                backoff: options.backoff,
            }),
            session: tokio::sync::Mutex::new(None),
            connect_timeout: options.connect_timeout,
            outbound_capacity: options.outbound_capacity.max(1),
        }
    }

    /// Consistent snapshot of the current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.subscriptions.lock().clone()
    }

    /// Start a session and wait (bounded) for its first outcome.
    ///
    /// If a session is already running (connected or retrying) this returns
    /// the current state without opening another socket. Failures come back
    /// as `Failed(reason)` and are also reported to the status sink.
    pub async fn connect(&self, settings: &BrokerSettings) -> ConnectionState {
        let mut session = self.session.lock().await;
        if let Some(active) = session.as_ref() {
            if !active.task.is_finished() {
                let current = self.state();
                debug!(state = ?current, "connect ignored, session already running");
                return current;
            }
        }
        *session = None;

        let options = match mqtt_options(settings) {
            Ok(options) => options,
            Err(reason) => {
                warn!("mqtt connect aborted: {reason}");
                let state = ConnectionState::Failed(reason);
                self.shared.set_state(state.clone());
                return state;
            }
        };

        info!(
            host = %settings.host,
            port = settings.port,
            tls = settings.use_tls,
            auth = settings.username.is_some(),
            "connecting to mqtt broker"
        );

        let (client, eventloop) = AsyncClient::new(options.clone(), self.outbound_capacity);
        *self.shared.client.lock() = Some(client);
        self.shared.set_state(ConnectionState::Connecting);
        let mut outcome = self.shared.state.subscribe();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_session(
            Arc::clone(&self.shared),
            options,
            self.outbound_capacity,
            eventloop,
            cancel.clone(),
        ));
        *session = Some(Session { cancel, task });
        drop(session);

        let first = tokio::time::timeout(self.connect_timeout, async {
            while outcome.changed().await.is_ok() {
                let state = outcome.borrow_and_update().clone();
                if state != ConnectionState::Connecting {
                    return state;
                }
            }
            ConnectionState::Disconnected
        })
        .await;

        match first {
            Ok(state) => state,
            Err(_) => {
                warn!(
                    timeout = ?self.connect_timeout,
                    "no connection outcome yet, still retrying in background"
                );
                self.state()
            }
        }
    }

    /// Stop the session: sends DISCONNECT if connected, cancels any backoff
    /// sleep, fails in-flight publishes, and drops the socket. Safe to call
    /// when not connected.
    pub async fn disconnect(&self) {
        let taken = self.session.lock().await.take();
        if let Some(session) = taken {
            let mut task = session.task;
            let mut joined = None;
            if self.state().is_connected() {
                match self.shared.client().map(|c| c.try_disconnect()) {
                    Some(Ok(())) => {
                        // the task ends once DISCONNECT has been written
                        joined = tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.ok();
                        if joined.is_none() {
                            debug!("disconnect not flushed in time, dropping socket");
                        }
                    }
                    Some(Err(e)) => warn!("mqtt disconnect request failed: {e}"),
                    None => {}
                }
            }
            session.cancel.cancel();
            let result = match joined {
                Some(result) => result,
                None => task.await,
            };
            if let Err(e) = result {
                warn!("mqtt session task ended abnormally: {e}");
            }
        }
        self.shared
            .acks
            .lock()
            .fail_all(&PublishError::NotConnected);
        if self.state() != ConnectionState::Disconnected {
            self.shared.set_state(ConnectionState::Disconnected);
        }
    }

    /// Register interest in `topic`. Kept for the life of the transport and
    /// re-issued after every reconnect.
    pub async fn subscribe(&self, topic: &str) {
        {
            let mut subs = self.shared.subscriptions.lock();
            if subs.iter().any(|t| t == topic) {
                debug!(topic, "already subscribed");
                return;
            }
            subs.push(topic.to_string());
        }

        if !self.state().is_connected() {
            debug!(topic, "subscription deferred until connected");
            return;
        }
        if let Some(client) = self.shared.client() {
            if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                warn!(topic, "subscribe failed: {e}");
            }
        }
    }

    /// Publish at-least-once and wait for the broker's acknowledgement.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        timeout: Duration,
    ) -> Result<(), PublishError> {
        if !self.state().is_connected() {
            return Err(PublishError::NotConnected);
        }
        let ack = {
            let mut acks = self.shared.acks.lock();
            let client = self.shared.client().ok_or(PublishError::NotConnected)?;
            client
                .try_publish(topic, QoS::AtLeastOnce, false, payload)
                .map_err(|e| PublishError::TransportRejected(e.to_string()))?;
            acks.enqueue()
        };

        match tokio::time::timeout(timeout, ack).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PublishError::TransportRejected(
                "session closed before acknowledgement".to_string(),
            )),
            Err(_) => Err(PublishError::Timeout(timeout)),
        }
    }

    #[cfg(test)]
    fn pending_acks(&self) -> usize {
        self.shared.acks.lock().pending()
    }
}

fn mqtt_options(settings: &BrokerSettings) -> Result<MqttOptions, ConnectError> {
    let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
    options.set_clean_session(true);
    if let Some(user) = &settings.username {
        options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
    }
    if settings.use_tls {
        let transport = match &settings.ca_path {
            Some(path) => {
                let ca = std::fs::read(path).map_err(|e| {
                    ConnectError::TlsFailed(format!("cannot read ca file {}: {e}", path.display()))
                })?;
                rumqttc::Transport::tls(ca, None, None)
            }
            None => rumqttc::Transport::tls_with_default_config(),
        };
        options.set_transport(transport);
    }
    Ok(options)
}

// ---------------------------------------------------------------------------
// Network task
// ---------------------------------------------------------------------------

async fn run_session(
    shared: Arc<Shared>,
    options: MqttOptions,
    capacity: usize,
    mut eventloop: EventLoop,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    let mut connected = false;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(session_present = ack.session_present, "mqtt connected");
                attempt = 0;
                connected = true;
                shared.set_state(ConnectionState::Connected);
                shared.replay_subscriptions();
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                shared.inbound.deliver(&p.topic, &p.payload);
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                shared.acks.lock().acknowledge(ack.pkid);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                debug!(pkid = ack.pkid, codes = ?ack.return_codes, "subscription acknowledged");
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                shared.acks.lock().assign(pkid);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                {
                    let mut acks = shared.acks.lock();
                    acks.fail_all(&PublishError::TransportRejected(format!(
                        "connection lost: {err}"
                    )));
                    // requests still queued for this connection die with it
                    let (client, fresh) = AsyncClient::new(options.clone(), capacity);
                    *shared.client.lock() = Some(client);
                    eventloop = fresh;
                }
                let reason = ConnectError::from(&err);
                if connected {
                    connected = false;
                    warn!("{}, reconnecting", TransportError::from(err));
                } else {
                    warn!(attempt, "mqtt connect failed: {reason}");
                }
                shared.set_state(ConnectionState::Failed(reason));

                let delay = shared.backoff.delay(attempt);
                attempt = attempt.saturating_add(1);
                info!(attempt, delay_ms = delay.as_millis() as u64, "retrying mqtt connection");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                shared.set_state(ConnectionState::Connecting);
            }
        }
    }

    {
        let mut acks = shared.acks.lock();
        acks.fail_all(&PublishError::NotConnected);
        shared.client.lock().take();
    }
    drop(eventloop);
    shared.set_state(ConnectionState::Disconnected);
    info!("mqtt session closed");
}

// ===========================================================================
// Tests
// ===========================================================================
