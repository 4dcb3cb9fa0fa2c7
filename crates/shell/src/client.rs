//! The collaborator-facing monitor client: wires the transport, router,
//! history buffers and publisher together in a fixed order and keeps the
//! activity log of connection and command notices.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

use crate::codec::{SensorReading, SwitchState};
use crate::config::MonitorConfig;
use crate::display::SensorPanel;
use crate::error::PublishError;
use crate::history::HistoryBuffer;
use crate::presentation::{PresentationLoop, PresentationQueue};
use crate::publisher::CommandPublisher;
use crate::router::Router;
use crate::transport::{ConnectionState, StatusSink, Transport};

/// UI-facing connection status handler, run on the presentation loop.
pub type StatusHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

// ---------------------------------------------------------------------------
// Status relay
// ---------------------------------------------------------------------------

/// Turns transport state changes into activity notices and forwards them to
/// the single registered status handler.
struct StatusRelay {
    activity: Arc<HistoryBuffer>,
    queue: PresentationQueue,
    handler: Mutex<Option<StatusHandler>>,
    last: Mutex<ConnectionState>,
}

impl StatusRelay {
    fn notice(previous: &ConnectionState, next: &ConnectionState) -> Option<String> {
        match (previous, next) {
            (_, ConnectionState::Connecting) => None,
            (ConnectionState::Connected, ConnectionState::Connected) => None,
            (_, ConnectionState::Connected) => Some("MQTT连接成功".to_string()),
            (ConnectionState::Connected, ConnectionState::Failed(_)) => {
                Some("MQTT连接断开，正在重连…".to_string())
            }
            // one line per distinct failure, not one per retry
            (ConnectionState::Failed(before), ConnectionState::Failed(reason))
                if before == reason =>
            {
                None
            }
            (_, ConnectionState::Failed(reason)) => Some(format!("MQTT连接失败: {reason}")),
            (ConnectionState::Disconnected, ConnectionState::Disconnected) => None,
            (_, ConnectionState::Disconnected) => Some("MQTT连接已关闭".to_string()),
        }
    }
}

impl StatusSink for StatusRelay {
    fn status_changed(&self, state: &ConnectionState) {
        let notice = {
            let mut last = self.last.lock();
            let notice = Self::notice(&last, state);
            if *state != ConnectionState::Connecting {
                *last = state.clone();
            }
            notice
        };
        if let Some(text) = notice {
            self.activity.push(text);
        }

        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            let state = state.clone();
            self.queue.post(move || handler(state));
        }
    }
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

pub struct MonitorClient {
    config: MonitorConfig,
    history: Arc<HistoryBuffer>,
    activity: Arc<HistoryBuffer>,
    router: Arc<Router>,
    status: Arc<StatusRelay>,
    transport: Arc<Transport>,
    publisher: CommandPublisher,
}

impl MonitorClient {
    /// Build every component. Nothing touches the network until
    /// [`start`](Self::start). The returned loop must be driven by the
    /// presentation layer for UI callbacks to run.
    pub fn new(config: MonitorConfig) -> (Self, PresentationLoop) {
        let history = Arc::new(HistoryBuffer::new());
        let activity = Arc::new(HistoryBuffer::new());
        let (queue, ui) = PresentationQueue::channel();

        let router = Arc::new(Router::new(
            config.topics.sensor.clone(),
            Arc::clone(&history),
            queue.clone(),
        ));
        let status = Arc::new(StatusRelay {
            activity: Arc::clone(&activity),
            queue,
            handler: Mutex::new(None),
            last: Mutex::new(ConnectionState::Disconnected),
        });
        let transport = Arc::new(Transport::new(
            router.clone(),
            status.clone(),
            config.transport_options(),
        ));
        let publisher = CommandPublisher::new(Arc::clone(&transport), config.publish_timeout());

        let client = Self {
            config,
            history,
            activity,
            router,
            status,
            transport,
            publisher,
        };
        (client, ui)
    }

    /// Subscribe the sensor data topic and connect. Returns the first
    /// connection outcome; retries continue in the background on failure.
    pub async fn start(&self) -> ConnectionState {
        info!(broker = ?self.config.broker, topic = %self.config.topics.sensor, "starting monitor");
        self.transport.subscribe(&self.config.topics.sensor).await;
        self.transport.connect(&self.config.broker).await
    }

    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }

    /// Replace the parsed-data handler. Returns `true` if one was replaced.
    pub fn on_parsed_data<F>(&self, handler: F) -> bool
    where
        F: Fn(SensorReading) + Send + Sync + 'static,
    {
        self.router.on_parsed_data(Arc::new(handler))
    }

    /// Replace the connection status handler. Returns `true` if one was
    /// replaced.
    pub fn on_status_change<F>(&self, handler: F) -> bool
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.status.handler.lock().replace(Arc::new(handler)).is_some()
    }

    pub async fn publish_switch(&self, state: &str) -> Result<(), PublishError> {
        let result = self.publisher.publish_switch(state).await;
        let text = match (&result, state.parse::<SwitchState>()) {
            (Ok(()), Ok(SwitchState::On)) => "设备启动成功".to_string(),
            (Ok(()), _) => "设备停止成功".to_string(),
            (Err(e), _) => format!("❌ 开关操作失败：{e}"),
        };
        self.activity.push(text);
        result
    }

    pub async fn publish_threshold(&self, max: &str, min: &str) -> Result<(), PublishError> {
        let result = self.publisher.publish_threshold(max, min).await;
        let text = match &result {
            Ok(()) => format!("✅ 阈值已发送：最高{} | 最低{}", max.trim(), min.trim()),
            Err(e) => format!("❌ 发送阈值失败：{e}"),
        };
        self.activity.push(text);
        result
    }

    pub async fn publish_control(&self, command: &str) -> Result<(), PublishError> {
        let result = self.publisher.publish_control(command).await;
        let text = match &result {
            Ok(()) => format!("✅ 指令已发送：{}", command.trim()),
            Err(PublishError::InvalidInput { .. }) => "❌ 仅支持pause/resume指令".to_string(),
            Err(e) => format!("❌ 指令发送失败：{e}"),
        };
        self.activity.push(text);
        result
    }

    /// Sensor history: one line per reading, most recent first.
    pub fn history(&self) -> &Arc<HistoryBuffer> {
        &self.history
    }

    /// Connection and command notices, most recent first.
    pub fn activity(&self) -> &Arc<HistoryBuffer> {
        &self.activity
    }

    pub fn panel(&self) -> SensorPanel {
        self.router.panel()
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }
}

// ===========================================================================
// Tests
// ===========================================================================
