use parking_lot::Mutex;
use std::sync::Arc;

use crate::clock;
use crate::codec::{self, SensorReading};
use crate::display::{SensorPanel, INVALID_MARKER};
use crate::history::{HistoryBuffer, HistoryRecord};
use crate::presentation::PresentationQueue;
use crate::transport::InboundSink;

/// UI-facing handler for parsed readings. Always run on the presentation
/// loop, never on the network task.
pub type ReadingHandler = Arc<dyn Fn(SensorReading) + Send + Sync>;

struct Route {
    pattern: String,
    handler: ReadingHandler,
}

/// Routes inbound sensor messages: every parsed reading goes into the
/// history buffer, then to the handler registered for a matching pattern.
///
/// Handlers are a single slot per pattern. Registering again for the same
/// pattern replaces the previous handler; it does not add a second one.
pub struct Router {
    sensor_topic: String,
    routes: Mutex<Vec<Route>>,
    panel: Mutex<SensorPanel>,
    history: Arc<HistoryBuffer>,
    queue: PresentationQueue,
}

impl Router {
    pub fn new(
        sensor_topic: impl Into<String>,
        history: Arc<HistoryBuffer>,
        queue: PresentationQueue,
    ) -> Self {
        Self {
            sensor_topic: sensor_topic.into(),
            routes: Mutex::new(Vec::new()),
            panel: Mutex::new(SensorPanel::default()),
            history,
            queue,
        }
    }

    pub fn sensor_topic(&self) -> &str {
        &self.sensor_topic
    }

    /// Install `handler` for `topic_pattern`, replacing any previous one.
    /// Returns `true` if a handler was replaced.
    pub fn register_handler(&self, topic_pattern: &str, handler: ReadingHandler) -> bool {
        let mut routes = self.routes.lock();
        if let Some(route) = routes.iter_mut().find(|r| r.pattern == topic_pattern) {
            route.handler = handler;
            tracing::debug!(pattern = topic_pattern, "reading handler replaced");
            return true;
        }
        routes.push(Route {
            pattern: topic_pattern.to_string(),
            handler,
        });
        false
    }

    /// Shorthand for registering on the sensor data topic.
    pub fn on_parsed_data(&self, handler: ReadingHandler) -> bool {
        let topic = self.sensor_topic.clone();
        self.register_handler(&topic, handler)
    }

    pub fn clear_handler(&self, topic_pattern: &str) -> bool {
        let mut routes = self.routes.lock();
        let before = routes.len();
        routes.retain(|r| r.pattern != topic_pattern);
        routes.len() != before
    }

    pub fn panel(&self) -> SensorPanel {
        self.panel.lock().clone()
    }

    fn accepts(&self, topic: &str) -> bool {
        topic_matches(&self.sensor_topic, topic)
            || self
                .routes
                .lock()
                .iter()
                .any(|r| topic_matches(&r.pattern, topic))
    }

    /// Decode one inbound message and dispatch it. A payload that cannot be
    /// decoded at all is recorded as an error line; nothing here is fatal.
    pub fn route(&self, topic: &str, payload: &[u8]) {
        if !self.accepts(topic) {
            tracing::debug!(topic, "unhandled topic");
            return;
        }

        match codec::parse_inbound(topic, payload) {
            Ok(reading) => {
                if !reading.rejected.is_empty() {
                    tracing::warn!(topic, rejected = ?reading.rejected, "dropped non-numeric fields");
                }
                self.dispatch(topic, reading);
            }
            Err(e) => {
                tracing::warn!(topic, "bad sensor payload: {e}");
                let at = clock::now();
                let text = format!("{}: {INVALID_MARKER} ({e})", clock::format_seconds(at));
                self.history.append(HistoryRecord::new(text, at));
            }
        }
    }

    /// Record the reading into history (always), then hand it to every
    /// matching UI handler via the presentation queue (if any).
    pub fn dispatch(&self, topic: &str, reading: SensorReading) {
        let line = {
            let mut panel = self.panel.lock();
            panel.apply(&reading);
            panel.history_line(reading.received_at)
        };
        self.history
            .append(HistoryRecord::new(line, reading.received_at));

        let handlers: Vec<ReadingHandler> = self
            .routes
            .lock()
            .iter()
            .filter(|r| topic_matches(&r.pattern, topic))
            .map(|r| Arc::clone(&r.handler))
            .collect();

        if handlers.is_empty() {
            tracing::trace!(topic, "no ui handler registered");
            return;
        }
        for handler in handlers {
            let reading = reading.clone();
            self.queue.post(move || handler(reading));
        }
    }
}

impl InboundSink for Router {
    fn deliver(&self, topic: &str, payload: &[u8]) {
        self.route(topic, payload);
    }
}

// ---------------------------------------------------------------------------
// Topic filters
// ---------------------------------------------------------------------------

/// MQTT topic filter match: `+` matches one level, a trailing `#` matches
/// the rest (including the parent level itself).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for part in filter.split('/') {
        match part {
            "#" => return true,
            "+" => {
                if levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    levels.next().is_none()
}

/// Syntactic check of a subscription filter.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let parts: Vec<&str> = filter.split('/').collect();
    parts.iter().enumerate().all(|(i, part)| match *part {
        "#" => i == parts.len() - 1,
        "+" => true,
        other => !other.contains('#') && !other.contains('+'),
    })
}

// ===========================================================================
// Tests
// ===========================================================================
