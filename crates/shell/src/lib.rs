//! Device-communication core of the aquamon water-quality monitor.
//!
//! Sensor readings arrive over MQTT, are parsed and recorded into a bounded
//! history, and are handed to the presentation layer through a queue.
//! User commands (aerator switch, dissolved-oxygen thresholds, pause and
//! resume) are validated and published with at-least-once delivery.

pub mod client;
mod clock;
pub mod codec;
pub mod config;
pub mod display;
pub mod error;
pub mod history;
pub mod presentation;
pub mod publisher;
pub mod router;
pub mod transport;

pub use client::{MonitorClient, StatusHandler};
pub use codec::{SensorField, SensorReading, SwitchState};
pub use config::MonitorConfig;
pub use error::{ConnectError, ParseError, PublishError};
pub use history::{HistoryBuffer, HistoryRecord};
pub use transport::ConnectionState;
