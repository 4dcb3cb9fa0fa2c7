//! User actions to broker publishes. Input is validated and encoded before
//! the transport is touched, so a rejected command never reaches the network.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::clock;
use crate::codec::{encode_outbound, CommandKind, ControlCommand, SwitchState, Threshold};
use crate::error::PublishError;
use crate::transport::Transport;

pub struct CommandPublisher {
    transport: Arc<Transport>,
    timeout: Duration,
}

impl CommandPublisher {
    pub fn new(transport: Arc<Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `state` is the toggle label, `开` or `关` (`on`/`off` also accepted).
    pub async fn publish_switch(&self, state: &str) -> Result<(), PublishError> {
        let state: SwitchState = state.parse()?;
        self.send(CommandKind::Switch(state)).await
    }

    /// Both bounds must parse as numbers. They are sent as typed.
    pub async fn publish_threshold(&self, max: &str, min: &str) -> Result<(), PublishError> {
        let threshold = Threshold::parse(max, min, clock::now())?;
        self.send(CommandKind::Threshold(threshold)).await
    }

    pub async fn publish_control(&self, command: &str) -> Result<(), PublishError> {
        let command: ControlCommand = command.parse()?;
        self.send(CommandKind::Control(command)).await
    }

    async fn send(&self, kind: CommandKind) -> Result<(), PublishError> {
        let command = encode_outbound(&kind);
        let result = self
            .transport
            .publish(&command.topic, command.payload.as_bytes(), self.timeout)
            .await;
        match &result {
            Ok(()) => info!(topic = %command.topic, payload = %command.payload, "command published"),
            Err(e) => warn!(topic = %command.topic, "command publish failed: {e}"),
        }
        result
    }
}
