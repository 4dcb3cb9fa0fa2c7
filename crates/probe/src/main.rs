mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use aquamon_shell::codec::{
    decode_control, decode_switch, decode_threshold, ControlCommand, ThresholdPayload,
    CONTROL_TOPIC, DEFAULT_SENSOR_TOPIC, SWITCH_TOPIC, THRESHOLD_TOPIC,
};
use aquamon_shell::{ParseError, SwitchState};
use sim::{Scenario, WaterSim};

/// A command received from the monitor.
#[derive(Debug, Clone, PartialEq)]
enum DeviceCommand {
    Switch(SwitchState),
    Control(ControlCommand),
    Threshold(ThresholdPayload),
}

fn decode_command(topic: &str, payload: &[u8]) -> Result<DeviceCommand, ParseError> {
    match topic {
        SWITCH_TOPIC => decode_switch(payload).map(DeviceCommand::Switch),
        CONTROL_TOPIC => decode_control(payload).map(DeviceCommand::Control),
        THRESHOLD_TOPIC => decode_threshold(payload).map(DeviceCommand::Threshold),
        other => Err(ParseError::UnknownCommand {
            topic: other.to_string(),
            token: String::from_utf8_lossy(payload).into_owned(),
        }),
    }
}

/// Dissolved-oxygen alarm band last received on the threshold topic.
#[derive(Debug, Clone, Copy, PartialEq)]
struct AlarmBand {
    max: f64,
    min: f64,
}

impl AlarmBand {
    fn from_payload(payload: &ThresholdPayload) -> Option<Self> {
        let max = payload.max_do.trim().parse().ok()?;
        let min = payload.min_do.trim().parse().ok()?;
        Some(Self { max, min })
    }

    fn breach(&self, dissolved_oxygen: f64) -> Option<&'static str> {
        if dissolved_oxygen > self.max {
            Some("above")
        } else if dissolved_oxygen < self.min {
            Some("below")
        } else {
            None
        }
    }
}

/// Device-side state the commands act on.
struct Probe {
    sim: WaterSim,
    paused: bool,
    band: Option<AlarmBand>,
}

impl Probe {
    fn apply(&mut self, command: DeviceCommand) {
        match command {
            DeviceCommand::Switch(state) => {
                self.sim.set_aerator(state == SwitchState::On);
                info!(aerator = %state, "switch command applied");
            }
            DeviceCommand::Control(ControlCommand::Pause) => {
                self.paused = true;
                info!("sampling paused");
            }
            DeviceCommand::Control(ControlCommand::Resume) => {
                self.paused = false;
                info!("sampling resumed");
            }
            DeviceCommand::Threshold(payload) => match AlarmBand::from_payload(&payload) {
                Some(band) => {
                    info!(max = band.max, min = band.min, issued = %payload.timestamp, "alarm band updated");
                    self.band = Some(band);
                }
                None => warn!(?payload, "threshold with non-numeric bounds ignored"),
            },
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let topic = env::var("SENSOR_TOPIC").unwrap_or_else(|_| DEFAULT_SENSOR_TOPIC.to_string());
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let use_tls = env::var("MQTT_TLS")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let mut mqttoptions = MqttOptions::new("aquamon-probe", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    if let Ok(user) = env::var("MQTT_USERNAME") {
        mqttoptions.set_credentials(user, env::var("MQTT_PASSWORD").unwrap_or_default());
    }
    if use_tls {
        mqttoptions.set_transport(rumqttc::Transport::tls_with_default_config());
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);
    let (tx, mut commands) = mpsc::unbounded_channel();

    // Event loop: (re)subscribe on every ConnAck, forward decoded commands.
    let sub_client = client.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("probe connected to mqtt");
                    for t in [SWITCH_TOPIC, THRESHOLD_TOPIC, CONTROL_TOPIC] {
                        if let Err(e) = sub_client.try_subscribe(t, QoS::AtLeastOnce) {
                            warn!(topic = t, "subscribe failed: {e}");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    match decode_command(&p.topic, &p.payload) {
                        Ok(cmd) => {
                            if tx.send(cmd).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("ignored command: {e}"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    info!(%topic, %scenario, every_s = sample_every_s, "publishing simulated readings");

    let mut probe = Probe {
        sim: WaterSim::new(scenario),
        paused: false,
        band: None,
    };
    let mut ticker = tokio::time::interval(Duration::from_secs(sample_every_s.max(1)));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if probe.paused {
                    continue;
                }
                let sample = probe.sim.sample();
                if let (Some(band), Ok(value)) = (probe.band, sample.dissolved_oxygen.parse::<f64>()) {
                    if let Some(side) = band.breach(value) {
                        warn!(dissolved_oxygen = value, min = band.min, max = band.max, "dissolved oxygen {side} alarm band");
                    }
                }
                let payload = serde_json::to_vec(&sample)?;
                match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                    Ok(()) => debug!(?sample, "published reading"),
                    Err(e) => warn!("publish error: {e}"),
                }
            }
            Some(command) = commands.recv() => probe.apply(command),
            _ = tokio::signal::ctrl_c() => {
                info!("probe shutting down");
                break;
            }
        }
    }

    client.disconnect().await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
