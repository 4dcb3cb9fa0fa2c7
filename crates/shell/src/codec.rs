use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

use crate::clock;
use crate::error::{ParseError, PublishError};

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

pub const SWITCH_TOPIC: &str = "esp32/switch";
pub const THRESHOLD_TOPIC: &str = "esp32/threshold";
pub const CONTROL_TOPIC: &str = "esp32/control";

/// Sensor data topic used when the configuration does not name one.
pub const DEFAULT_SENSOR_TOPIC: &str = "esp32/data";

// ---------------------------------------------------------------------------
// Inbound: sensor readings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorField {
    DissolvedOxygen,
    Ph,
    Temperature,
}

impl SensorField {
    pub const ALL: [SensorField; 3] = [Self::DissolvedOxygen, Self::Ph, Self::Temperature];

    /// JSON key carrying this field on the wire.
    pub fn key(self) -> &'static str {
        match self {
            Self::DissolvedOxygen => "do",
            Self::Ph => "ph",
            Self::Temperature => "temp",
        }
    }
}

/// One inbound sensor message. Every field is independently optional; a
/// reading with nothing in it is still valid and gets dispatched.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub dissolved_oxygen: Option<f64>,
    pub ph: Option<f64>,
    pub temperature: Option<f64>,
    /// Fields that were present in the payload but not numeric.
    pub rejected: Vec<SensorField>,
    pub received_at: OffsetDateTime,
}

impl SensorReading {
    pub fn empty(received_at: OffsetDateTime) -> Self {
        Self {
            dissolved_oxygen: None,
            ph: None,
            temperature: None,
            rejected: Vec::new(),
            received_at,
        }
    }

    pub fn get(&self, field: SensorField) -> Option<f64> {
        match field {
            SensorField::DissolvedOxygen => self.dissolved_oxygen,
            SensorField::Ph => self.ph,
            SensorField::Temperature => self.temperature,
        }
    }

    pub fn is_rejected(&self, field: SensorField) -> bool {
        self.rejected.contains(&field)
    }

    pub fn is_empty(&self) -> bool {
        SensorField::ALL.iter().all(|f| self.get(*f).is_none())
    }

    fn set(&mut self, field: SensorField, value: f64) {
        match field {
            SensorField::DissolvedOxygen => self.dissolved_oxygen = Some(value),
            SensorField::Ph => self.ph = Some(value),
            SensorField::Temperature => self.temperature = Some(value),
        }
    }
}

enum FieldValue {
    Absent,
    Number(f64),
    Invalid,
}

fn numeric_field(map: &Map<String, Value>, key: &str) -> FieldValue {
    let parsed = match map.get(key) {
        None | Some(Value::Null) => return FieldValue::Absent,
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };
    match parsed.filter(|v| v.is_finite()) {
        Some(v) => FieldValue::Number(v),
        None => FieldValue::Invalid,
    }
}

/// Decode a sensor payload such as `{"do": "7.25", "ph": 7.0, "temp": 25.5}`.
///
/// Unknown keys are ignored, missing keys leave the field empty, and a
/// non-numeric value drops only that field (it is listed in `rejected`).
/// Only a payload that is not a JSON object at all is an error.
pub fn parse_inbound(topic: &str, raw_payload: &[u8]) -> Result<SensorReading, ParseError> {
    parse_inbound_at(topic, raw_payload, clock::now())
}

pub(crate) fn parse_inbound_at(
    topic: &str,
    raw_payload: &[u8],
    received_at: OffsetDateTime,
) -> Result<SensorReading, ParseError> {
    let text = std::str::from_utf8(raw_payload).map_err(|_| ParseError::NotUtf8 {
        topic: topic.to_string(),
    })?;
    let value: Value =
        serde_json::from_str(text.trim()).map_err(|e| ParseError::Malformed {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
    let Value::Object(map) = value else {
        return Err(ParseError::NotAnObject {
            topic: topic.to_string(),
        });
    };

    let mut reading = SensorReading::empty(received_at);
    for field in SensorField::ALL {
        match numeric_field(&map, field.key()) {
            FieldValue::Absent => {}
            FieldValue::Number(v) => reading.set(field, v),
            FieldValue::Invalid => reading.rejected.push(field),
        }
    }
    Ok(reading)
}

// ---------------------------------------------------------------------------
// Outbound: commands
// ---------------------------------------------------------------------------

/// Remote switch position as shown on the toggle button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    On,
    Off,
}

impl SwitchState {
    pub fn payload(self) -> &'static str {
        match self {
            Self::On => "yes",
            Self::Off => "no",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::On => "开",
            Self::Off => "关",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Self::On => Self::Off,
            Self::Off => Self::On,
        }
    }
}

impl FromStr for SwitchState {
    type Err = PublishError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "开" => Ok(Self::On),
            "关" => Ok(Self::Off),
            other if other.eq_ignore_ascii_case("on") => Ok(Self::On),
            other if other.eq_ignore_ascii_case("off") => Ok(Self::Off),
            other => Err(PublishError::invalid(
                "state",
                format!("unknown switch state {other:?} (use 开/关)"),
            )),
        }
    }
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Resume,
}

impl ControlCommand {
    pub fn payload(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
        }
    }
}

impl FromStr for ControlCommand {
    type Err = PublishError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "" => Err(PublishError::invalid("command", "empty command (use pause/resume)")),
            other => Err(PublishError::invalid(
                "command",
                format!("unsupported command {other:?} (use pause/resume)"),
            )),
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.payload())
    }
}

/// Dissolved-oxygen alarm band. Both bounds are required and must be
/// numbers; the user's text is kept so it goes out on the wire unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub max: f64,
    pub min: f64,
    pub timestamp: String,
    max_text: String,
    min_text: String,
}

impl Threshold {
    /// Validate raw user input. Pure: on failure nothing else happens.
    pub fn parse(max: &str, min: &str, issued_at: OffsetDateTime) -> Result<Self, PublishError> {
        let max_text = max.trim();
        let min_text = min.trim();
        let parse = |s: &str| s.parse::<f64>().ok().filter(|v| v.is_finite());

        let max_val = parse(max_text);
        let min_val = parse(min_text);

        let mut fields = Vec::new();
        if max_val.is_none() {
            fields.push("max");
        }
        if min_val.is_none() {
            fields.push("min");
        }

        match (max_val, min_val) {
            (Some(max), Some(min)) => Ok(Self {
                max,
                min,
                timestamp: clock::format_micros(issued_at),
                max_text: max_text.to_string(),
                min_text: min_text.to_string(),
            }),
            _ => Err(PublishError::InvalidInput {
                fields,
                detail: format!(
                    "thresholds must be numbers (max={max_text:?}, min={min_text:?})"
                ),
            }),
        }
    }

    pub fn max_text(&self) -> &str {
        &self.max_text
    }

    pub fn min_text(&self) -> &str {
        &self.min_text
    }

    fn to_payload(&self) -> ThresholdPayload {
        ThresholdPayload {
            max_do: self.max_text.clone(),
            min_do: self.min_text.clone(),
            timestamp: self.timestamp.clone(),
        }
    }
}

/// Wire shape of `esp32/threshold`. Field order is the serialized key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdPayload {
    pub max_do: String,
    pub min_do: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    Switch(SwitchState),
    Threshold(Threshold),
    Control(ControlCommand),
}

/// A serialized command ready for the transport. Dropped once the publish
/// outcome has been reported.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundCommand {
    pub topic: String,
    pub payload: String,
    pub issued_at: OffsetDateTime,
}

pub fn encode_outbound(kind: &CommandKind) -> OutboundCommand {
    let (topic, payload) = match kind {
        CommandKind::Switch(state) => (SWITCH_TOPIC, state.payload().to_string()),
        CommandKind::Control(cmd) => (CONTROL_TOPIC, cmd.payload().to_string()),
        CommandKind::Threshold(threshold) => (THRESHOLD_TOPIC, threshold_json(threshold)),
    };
    OutboundCommand {
        topic: topic.to_string(),
        payload,
        issued_at: clock::now(),
    }
}

fn threshold_json(threshold: &Threshold) -> String {
    // A struct of three strings always serializes.
    serde_json::to_string(&threshold.to_payload()).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Device-side decoding
// ---------------------------------------------------------------------------

pub fn decode_threshold(payload: &[u8]) -> Result<ThresholdPayload, ParseError> {
    serde_json::from_slice(payload).map_err(|e| ParseError::Malformed {
        topic: THRESHOLD_TOPIC.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a `"yes"`/`"no"` switch payload (trims whitespace).
pub fn decode_switch(payload: &[u8]) -> Result<SwitchState, ParseError> {
    let s = String::from_utf8_lossy(payload);
    match s.trim() {
        "yes" => Ok(SwitchState::On),
        "no" => Ok(SwitchState::Off),
        other => Err(ParseError::UnknownCommand {
            topic: SWITCH_TOPIC.to_string(),
            token: other.to_string(),
        }),
    }
}

pub fn decode_control(payload: &[u8]) -> Result<ControlCommand, ParseError> {
    let s = String::from_utf8_lossy(payload);
    s.parse().map_err(|_| ParseError::UnknownCommand {
        topic: CONTROL_TOPIC.to_string(),
        token: s.trim().to_string(),
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const TOPIC: &str = DEFAULT_SENSOR_TOPIC;

    fn parse(json: &str) -> SensorReading {
        parse_inbound(TOPIC, json.as_bytes()).unwrap()
    }

    // -- parse_inbound ------------------------------------------------------

    #[test]
    fn full_payload_with_mixed_number_types() {
        let r = parse(r#"{"do": "7.25", "ph": 7.0, "temp": 25.5}"#);
        assert_eq!(r.dissolved_oxygen, Some(7.25));
        assert_eq!(r.ph, Some(7.0));
        assert_eq!(r.temperature, Some(25.5));
        assert!(r.rejected.is_empty());
    }

    #[test]
    fn every_missing_subset_leaves_exactly_those_fields_absent() {
        let values = [("do", 6.5), ("ph", 7.2), ("temp", 24.0)];
        for mask in 0u8..8 {
            let present: Vec<_> = values
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, kv)| *kv)
                .collect();
            let body = present
                .iter()
                .map(|(k, v)| format!("\"{k}\": {v}"))
                .collect::<Vec<_>>()
                .join(", ");
            let r = parse(&format!("{{{body}}}"));

            for (i, field) in SensorField::ALL.iter().enumerate() {
                let expected = (mask & (1 << i) != 0).then_some(values[i].1);
                assert_eq!(r.get(*field), expected, "mask={mask:03b} field={field:?}");
            }
            assert!(r.rejected.is_empty());
        }
    }

    #[test]
    fn non_numeric_field_is_dropped_not_fatal() {
        let r = parse(r#"{"do": "abc"}"#);
        assert_eq!(r.dissolved_oxygen, None);
        assert!(r.is_rejected(SensorField::DissolvedOxygen));
        assert_eq!(r.ph, None);
        assert!(!r.is_rejected(SensorField::Ph));
    }

    #[test]
    fn bad_field_does_not_affect_good_ones() {
        let r = parse(r#"{"do": true, "ph": "7.1", "temp": [1]}"#);
        assert_eq!(r.ph, Some(7.1));
        assert_eq!(
            r.rejected,
            vec![SensorField::DissolvedOxygen, SensorField::Temperature]
        );
    }

    #[test]
    fn non_finite_strings_are_rejected() {
        let r = parse(r#"{"do": "NaN", "temp": "inf"}"#);
        assert!(r.is_empty());
        assert_eq!(r.rejected.len(), 2);
    }

    #[test]
    fn numeric_strings_are_trimmed() {
        let r = parse(r#"{"temp": " 25.5 "}"#);
        assert_eq!(r.temperature, Some(25.5));
    }

    #[test]
    fn null_counts_as_missing() {
        let r = parse(r#"{"do": null}"#);
        assert!(r.is_empty());
        assert!(r.rejected.is_empty());
    }

    #[test]
    fn unknown_keys_ignored_and_empty_reading_is_ok() {
        let r = parse(r#"{"rssi": -61, "uptime": 1200}"#);
        assert!(r.is_empty());
    }

    #[test]
    fn received_at_is_stamped() {
        let at = datetime!(2026-01-11 16:00:00 UTC);
        let r = parse_inbound_at(TOPIC, br#"{"ph": 7}"#, at).unwrap();
        assert_eq!(r.received_at, at);
    }

    #[test]
    fn non_object_payloads_are_errors() {
        assert!(matches!(
            parse_inbound(TOPIC, b"[1,2,3]"),
            Err(ParseError::NotAnObject { .. })
        ));
        assert!(matches!(
            parse_inbound(TOPIC, b"do=7.2"),
            Err(ParseError::Malformed { .. })
        ));
        assert!(matches!(
            parse_inbound(TOPIC, &[0xff, 0xfe]),
            Err(ParseError::NotUtf8 { .. })
        ));
    }

    // -- commands ------------------------------------------------------------

    #[test]
    fn switch_states_map_to_fixed_tokens() {
        let on = encode_outbound(&CommandKind::Switch("开".parse().unwrap()));
        assert_eq!(on.topic, "esp32/switch");
        assert_eq!(on.payload, "yes");

        let off = encode_outbound(&CommandKind::Switch("关".parse().unwrap()));
        assert_eq!(off.payload, "no");
    }

    #[test]
    fn switch_state_rejects_unknown_token() {
        let err = "maybe".parse::<SwitchState>().unwrap_err();
        assert!(matches!(err, PublishError::InvalidInput { ref fields, .. } if fields == &["state"]));
    }

    #[test]
    fn switch_toggle_flips() {
        assert_eq!(SwitchState::Off.toggled(), SwitchState::On);
        assert_eq!(SwitchState::On.toggled().label(), "关");
    }

    #[test]
    fn control_commands_are_strict() {
        assert_eq!(" pause ".parse::<ControlCommand>(), Ok(ControlCommand::Pause));
        assert_eq!("resume".parse::<ControlCommand>(), Ok(ControlCommand::Resume));
        assert!("PAUSE".parse::<ControlCommand>().is_err());
        assert!("".parse::<ControlCommand>().is_err());

        let cmd = encode_outbound(&CommandKind::Control(ControlCommand::Resume));
        assert_eq!(cmd.topic, "esp32/control");
        assert_eq!(cmd.payload, "resume");
    }

    #[test]
    fn threshold_payload_has_stable_key_order() {
        let at = datetime!(2026-01-11 16:00:00 UTC);
        let t = Threshold::parse("8.0", "6.0", at).unwrap();
        let cmd = encode_outbound(&CommandKind::Threshold(t));
        assert_eq!(cmd.topic, "esp32/threshold");
        assert_eq!(
            cmd.payload,
            r#"{"max_do":"8.0","min_do":"6.0","timestamp":"2026-01-11 16:00:00.000000"}"#
        );
    }

    #[test]
    fn threshold_round_trips_through_decoder() {
        let at = datetime!(2026-01-11 16:00:00 UTC);
        let t = Threshold::parse("8.0", "6.0", at).unwrap();
        let cmd = encode_outbound(&CommandKind::Threshold(t));
        let decoded = decode_threshold(cmd.payload.as_bytes()).unwrap();
        assert_eq!(decoded.max_do, "8.0");
        assert_eq!(decoded.min_do, "6.0");
    }

    #[test]
    fn threshold_rejects_non_numeric_min() {
        let at = datetime!(2026-01-11 16:00:00 UTC);
        let err = Threshold::parse("8.0", "abc", at).unwrap_err();
        match err {
            PublishError::InvalidInput { fields, .. } => assert_eq!(fields, vec!["min"]),
            other => panic!("expected InvalidInput, got {other:?}"),
        }
    }

    #[test]
    fn threshold_rejects_both_when_both_bad() {
        let at = datetime!(2026-01-11 16:00:00 UTC);
        let err = Threshold::parse("", " ", at).unwrap_err();
        assert!(matches!(err, PublishError::InvalidInput { ref fields, .. } if fields == &["max", "min"]));
    }

    #[test]
    fn threshold_keeps_trimmed_user_text() {
        let at = datetime!(2026-01-11 16:00:00 UTC);
        let t = Threshold::parse(" 9 ", "5.50", at).unwrap();
        assert_eq!(t.max, 9.0);
        assert_eq!(t.max_text(), "9");
        assert_eq!(t.min_text(), "5.50");
    }

    // -- device-side decoding ------------------------------------------------

    #[test]
    fn decode_switch_payloads() {
        assert_eq!(decode_switch(b"yes"), Ok(SwitchState::On));
        assert_eq!(decode_switch(b" no\n"), Ok(SwitchState::Off));
        assert!(decode_switch(b"ON").is_err());
    }

    #[test]
    fn decode_control_payloads() {
        assert_eq!(decode_control(b"pause"), Ok(ControlCommand::Pause));
        assert!(matches!(
            decode_control(b"reboot"),
            Err(ParseError::UnknownCommand { ref token, .. }) if token == "reboot"
        ));
    }

    #[test]
    fn decode_threshold_rejects_missing_field() {
        assert!(decode_threshold(br#"{"max_do":"8.0"}"#).is_err());
    }
}
