//! Last-known sensor values as the presentation layer shows them, and the
//! fixed history line built from them.

use time::OffsetDateTime;

use crate::clock;
use crate::codec::{SensorField, SensorReading};

/// Marker shown in place of a value that failed to parse.
pub const INVALID_MARKER: &str = "数据异常";

/// Shown by history views when the buffer is empty. Never stored.
pub const EMPTY_HISTORY_PLACEHOLDER: &str = "暂无历史数据，请先等待设备上传数据...";

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum FieldDisplay {
    #[default]
    Pending,
    Value(f64),
    Invalid,
}

impl FieldDisplay {
    fn render(self, decimals: i32) -> String {
        match self {
            Self::Pending => "--".to_string(),
            Self::Value(v) => format_rounded(v, decimals),
            Self::Invalid => INVALID_MARKER.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SensorPanel {
    pub dissolved_oxygen: FieldDisplay,
    pub ph: FieldDisplay,
    pub temperature: FieldDisplay,
}

impl SensorPanel {
    /// Fold a reading in. Fields the reading does not mention keep their
    /// previous value.
    pub fn apply(&mut self, reading: &SensorReading) {
        for field in SensorField::ALL {
            let next = match reading.get(field) {
                Some(v) => FieldDisplay::Value(v),
                None if reading.is_rejected(field) => FieldDisplay::Invalid,
                None => continue,
            };
            *self.slot(field) = next;
        }
    }

    pub fn field(&self, field: SensorField) -> FieldDisplay {
        match field {
            SensorField::DissolvedOxygen => self.dissolved_oxygen,
            SensorField::Ph => self.ph,
            SensorField::Temperature => self.temperature,
        }
    }

    fn slot(&mut self, field: SensorField) -> &mut FieldDisplay {
        match field {
            SensorField::DissolvedOxygen => &mut self.dissolved_oxygen,
            SensorField::Ph => &mut self.ph,
            SensorField::Temperature => &mut self.temperature,
        }
    }

    fn do_text(&self) -> String {
        self.dissolved_oxygen.render(2)
    }

    fn ph_text(&self) -> String {
        self.ph.render(1)
    }

    fn temp_text(&self) -> String {
        self.temperature.render(1)
    }

    pub fn dissolved_oxygen_label(&self) -> String {
        format!("溶解氧: {}mg/L", self.do_text())
    }

    pub fn ph_label(&self) -> String {
        format!("PH值: {}", self.ph_text())
    }

    pub fn temperature_label(&self) -> String {
        format!("温度: {}℃", self.temp_text())
    }

    pub fn history_line(&self, at: OffsetDateTime) -> String {
        format!(
            "{}: 溶解氧{}mg/L | PH{} | 温度{}℃",
            clock::format_seconds(at),
            self.do_text(),
            self.ph_text(),
            self.temp_text()
        )
    }
}

/// Round to `decimals` places and print the shortest form, keeping at least
/// one decimal digit: `7.0 -> "7.0"`, `7.254 -> "7.25"`.
pub fn format_rounded(value: f64, decimals: i32) -> String {
    let scale = 10f64.powi(decimals);
    let rounded = (value * scale).round() / scale;
    // huge values overflow the scaled product; they have no fraction anyway
    let text = if rounded.is_finite() {
        rounded.to_string()
    } else {
        value.to_string()
    };
    if text.contains('.') {
        text
    } else {
        format!("{text}.0")
    }
}
