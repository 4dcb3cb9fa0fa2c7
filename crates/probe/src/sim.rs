//! Stateful water-quality probe simulator for local development.
//!
//! Models a pond probe with:
//! - Temporal coherence via random walk with mean reversion
//! - Per-reading electronic noise
//! - Aerator response (dissolved oxygen rises while the switch is on)
//! - Occasional garbled dissolved-oxygen readings (flaky scenario)

use serde::Serialize;
use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation
// ---------------------------------------------------------------------------

/// Irwin-Hall: sum of 12 uniform [0,1) values minus 6 approximates N(0,1).
fn approx_std_normal(rng: &mut fastrand::Rng) -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += rng.f64();
    }
    sum - 6.0
}

fn gaussian(rng: &mut fastrand::Rng, mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal(rng)
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Well-oxygenated pond, low noise.
    Stable,
    /// Dissolved oxygen sags toward 3 mg/L. Turning the aerator on should
    /// pull it back up.
    Hypoxic,
    /// Stable chemistry, but about one reading in ten carries a garbled
    /// `"do"` value.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "hypoxic" => Self::Hypoxic,
            "flaky" => Self::Flaky,
            _ => Self::Stable, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Hypoxic => write!(f, "hypoxic"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire shape
// ---------------------------------------------------------------------------

/// One reading as the probe firmware publishes it. Dissolved oxygen goes out
/// as a string with two decimals; the others as plain numbers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    #[serde(rename = "do")]
    pub dissolved_oxygen: String,
    pub ph: f64,
    pub temp: f64,
}

/// What a garbled sensor sends in place of a number.
pub const GLITCH_TEXT: &str = "ERR";

// ---------------------------------------------------------------------------
// Per-channel state
// ---------------------------------------------------------------------------

struct Channel {
    value: f64,
    center: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    floor: f64,
    ceiling: f64,
}

impl Channel {
    fn step(&mut self, rng: &mut fastrand::Rng, push: f64) -> f64 {
        let pull = self.mean_reversion * (self.center - self.value);
        let walk = gaussian(rng, 0.0, self.walk_sigma);
        self.value = (self.value + pull + walk + push).clamp(self.floor, self.ceiling);
        let noise = gaussian(rng, 0.0, self.noise_sigma);
        (self.value + noise).clamp(self.floor, self.ceiling)
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

pub struct WaterSim {
    rng: fastrand::Rng,
    dissolved_oxygen: Channel,
    ph: Channel,
    temperature: Channel,
    glitch_prob: f64,
    aerator: bool,
    /// mg/L added per sample while the aerator runs.
    aeration_rate: f64,
}

impl WaterSim {
    pub fn new(scenario: Scenario) -> Self {
        Self::with_rng(scenario, fastrand::Rng::new())
    }

    /// Deterministic simulator for tests.
    pub fn with_seed(scenario: Scenario, seed: u64) -> Self {
        Self::with_rng(scenario, fastrand::Rng::with_seed(seed))
    }

    fn with_rng(scenario: Scenario, rng: fastrand::Rng) -> Self {
        let (do_center, do_start, glitch_prob) = match scenario {
            Scenario::Stable => (7.5, 7.5, 0.0),
            Scenario::Hypoxic => (3.0, 5.0, 0.0),
            Scenario::Flaky => (7.5, 7.5, 0.10),
        };

        Self {
            rng,
            dissolved_oxygen: Channel {
                value: do_start,
                center: do_center,
                walk_sigma: 0.08,
                mean_reversion: 0.05,
                noise_sigma: 0.03,
                floor: 0.0,
                ceiling: 14.6, // saturation at ~0 °C
            },
            ph: Channel {
                value: 7.2,
                center: 7.2,
                walk_sigma: 0.02,
                mean_reversion: 0.05,
                noise_sigma: 0.01,
                floor: 0.0,
                ceiling: 14.0,
            },
            temperature: Channel {
                value: 24.0,
                center: 24.0,
                walk_sigma: 0.1,
                mean_reversion: 0.02,
                noise_sigma: 0.05,
                floor: -2.0,
                ceiling: 40.0,
            },
            glitch_prob,
            aerator: false,
            aeration_rate: 0.25,
        }
    }

    pub fn set_aerator(&mut self, on: bool) {
        self.aerator = on;
    }

    pub fn aerator(&self) -> bool {
        self.aerator
    }

    /// Advance every channel one tick and produce the published reading.
    pub fn sample(&mut self) -> Sample {
        let push = if self.aerator { self.aeration_rate } else { 0.0 };
        let dissolved_oxygen = self.dissolved_oxygen.step(&mut self.rng, push);
        let ph = self.ph.step(&mut self.rng, 0.0);
        let temp = self.temperature.step(&mut self.rng, 0.0);

        let dissolved_oxygen = if self.rng.f64() < self.glitch_prob {
            GLITCH_TEXT.to_string()
        } else {
            format!("{dissolved_oxygen:.2}")
        };

        Sample {
            dissolved_oxygen,
            ph: round_to(ph, 1),
            temp: round_to(temp, 1),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use aquamon_shell::codec::{parse_inbound, DEFAULT_SENSOR_TOPIC};
    use aquamon_shell::SensorField;

    fn mean_do(sim: &mut WaterSim, n: usize) -> f64 {
        let values: Vec<f64> = (0..n)
            .filter_map(|_| sim.sample().dissolved_oxygen.parse().ok())
            .collect();
        values.iter().sum::<f64>() / values.len() as f64
    }

    #[test]
    fn readings_stay_physical() {
        let mut sim = WaterSim::with_seed(Scenario::Hypoxic, 7);
        for _ in 0..1000 {
            let s = sim.sample();
            let d: f64 = s.dissolved_oxygen.parse().unwrap();
            assert!((0.0..=14.6).contains(&d), "do out of range: {d}");
            assert!((0.0..=14.0).contains(&s.ph), "ph out of range: {}", s.ph);
            assert!((-2.0..=40.0).contains(&s.temp), "temp out of range: {}", s.temp);
        }
    }

    #[test]
    fn hypoxic_runs_lower_than_stable() {
        let mut stable = WaterSim::with_seed(Scenario::Stable, 1);
        let mut hypoxic = WaterSim::with_seed(Scenario::Hypoxic, 1);
        for _ in 0..100 {
            hypoxic.sample();
        }
        let (s, h) = (mean_do(&mut stable, 200), mean_do(&mut hypoxic, 200));
        assert!(h < s, "hypoxic ({h:.2}) should sit below stable ({s:.2})");
    }

    #[test]
    fn aerator_raises_dissolved_oxygen() {
        let mut sim = WaterSim::with_seed(Scenario::Hypoxic, 3);
        for _ in 0..100 {
            sim.sample();
        }
        let before = mean_do(&mut sim, 20);

        sim.set_aerator(true);
        assert!(sim.aerator());
        for _ in 0..50 {
            sim.sample();
        }
        let after = mean_do(&mut sim, 20);

        assert!(
            after > before + 1.0,
            "aerator should lift do: before={before:.2} after={after:.2}"
        );
    }

    #[test]
    fn flaky_emits_glitches_and_stable_never_does() {
        let mut flaky = WaterSim::with_seed(Scenario::Flaky, 11);
        let glitches = (0..500)
            .filter(|_| flaky.sample().dissolved_oxygen == GLITCH_TEXT)
            .count();
        assert!((10..150).contains(&glitches), "glitch count {glitches}");

        let mut stable = WaterSim::with_seed(Scenario::Stable, 11);
        assert!((0..500).all(|_| stable.sample().dissolved_oxygen != GLITCH_TEXT));
    }

    #[test]
    fn sample_serializes_like_the_firmware() {
        let sample = Sample {
            dissolved_oxygen: "7.25".into(),
            ph: 7.0,
            temp: 25.5,
        };
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["do"], "7.25");
        assert_eq!(json["ph"], 7.0);
        assert_eq!(json["temp"], 25.5);
        assert_eq!(json.as_object().unwrap().len(), 3);
    }

    #[test]
    fn glitched_sample_is_flagged_by_the_shell_parser() {
        let sample = Sample {
            dissolved_oxygen: GLITCH_TEXT.into(),
            ph: 7.1,
            temp: 23.0,
        };
        let payload = serde_json::to_vec(&sample).unwrap();
        let reading = parse_inbound(DEFAULT_SENSOR_TOPIC, &payload).unwrap();
        assert!(reading.is_rejected(SensorField::DissolvedOxygen));
        assert_eq!(reading.ph, Some(7.1));
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("STABLE"), Scenario::Stable);
        assert_eq!(Scenario::from_str_lossy("Hypoxic"), Scenario::Hypoxic);
        assert_eq!(Scenario::from_str_lossy("flaky"), Scenario::Flaky);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Stable);
    }

    #[test]
    fn scenario_display() {
        assert_eq!(Scenario::Hypoxic.to_string(), "hypoxic");
        assert_eq!(Scenario::Flaky.to_string(), "flaky");
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let mut rng = fastrand::Rng::with_seed(42);
        let n = 5000;
        let mean = (0..n).map(|_| approx_std_normal(&mut rng)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.15, "mean should be near zero: {mean}");
    }
}
