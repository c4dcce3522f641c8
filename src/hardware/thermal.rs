//! CPU temperature readers
//!
//! The sensor set that carries the CPU die temperature depends on the
//! silicon generation, so the detected model name is first mapped to a
//! [`ThermalFamily`] and the reader for that family averages its sensors.

use serde::{Deserialize, Serialize};

use crate::error::ProbeError;

/// Silicon generation with a known thermal sensor layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThermalFamily {
    AppleM1,
    AppleM2,
    AppleM3,
    /// Intel/AMD style package sensors
    X64,
}

impl ThermalFamily {
    /// Map a CPU brand string to its family.
    ///
    /// Returns `None` for Apple Silicon generations without a known sensor
    /// layout.
    pub fn from_cpu_name(name: &str) -> Option<Self> {
        let Some(rest) = name.strip_prefix("Apple M") else {
            return Some(ThermalFamily::X64);
        };
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        match digits.parse::<u32>().ok()? {
            1 => Some(ThermalFamily::AppleM1),
            2 => Some(ThermalFamily::AppleM2),
            3 => Some(ThermalFamily::AppleM3),
            _ => None,
        }
    }

    /// Sensor label fragments that belong to the CPU for this family
    pub fn sensor_labels(&self) -> &'static [&'static str] {
        match self {
            ThermalFamily::AppleM1 => &["pACC MTR Temp", "eACC MTR Temp"],
            ThermalFamily::AppleM2 => &["pACC MTR Temp", "eACC MTR Temp", "PMU tdie"],
            ThermalFamily::AppleM3 => &["PMU tdie", "PMU2 tdie"],
            ThermalFamily::X64 => &[
                "Package id",
                "Tctl",
                "Tdie",
                "k10temp",
                "coretemp",
                "cpu_thermal",
                "CPU",
                "TC0P",
            ],
        }
    }
}

/// Reader of the CPU temperature for a given family
pub trait ThermalSensors: Send + Sync {
    fn cpu_temperature(&self, family: ThermalFamily) -> Result<f64, ProbeError>;
}

/// Average of matching readings, ignoring non-finite and non-positive values
pub fn average_matching<'a>(
    readings: impl IntoIterator<Item = (&'a str, f64)>,
    labels: &[&str],
) -> Option<f64> {
    let (sum, count) = readings
        .into_iter()
        .filter(|(label, value)| {
            value.is_finite()
                && *value > 0.0
                && labels
                    .iter()
                    .any(|l| label.to_lowercase().contains(&l.to_lowercase()))
        })
        .fold((0.0, 0usize), |(sum, count), (_, value)| (sum + value, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Reads hardware sensors through `sysinfo::Components`
#[derive(Debug, Default, Clone, Copy)]
pub struct ComponentThermals;

impl ThermalSensors for ComponentThermals {
    fn cpu_temperature(&self, family: ThermalFamily) -> Result<f64, ProbeError> {
        let components = sysinfo::Components::new_with_refreshed_list();
        let readings: Vec<(String, f64)> = components
            .iter()
            .filter_map(|component| {
                let celsius: Option<f32> = Option::from(component.temperature());
                celsius.map(|c| (component.label().to_string(), c as f64))
            })
            .collect();

        average_matching(
            readings.iter().map(|(label, value)| (label.as_str(), *value)),
            family.sensor_labels(),
        )
        .ok_or_else(|| ProbeError::unavailable(format!("no {family:?} temperature sensor")))
    }
}
