use chrono::DateTime;
use chrono_tz::Tz;
use std::fmt;

/// Where a reading sequence comes from. Decides the counter layout and the
/// column names used in the tab-separated files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// Bidirectional grid meter (Tasmota MT681): import and export counters.
    Meter,
    /// PV inverter plug (Shelly): one production counter.
    Pv,
}

/// Column names of one source in the tab-separated interchange format.
pub struct Columns {
    pub direct_power: &'static str,
    pub energy_in: &'static str,
    pub energy_out: Option<&'static str>,
    /// Instantaneous power at message time, recorded but not analysed.
    pub instant_power: Option<&'static str>,
}

impl Source {
    pub fn columns(self) -> Columns {
        match self {
            Source::Meter => Columns {
                direct_power: "watt",
                energy_in: "kWh_total_in",
                energy_out: Some("kWh_total_out"),
                instant_power: None,
            },
            Source::Pv => Columns {
                direct_power: "watt_last",
                energy_in: "kWh_total",
                energy_out: None,
                instant_power: Some("watt_now"),
            },
        }
    }

    pub fn is_bidirectional(self) -> bool {
        self.columns().energy_out.is_some()
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Meter => write!(f, "meter"),
            Source::Pv => write!(f, "pv"),
        }
    }
}

/// A row as it arrives from a file or the broker, nothing parsed yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawReading {
    pub time: String,
    pub direct_power: Option<String>,
    pub energy_in: Option<String>,
    pub energy_out: Option<String>,
    pub instant_power: Option<String>,
}

/// Cumulative counter values of one reading (kWh).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterSnapshot {
    /// Grid import for the meter, total production for PV.
    pub energy_in: f64,
    /// Grid export; always `None` for PV.
    pub energy_out: Option<f64>,
}

/// A validated reading with its timestamp in the target time zone.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub timestamp: DateTime<Tz>,
    /// Watts, positive = importing from the grid (meter) or producing (PV).
    pub direct_power: Option<f64>,
    pub counters: Option<CounterSnapshot>,
    /// Shelly `apower` in W. Never used in place of `direct_power`.
    pub instant_power: Option<f64>,
}

/// Per-source counts of problems that were recovered from locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub malformed: usize,
    pub zero_elapsed: usize,
}

/// Round to a fixed number of decimals.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
