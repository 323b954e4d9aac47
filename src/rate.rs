use chrono::DateTime;
use chrono_tz::Tz;
use log::debug;

use crate::reading::{CounterSnapshot, Reading, Source};

/// kWh per second -> Watts.
pub const KWH_PER_SECOND_TO_WATT: f64 = 1000.0 * 3600.0;

/// Trailing window for PV rates. The plug counter only has 0.001 kWh
/// resolution, which turns the raw differences into a staircase.
pub const PV_SMOOTHING_WINDOW: usize = 9;

/// Power derived from counter differences, index-aligned with the readings
/// it was computed from. Only a fallback for missing direct readings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateSeries {
    pub rates: Vec<Option<f64>>,
    pub zero_elapsed: usize,
}

/// Differentiate the cumulative counters of consecutive counter-bearing readings.
///
/// The meter yields net import (`rate_in - rate_out`), matching the sign of
/// its direct `watt` field. PV yields the rate of its single counter.
/// Readings must already be sorted by time.
pub fn reconstruct(source: Source, readings: &[Reading]) -> RateSeries {
    let mut series = RateSeries {
        rates: vec![None; readings.len()],
        zero_elapsed: 0,
    };
    let mut previous: Option<(DateTime<Tz>, CounterSnapshot)> = None;

    for (i, reading) in readings.iter().enumerate() {
        let Some(counters) = reading.counters else {
            continue;
        };

        if let Some((prev_ts, prev)) = previous {
            let elapsed = (reading.timestamp - prev_ts).num_milliseconds() as f64 / 1000.0;
            if elapsed > 0.0 {
                let delta_in = counters.energy_in - prev.energy_in;
                let delta_out = match (counters.energy_out, prev.energy_out) {
                    (Some(out), Some(prev_out)) => out - prev_out,
                    _ => 0.0,
                };
                series.rates[i] = Some((delta_in - delta_out) / elapsed * KWH_PER_SECOND_TO_WATT);
            } else {
                debug!("{}: zero elapsed time at {}", source, reading.timestamp);
                series.zero_elapsed += 1;
            }
        }
        previous = Some((reading.timestamp, counters));
    }

    series
}

impl RateSeries {
    /// Trailing moving average over the last `window` samples, using whatever
    /// values in the window are defined.
    pub fn smoothed(&self, window: usize) -> RateSeries {
        let window = window.max(1);
        let rates = (0..self.rates.len())
            .map(|i| {
                let start = (i + 1).saturating_sub(window);
                let defined: Vec<f64> = self.rates[start..=i].iter().flatten().copied().collect();
                if defined.is_empty() {
                    None
                } else {
                    Some(defined.iter().sum::<f64>() / defined.len() as f64)
                }
            })
            .collect();

        RateSeries {
            rates,
            zero_elapsed: self.zero_elapsed,
        }
    }
}
