use chrono::{DateTime, Duration, NaiveDate};
use chrono_tz::Tz;
use log::debug;

use crate::error::SeriesError;
use crate::rate::RateSeries;
use crate::reading::{round_to, CounterSnapshot, Reading, Source};

/// Decimals kept in the final power values (both sources).
pub const POWER_DECIMALS: i32 = 1;

/// Half-open time range `[start, end)` to produce a series for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
}

impl Window {
    pub fn new(start: DateTime<Tz>, end: DateTime<Tz>) -> Self {
        Self { start, end }
    }

    /// Smallest window of whole intervals containing every reading.
    pub fn covering(readings: &[Reading], step: Duration) -> Option<Self> {
        let first = readings.iter().map(|r| r.timestamp).min()?;
        let last = readings.iter().map(|r| r.timestamp).max()?;
        Some(Self::new(floor_to(first, step), floor_to(last, step) + step))
    }

    pub fn contains(&self, ts: DateTime<Tz>) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Whether any part of the local calendar `day` lies inside the window.
    pub fn overlaps_day(&self, day: NaiveDate) -> bool {
        let last = self.end - Duration::nanoseconds(1);
        day >= self.start.date_naive() && day <= last.date_naive()
    }
}

/// Align a timestamp to the start of its interval (clock boundaries, in UTC).
pub fn floor_to(ts: DateTime<Tz>, step: Duration) -> DateTime<Tz> {
    let step_secs = step.num_seconds().max(1);
    let secs = ts.timestamp();
    let excess = secs - secs.div_euclid(step_secs) * step_secs;
    let nanos = i64::from(ts.timestamp_subsec_nanos());
    ts - Duration::seconds(excess) - Duration::nanoseconds(nanos)
}

/// One interval of the finished series.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPoint {
    pub start: DateTime<Tz>,
    /// Watts; always defined.
    pub power: f64,
    /// Last counters seen up to and including this interval.
    pub counters: Option<CounterSnapshot>,
}

/// Gap-free power series of one source at a fixed step.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesOutput {
    pub source: Source,
    pub step: Duration,
    pub points: Vec<SeriesPoint>,
}

#[derive(Debug, Default)]
struct Interval {
    direct_sum: f64,
    direct_count: usize,
    reconstructed_sum: f64,
    reconstructed_count: usize,
    counters_last: Option<CounterSnapshot>,
}

impl Interval {
    fn power_direct(&self) -> Option<f64> {
        mean(self.direct_sum, self.direct_count)
    }

    fn power_reconstructed(&self) -> Option<f64> {
        mean(self.reconstructed_sum, self.reconstructed_count)
    }

    fn add(&mut self, reading: &Reading, rate: Option<f64>) {
        if let Some(power) = reading.direct_power {
            self.direct_sum += power;
            self.direct_count += 1;
        }
        if let Some(rate) = rate {
            self.reconstructed_sum += rate;
            self.reconstructed_count += 1;
        }
        if reading.counters.is_some() {
            self.counters_last = reading.counters;
        }
    }
}

fn mean(sum: f64, count: usize) -> Option<f64> {
    (count > 0).then(|| sum / count as f64)
}

/// Buckets readings into fixed intervals and closes gaps in the direct power
/// with back-filled reconstructed power.
pub struct Resampler {
    source: Source,
    step: Duration,
}

impl Resampler {
    pub fn new(source: Source, step: Duration) -> Self {
        Self { source, step }
    }

    /// `rates` must be index-aligned with `readings`, which must be sorted.
    ///
    /// Only the window is put on the grid. Outside it, two readings still take
    /// part: the last counters before the window seed the carried counters, and
    /// the first reconstructed interval after it can close the trailing gap.
    pub fn resample(
        &self,
        readings: &[Reading],
        rates: &RateSeries,
        window: Window,
    ) -> Result<SeriesOutput, SeriesError> {
        if !readings.iter().any(|r| window.contains(r.timestamp)) {
            return Err(SeriesError::EmptyInputWindow { series: self.source });
        }

        let step_secs = self.step.num_seconds().max(1);
        let grid_start = floor_to(window.start, self.step);
        let len = ((window.end - grid_start).num_seconds() + step_secs - 1) / step_secs;
        let grid_end = grid_start + Duration::seconds(len * step_secs);

        let mut intervals: Vec<Interval> = (0..len).map(|_| Interval::default()).collect();
        let mut counters: Option<CounterSnapshot> = None;
        let mut after: Option<(DateTime<Tz>, Interval)> = None;

        for (reading, rate) in readings.iter().zip(&rates.rates) {
            let ts = reading.timestamp;
            if ts < grid_start {
                if reading.counters.is_some() {
                    counters = reading.counters;
                }
                continue;
            }
            let interval = if ts < grid_end {
                let index = ((ts - grid_start).num_seconds() / step_secs) as usize;
                &mut intervals[index]
            } else {
                // first later interval that has a reconstructed value
                let bucket = floor_to(ts, self.step);
                match &after {
                    Some((start, _)) if *start != bucket => break,
                    None if rate.is_none() => continue,
                    _ => {}
                }
                &mut after.get_or_insert_with(|| (bucket, Interval::default())).1
            };
            interval.add(reading, *rate);
        }

        // Back-fill: an empty interval takes the next later reconstructed value.
        let mut reconstructed: Vec<Option<f64>> =
            intervals.iter().map(Interval::power_reconstructed).collect();
        let mut next = after.and_then(|(_, later)| later.power_reconstructed());
        for value in reconstructed.iter_mut().rev() {
            if value.is_some() {
                next = *value;
            } else {
                *value = next;
            }
        }

        let mut points = Vec::with_capacity(intervals.len());
        let mut missing: Vec<DateTime<Tz>> = Vec::new();
        let mut filled = 0;
        for (i, interval) in intervals.iter().enumerate() {
            if interval.counters_last.is_some() {
                counters = interval.counters_last;
            }
            let start = grid_start + Duration::seconds(i as i64 * step_secs);

            let power = match (interval.power_direct(), reconstructed[i]) {
                (Some(direct), _) => direct,
                (None, Some(fallback)) => {
                    filled += 1;
                    fallback
                }
                (None, None) => {
                    missing.push(start);
                    continue;
                }
            };
            points.push(SeriesPoint {
                start,
                power: round_to(power, POWER_DECIMALS),
                counters,
            });
        }

        if let Some(first) = missing.first() {
            return Err(SeriesError::UnresolvableGap {
                series: self.source,
                first: *first,
                missing: missing.len(),
            });
        }

        debug!(
            "{}: {} interval(s), {} filled from counter rates",
            self.source,
            points.len(),
            filled
        );

        Ok(SeriesOutput {
            source: self.source,
            step: self.step,
            points,
        })
    }
}
