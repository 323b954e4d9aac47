use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use log::{debug, warn};

use crate::error::ReadingError;
use crate::reading::{CounterSnapshot, RawReading, Reading, Source};

/// Formats without an offset. These are wall-clock times in the target zone
/// (Tasmota reports local time, the local TSV files are written that way).
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Readings of one source, sorted by time, plus how many rows were dropped.
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub readings: Vec<Reading>,
    pub malformed: usize,
}

/// Converts raw rows of one source into validated readings in one time zone.
pub struct Normalizer {
    source: Source,
    tz: Tz,
}

impl Normalizer {
    pub fn new(source: Source, tz: Tz) -> Self {
        Self { source, tz }
    }

    /// Parse an RFC 3339 timestamp (any offset, or `Z`) or a naive local one.
    pub fn parse_timestamp(&self, text: &str) -> Result<DateTime<Tz>, ReadingError> {
        let text = text.trim();

        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Ok(dt.with_timezone(&self.tz));
        }
        if let Ok(dt) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%:z") {
            return Ok(dt.with_timezone(&self.tz));
        }

        for format in NAIVE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
                return match self.tz.from_local_datetime(&naive) {
                    LocalResult::Single(dt) => Ok(dt),
                    // DST fold: the wall-clock hour occurs twice, take the first
                    LocalResult::Ambiguous(earliest, _) => Ok(earliest),
                    LocalResult::None => Err(ReadingError::NonexistentLocalTime(text.to_string())),
                };
            }
        }

        Err(ReadingError::Timestamp(text.to_string()))
    }

    /// Validate one row. A reading must carry either a direct power value or
    /// the complete counter set of its source.
    pub fn normalize_one(&self, raw: &RawReading) -> Result<Reading, ReadingError> {
        let columns = self.source.columns();
        let timestamp = self.parse_timestamp(&raw.time)?;
        let direct_power = parse_number(columns.direct_power, raw.direct_power.as_deref())?;
        let energy_in = parse_number(columns.energy_in, raw.energy_in.as_deref())?;

        let counters = match columns.energy_out {
            Some(out_column) => {
                let energy_out = parse_number(out_column, raw.energy_out.as_deref())?;
                match (energy_in, energy_out) {
                    (Some(energy_in), Some(energy_out)) => Some(CounterSnapshot {
                        energy_in,
                        energy_out: Some(energy_out),
                    }),
                    (None, None) => None,
                    (Some(_), None) => return Err(ReadingError::MissingField(out_column)),
                    (None, Some(_)) => return Err(ReadingError::MissingField(columns.energy_in)),
                }
            }
            None => energy_in.map(|energy_in| CounterSnapshot {
                energy_in,
                energy_out: None,
            }),
        };

        if direct_power.is_none() && counters.is_none() {
            return Err(ReadingError::MissingField(columns.energy_in));
        }
        let instant_power = match columns.instant_power {
            Some(column) => parse_number(column, raw.instant_power.as_deref())?,
            None => None,
        };

        Ok(Reading {
            timestamp,
            direct_power,
            counters,
            instant_power,
        })
    }

    /// Validate a batch, drop and count malformed rows, and sort by time.
    pub fn normalize(&self, raws: &[RawReading]) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();

        for raw in raws {
            match self.normalize_one(raw) {
                Ok(reading) => batch.readings.push(reading),
                Err(e) => {
                    debug!("{}: dropping reading {:?}: {}", self.source, raw.time, e);
                    batch.malformed += 1;
                }
            }
        }

        if batch.malformed > 0 {
            warn!(
                "{}: dropped {} malformed reading(s) of {}",
                self.source,
                batch.malformed,
                raws.len()
            );
        }

        batch.readings = self.renormalize(batch.readings);
        batch
    }

    /// Bring already parsed readings into the target zone and time order.
    /// Applying this twice gives the same result as applying it once.
    pub fn renormalize(&self, mut readings: Vec<Reading>) -> Vec<Reading> {
        for reading in &mut readings {
            reading.timestamp = reading.timestamp.with_timezone(&self.tz);
        }
        readings.sort_by_key(|r| r.timestamp);
        readings
    }
}

/// Empty cells and `NaN` mean "no value"; anything else must be a number.
fn parse_number(field: &'static str, value: Option<&str>) -> Result<Option<f64>, ReadingError> {
    let value = match value.map(str::trim) {
        Some(v) if !v.is_empty() => v,
        _ => return Ok(None),
    };
    let parsed: f64 = value.parse().map_err(|_| ReadingError::InvalidNumber {
        field,
        value: value.to_string(),
    })?;
    Ok(parsed.is_finite().then_some(parsed))
}
