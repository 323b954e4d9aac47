use chrono::DateTime;
use chrono_tz::Tz;
use thiserror::Error;

use crate::reading::Source;

/// Why a single reading was dropped. Never aborts a run.
#[derive(Debug, Error, PartialEq)]
pub enum ReadingError {
    #[error("unparsable timestamp: {0:?}")]
    Timestamp(String),
    #[error("local time {0} does not exist in the target time zone")]
    NonexistentLocalTime(String),
    #[error("field {field} is not a number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("missing required field {0}")]
    MissingField(&'static str),
}

/// Structural failures that abort the pipeline of one source.
#[derive(Debug, Error, PartialEq)]
pub enum SeriesError {
    #[error("{series}: no readings in the requested window")]
    EmptyInputWindow { series: Source },
    #[error("{series}: {missing} interval(s) could not be filled, first at {first}")]
    UnresolvableGap {
        series: Source,
        first: DateTime<Tz>,
        missing: usize,
    },
    #[error("{series}: series is not gap-free at {at}")]
    NotGapFree { series: Source, at: DateTime<Tz> },
    #[error("meter and PV series use different interval widths")]
    StepMismatch,
    #[error("meter and PV series do not overlap")]
    NoOverlap,
}
