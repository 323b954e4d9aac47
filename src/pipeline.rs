use chrono::Duration;
use chrono_tz::Tz;
use log::info;

use crate::daily::{daily_deltas, savings_records, SavingsRecord};
use crate::error::SeriesError;
use crate::normalize::Normalizer;
use crate::rate::{reconstruct, PV_SMOOTHING_WINDOW};
use crate::reading::{Diagnostics, RawReading, Reading, Source};
use crate::resample::{Resampler, SeriesOutput, Window};
use crate::savings::{daily_savings, self_consumption, DailySavings, MinuteBalance};

/// Result of running one source through normalize -> rate -> resample.
#[derive(Debug)]
pub struct SourceRun {
    /// All normalized readings, including those outside the window: the
    /// counter delta of a window's last day needs the next day's first reading.
    pub readings: Vec<Reading>,
    pub window: Window,
    pub series: SeriesOutput,
    pub diagnostics: Diagnostics,
}

/// Everything one analysis produces.
#[derive(Debug)]
pub struct Analysis {
    pub meter: SourceRun,
    pub pv: SourceRun,
    pub balances: Vec<MinuteBalance>,
    pub daily: Vec<DailySavings>,
    pub records: Vec<SavingsRecord>,
}

pub struct Pipeline {
    tz: Tz,
    step: Duration,
}

impl Pipeline {
    pub fn new(tz: Tz, step: Duration) -> Self {
        Self { tz, step }
    }

    /// Build the gap-free series of one source. Without an explicit window
    /// the series covers all of its readings.
    pub fn run_source(
        &self,
        source: Source,
        raws: &[RawReading],
        window: Option<Window>,
    ) -> Result<SourceRun, SeriesError> {
        let batch = Normalizer::new(source, self.tz).normalize(raws);
        let window = window
            .or_else(|| Window::covering(&batch.readings, self.step))
            .ok_or(SeriesError::EmptyInputWindow { series: source })?;

        let mut rates = reconstruct(source, &batch.readings);
        if source == Source::Pv {
            rates = rates.smoothed(PV_SMOOTHING_WINDOW);
        }
        let series =
            Resampler::new(source, self.step).resample(&batch.readings, &rates, window)?;

        let diagnostics = Diagnostics {
            malformed: batch.malformed,
            zero_elapsed: rates.zero_elapsed,
        };
        info!(
            "{}: {} reading(s) -> {} interval(s) from {} ({} malformed, {} zero-elapsed)",
            source,
            batch.readings.len(),
            series.points.len(),
            window.start,
            diagnostics.malformed,
            diagnostics.zero_elapsed
        );

        Ok(SourceRun {
            readings: batch.readings,
            window,
            series,
            diagnostics,
        })
    }

    /// Full run: both series, per-interval balance, daily totals and the
    /// joined report. Either source failing fails the run.
    pub fn analyze(
        &self,
        meter_raw: &[RawReading],
        pv_raw: &[RawReading],
        window: Option<Window>,
    ) -> Result<Analysis, SeriesError> {
        let meter = self.run_source(Source::Meter, meter_raw, window)?;
        let pv = self.run_source(Source::Pv, pv_raw, window)?;

        let balances = self_consumption(&meter.series, &pv.series)?;
        let daily = daily_savings(&balances);
        let records = savings_records(
            &daily_deltas(&meter.readings),
            &daily_deltas(&pv.readings),
            &daily,
        )
        .into_iter()
        .filter(|r| meter.window.overlaps_day(r.day) || pv.window.overlaps_day(r.day))
        .collect();

        Ok(Analysis {
            meter,
            pv,
            balances,
            daily,
            records,
        })
    }
}
