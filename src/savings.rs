use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use log::{debug, info};
use std::collections::BTreeMap;

use crate::error::SeriesError;
use crate::reading::{round_to, Source};
use crate::resample::SeriesOutput;

/// Energy balance of one interval of the merged meter and PV series.
#[derive(Debug, Clone, PartialEq)]
pub struct MinuteBalance {
    pub start: DateTime<Tz>,
    /// Grid flow in W, positive = importing.
    pub meter: f64,
    /// PV production in W.
    pub pv: f64,
    /// What the house would draw from the grid without PV, floored at 0.
    pub total_demand: f64,
    /// Meter power clipped at 0.
    pub grid_import: f64,
    /// PV power that displaced grid import.
    pub self_consumed: f64,
    pub energy_saved_kwh: f64,
    pub grid_import_kwh: f64,
}

/// Savings of one calendar day from the power path.
#[derive(Debug, Clone, PartialEq)]
pub struct DailySavings {
    pub day: NaiveDate,
    /// Rounded to 0.1 kWh.
    pub saved_kwh: f64,
    /// Sum of clipped meter power, rounded to 0.001 kWh.
    pub grid_import_kwh: f64,
}

/// Check that a series is strictly evenly spaced with no missing interval.
fn ensure_gap_free(series: &SeriesOutput) -> Result<(), SeriesError> {
    for pair in series.points.windows(2) {
        if pair[1].start - pair[0].start != series.step {
            return Err(SeriesError::NotGapFree {
                series: series.source,
                at: pair[1].start,
            });
        }
    }
    Ok(())
}

/// Align meter and PV power on their common interval starts.
///
/// Both sides must be gap-free. The union of both time indexes is built and
/// only intervals present on both sides are kept.
pub fn merge(
    meter: &SeriesOutput,
    pv: &SeriesOutput,
) -> Result<Vec<(DateTime<Tz>, f64, f64)>, SeriesError> {
    ensure_gap_free(meter)?;
    ensure_gap_free(pv)?;
    if meter.step != pv.step {
        return Err(SeriesError::StepMismatch);
    }

    let mut union: BTreeMap<DateTime<Tz>, (Option<f64>, Option<f64>)> = BTreeMap::new();
    for p in &meter.points {
        union.entry(p.start).or_default().0 = Some(p.power);
    }
    for p in &pv.points {
        union.entry(p.start).or_default().1 = Some(p.power);
    }

    let total = union.len();
    let merged: Vec<_> = union
        .into_iter()
        .filter_map(|(start, sides)| match sides {
            (Some(m), Some(p)) => Some((start, m, p)),
            _ => None,
        })
        .collect();

    if merged.is_empty() {
        return Err(SeriesError::NoOverlap);
    }
    if merged.len() < total {
        info!(
            "{} interval(s) present in only one of the {} and {} series",
            total - merged.len(),
            Source::Meter,
            Source::Pv
        );
    }
    Ok(merged)
}

/// Apply the sharing rule to one interval of `step_secs` seconds.
pub fn balance(start: DateTime<Tz>, meter: f64, pv: f64, step_secs: i64) -> MinuteBalance {
    let total_demand = (meter + pv).max(0.0);
    let self_consumed = total_demand.min(pv).max(0.0);
    let grid_import = meter.max(0.0);
    // W * interval -> kWh
    let hours = step_secs as f64 / 3600.0;

    MinuteBalance {
        start,
        meter,
        pv,
        total_demand,
        grid_import,
        self_consumed,
        energy_saved_kwh: self_consumed * hours / 1000.0,
        grid_import_kwh: grid_import * hours / 1000.0,
    }
}

/// Merge both gap-free series and compute the per-interval balance.
pub fn self_consumption(
    meter: &SeriesOutput,
    pv: &SeriesOutput,
) -> Result<Vec<MinuteBalance>, SeriesError> {
    let step_secs = meter.step.num_seconds();
    let balances: Vec<_> = merge(meter, pv)?
        .into_iter()
        .map(|(start, m, p)| balance(start, m, p, step_secs))
        .collect();
    debug!("computed {} balance interval(s)", balances.len());
    Ok(balances)
}

/// Sum the saved energy per local calendar day.
pub fn daily_savings(balances: &[MinuteBalance]) -> Vec<DailySavings> {
    let mut days: BTreeMap<NaiveDate, (f64, f64)> = BTreeMap::new();
    for b in balances {
        let sums = days.entry(b.start.date_naive()).or_default();
        sums.0 += b.energy_saved_kwh;
        sums.1 += b.grid_import_kwh;
    }

    days.into_iter()
        .map(|(day, (saved, import))| DailySavings {
            day,
            saved_kwh: round_to(saved, 1),
            grid_import_kwh: round_to(import, 3),
        })
        .collect()
}
