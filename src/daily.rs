use chrono::NaiveDate;
use std::collections::BTreeMap;

use crate::reading::{round_to, CounterSnapshot, Reading};
use crate::savings::DailySavings;

/// Counters have at most 0.0001 kWh resolution; keep deltas free of float noise.
const DELTA_DECIMALS: i32 = 4;

/// Net counter change over one calendar day, from the first reading of the
/// day to the first reading of the next day.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyDelta {
    pub day: NaiveDate,
    pub energy_in_kwh: Option<f64>,
    pub energy_out_kwh: Option<f64>,
}

/// One row of the final report. Parts that could not be computed are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct SavingsRecord {
    pub day: NaiveDate,
    pub energy_imported_kwh: Option<f64>,
    pub energy_exported_kwh: Option<f64>,
    pub energy_pv_produced_kwh: Option<f64>,
    pub energy_saved_kwh: Option<f64>,
}

/// Day-boundary counter deltas, independent of the power series.
///
/// Every calendar day between the first and last reading gets a row. A day
/// without readings has no first value, so its delta and the delta of the
/// day before are undefined, as is the delta of the last day.
pub fn daily_deltas(readings: &[Reading]) -> Vec<DailyDelta> {
    let mut firsts: BTreeMap<NaiveDate, CounterSnapshot> = BTreeMap::new();
    for reading in readings {
        if let Some(counters) = reading.counters {
            firsts.entry(reading.timestamp.date_naive()).or_insert(counters);
        }
    }

    let (Some(first_day), Some(last_day)) = (
        firsts.keys().next().copied(),
        firsts.keys().next_back().copied(),
    ) else {
        return Vec::new();
    };

    first_day
        .iter_days()
        .take_while(|day| *day <= last_day)
        .map(|day| {
            let this = firsts.get(&day);
            let next = day.succ_opt().and_then(|next| firsts.get(&next));
            let (energy_in_kwh, energy_out_kwh) = match (this, next) {
                (Some(this), Some(next)) => (
                    Some(round_to(next.energy_in - this.energy_in, DELTA_DECIMALS)),
                    next.energy_out
                        .zip(this.energy_out)
                        .map(|(n, t)| round_to(n - t, DELTA_DECIMALS)),
                ),
                _ => (None, None),
            };
            DailyDelta {
                day,
                energy_in_kwh,
                energy_out_kwh,
            }
        })
        .collect()
}

/// Outer join of meter deltas, PV deltas and power-path savings by day.
pub fn savings_records(
    meter: &[DailyDelta],
    pv: &[DailyDelta],
    savings: &[DailySavings],
) -> Vec<SavingsRecord> {
    let mut days: BTreeMap<NaiveDate, SavingsRecord> = BTreeMap::new();

    for d in meter {
        let record = record_for(&mut days, d.day);
        record.energy_imported_kwh = d.energy_in_kwh;
        record.energy_exported_kwh = d.energy_out_kwh;
    }
    for d in pv {
        record_for(&mut days, d.day).energy_pv_produced_kwh = d.energy_in_kwh;
    }
    for s in savings {
        record_for(&mut days, s.day).energy_saved_kwh = Some(s.saved_kwh);
    }

    days.into_values().collect()
}

fn record_for(days: &mut BTreeMap<NaiveDate, SavingsRecord>, day: NaiveDate) -> &mut SavingsRecord {
    days.entry(day).or_insert_with(|| SavingsRecord {
        day,
        energy_imported_kwh: None,
        energy_exported_kwh: None,
        energy_pv_produced_kwh: None,
        energy_saved_kwh: None,
    })
}
