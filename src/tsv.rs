use anyhow::{bail, Context, Result};
use chrono::DateTime;
use chrono_tz::Tz;
use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::daily::SavingsRecord;
use crate::pipeline::Analysis;
use crate::reading::{CounterSnapshot, RawReading, Reading, Source};
use crate::resample::SeriesPoint;

/// ISO 8601 local time with offset, e.g. `2024-06-10T12:00:00+02:00`.
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

const TIME_COLUMN: &str = "time";

/// Rows are tab-separated and never quoted; values must not contain tabs or newlines.
fn writer_builder() -> csv::WriterBuilder {
    let mut builder = csv::WriterBuilder::new();
    builder
        .delimiter(b'\t')
        .terminator(csv::Terminator::Any(b'\n'))
        .quote_style(csv::QuoteStyle::Never);
    builder
}

pub fn format_time(ts: &DateTime<Tz>) -> String {
    ts.format(TIME_FORMAT).to_string()
}

fn format_value(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Read the rows of one source from a tab-separated file with a header.
/// Columns other than `time` and the source's measurement columns are ignored.
pub fn read_raw(path: &Path, source: Source) -> Result<Vec<RawReading>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let headers = reader
        .headers()
        .with_context(|| format!("Failed to read header of {}", path.display()))?
        .clone();
    let position = |name: &str| headers.iter().position(|h| h == name);

    let columns = source.columns();
    let Some(time_idx) = position(TIME_COLUMN) else {
        bail!("{} has no '{}' column", path.display(), TIME_COLUMN);
    };
    let direct_idx = position(columns.direct_power);
    let in_idx = position(columns.energy_in);
    let out_idx = columns.energy_out.and_then(position);
    let instant_idx = columns.instant_power.and_then(position);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record =
            record.with_context(|| format!("Failed to read row of {}", path.display()))?;
        let field = |idx: Option<usize>| {
            idx.and_then(|i| record.get(i))
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        rows.push(RawReading {
            time: record.get(time_idx).unwrap_or_default().to_string(),
            direct_power: field(direct_idx),
            energy_in: field(in_idx),
            energy_out: field(out_idx),
            instant_power: field(instant_idx),
        });
    }

    info!("Read {} {} row(s) from {}", rows.len(), source, path.display());
    Ok(rows)
}

/// Appends normalized readings of one source to its file, writing the header
/// first when the file is new or empty.
pub struct TsvAppender {
    writer: csv::Writer<File>,
    source: Source,
}

impl TsvAppender {
    pub fn open(path: &Path, source: Source) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {} for appending", path.display()))?;
        let is_empty = file.metadata().map(|m| m.len() == 0).unwrap_or(true);

        let mut writer = writer_builder().has_headers(false).from_writer(file);
        if is_empty {
            let columns = source.columns();
            let mut header = vec![TIME_COLUMN, columns.direct_power, columns.energy_in];
            header.extend(columns.energy_out);
            header.extend(columns.instant_power);
            writer.write_record(&header)?;
            writer.flush()?;
        }

        Ok(Self { writer, source })
    }

    pub fn append(&mut self, reading: &Reading) -> Result<()> {
        let counters = reading.counters;
        let mut row = vec![
            format_time(&reading.timestamp),
            format_value(reading.direct_power),
            format_value(counters.map(|c| c.energy_in)),
        ];
        if self.source.is_bidirectional() {
            row.push(format_value(counters.and_then(|c| c.energy_out)));
        }
        if self.source.columns().instant_power.is_some() {
            row.push(format_value(reading.instant_power));
        }
        self.writer.write_record(&row)?;
        self.writer.flush()?;
        debug!("Appended {} row at {}", self.source, row[0]);
        Ok(())
    }
}

#[derive(Serialize)]
struct SavingsRow {
    day: String,
    #[serde(rename = "kWh_in")]
    kwh_in: Option<f64>,
    #[serde(rename = "kWh_out")]
    kwh_out: Option<f64>,
    #[serde(rename = "kWh_pv")]
    kwh_pv: Option<f64>,
    #[serde(rename = "kWh_saved")]
    kwh_saved: Option<f64>,
}

/// Write the daily report; undefined values become empty cells.
pub fn write_savings(path: &Path, records: &[SavingsRecord]) -> Result<()> {
    let mut writer = writer_builder()
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for r in records {
        writer.serialize(SavingsRow {
            day: r.day.format("%Y-%m-%d").to_string(),
            kwh_in: r.energy_imported_kwh,
            kwh_out: r.energy_exported_kwh,
            kwh_pv: r.energy_pv_produced_kwh,
            kwh_saved: r.energy_saved_kwh,
        })?;
    }
    writer.flush()?;
    info!("Wrote {} day(s) to {}", records.len(), path.display());
    Ok(())
}

#[derive(Serialize)]
struct MinuteRow {
    time: String,
    meter: f64,
    pv: f64,
    sum: f64,
    #[serde(rename = "meter+")]
    meter_plus: f64,
    saving: f64,
    #[serde(rename = "kWh_saved")]
    kwh_saved: f64,
    #[serde(rename = "kWh_total_in")]
    kwh_total_in: Option<f64>,
    #[serde(rename = "kWh_total_out")]
    kwh_total_out: Option<f64>,
    #[serde(rename = "kWh_total")]
    kwh_total_pv: Option<f64>,
}

fn counters_by_start(points: &[SeriesPoint]) -> BTreeMap<DateTime<Tz>, CounterSnapshot> {
    points
        .iter()
        .filter_map(|p| p.counters.map(|c| (p.start, c)))
        .collect()
}

/// Write the merged per-interval series with the carried counters of both sources.
pub fn write_minutes(path: &Path, analysis: &Analysis) -> Result<()> {
    let meter_counters = counters_by_start(&analysis.meter.series.points);
    let pv_counters = counters_by_start(&analysis.pv.series.points);

    let mut writer = writer_builder()
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for b in &analysis.balances {
        let meter = meter_counters.get(&b.start);
        writer.serialize(MinuteRow {
            time: format_time(&b.start),
            meter: b.meter,
            pv: b.pv,
            sum: b.total_demand,
            meter_plus: b.grid_import,
            saving: b.self_consumed,
            kwh_saved: b.energy_saved_kwh,
            kwh_total_in: meter.map(|c| c.energy_in),
            kwh_total_out: meter.and_then(|c| c.energy_out),
            kwh_total_pv: pv_counters.get(&b.start).map(|c| c.energy_in),
        })?;
    }
    writer.flush()?;
    info!("Wrote {} interval(s) to {}", analysis.balances.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Normalizer;
    use chrono::{NaiveDate, TimeZone};
    use chrono_tz::Europe::Berlin;
    use std::io::Write;

    #[test]
    fn reads_pandas_style_export() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "time\troom\tkWh_total\twatt_last\twatt_now\n\
             2024-06-10T10:00:00Z\tBalkon\t12.345\t250.5\t251\n\
             2024-06-10T10:01:00Z\tBalkon\t12.349\t\t240\n"
        )
        .unwrap();

        let rows = read_raw(file.path(), Source::Pv).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].time, "2024-06-10T10:00:00Z");
        assert_eq!(rows[0].direct_power.as_deref(), Some("250.5"));
        assert_eq!(rows[0].energy_in.as_deref(), Some("12.345"));
        assert_eq!(rows[1].direct_power, None);
        assert_eq!(rows[1].energy_out, None);
        assert_eq!(rows[0].instant_power.as_deref(), Some("251"));
    }

    #[test]
    fn pv_rows_keep_instant_power() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pv.tsv");
        let reading = Reading {
            timestamp: Berlin.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap(),
            direct_power: Some(250.5),
            counters: Some(CounterSnapshot {
                energy_in: 12.346,
                energy_out: None,
            }),
            instant_power: Some(251.3),
        };
        TsvAppender::open(&path, Source::Pv).unwrap().append(&reading).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "time\twatt_last\tkWh_total\twatt_now\n2024-06-10T12:00:00+02:00\t250.5\t12.346\t251.3\n"
        );
        let rows = read_raw(&path, Source::Pv).unwrap();
        let batch = Normalizer::new(Source::Pv, Berlin).normalize(&rows);
        assert_eq!(batch.readings, vec![reading]);
    }

    #[test]
    fn missing_time_column_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "when\twatt\n1\t2\n").unwrap();
        assert!(read_raw(file.path(), Source::Meter).is_err());
    }

    #[test]
    fn appended_rows_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meter.tsv");
        let ts = Berlin.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
        let reading = Reading {
            timestamp: ts,
            direct_power: Some(80.0),
            counters: Some(CounterSnapshot {
                energy_in: 16.4396,
                energy_out: Some(14.6403),
            }),
            instant_power: None,
        };

        // two separate opens: the header must only be written once
        TsvAppender::open(&path, Source::Meter).unwrap().append(&reading).unwrap();
        let mut later = reading.clone();
        later.timestamp = ts + chrono::Duration::minutes(1);
        later.direct_power = None;
        TsvAppender::open(&path, Source::Meter).unwrap().append(&later).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("time\twatt\tkWh_total_in\tkWh_total_out\n"));
        assert!(text.contains("2024-06-10T12:00:00+02:00\t80\t16.4396\t14.6403\n"));

        let rows = read_raw(&path, Source::Meter).unwrap();
        let batch = Normalizer::new(Source::Meter, Berlin).normalize(&rows);
        assert_eq!(batch.malformed, 0);
        assert_eq!(batch.readings, vec![reading, later]);
    }

    #[test]
    fn minutes_carry_both_counters() {
        let dir = tempfile::tempdir().unwrap();
        let meter_path = dir.path().join("meter.tsv");
        let pv_path = dir.path().join("pv.tsv");
        std::fs::write(
            &meter_path,
            "time\twatt\tkWh_total_in\tkWh_total_out\n\
             2024-06-10T12:00:00+02:00\t300\t10\t5\n\
             2024-06-10T12:01:00+02:00\t300\t10.005\t5\n",
        )
        .unwrap();
        std::fs::write(
            &pv_path,
            "time\twatt_last\tkWh_total\n\
             2024-06-10T12:00:00+02:00\t200\t3\n\
             2024-06-10T12:01:00+02:00\t200\t3.003\n",
        )
        .unwrap();

        let meter = read_raw(&meter_path, Source::Meter).unwrap();
        let pv = read_raw(&pv_path, Source::Pv).unwrap();
        let analysis = crate::pipeline::Pipeline::new(Berlin, chrono::Duration::minutes(1))
            .analyze(&meter, &pv, None)
            .unwrap();

        let out = dir.path().join("minutes.tsv");
        write_minutes(&out, &analysis).unwrap();
        let text = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines[0],
            "time\tmeter\tpv\tsum\tmeter+\tsaving\tkWh_saved\tkWh_total_in\tkWh_total_out\tkWh_total"
        );
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("2024-06-10T12:01:00+02:00\t300.0\t200.0\t500.0\t300.0\t200.0\t"));
        assert!(lines[2].ends_with("\t10.005\t5.0\t3.003"));
    }

    #[test]
    fn savings_written_with_empty_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("savings.tsv");
        let records = vec![SavingsRecord {
            day: NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
            energy_imported_kwh: Some(5.5),
            energy_exported_kwh: Some(1.25),
            energy_pv_produced_kwh: None,
            energy_saved_kwh: Some(0.7),
        }];
        write_savings(&path, &records).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "day\tkWh_in\tkWh_out\tkWh_pv\tkWh_saved\n2024-06-10\t5.5\t1.25\t\t0.7\n"
        );
    }
}
