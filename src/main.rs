mod config;
mod daily;
mod error;
mod mqtt;
mod normalize;
mod payload;
mod pipeline;
mod rate;
mod reading;
mod resample;
mod savings;
mod tsv;

use anyhow::{Context, Result};
use chrono::Duration;
use chrono_tz::Tz;
use clap::Parser;
use log::{info, warn};

use config::{AnalyzeArgs, Command, Config};
use pipeline::Pipeline;
use reading::Source;

fn main() -> Result<()> {
    env_logger::init();

    let config = Config::parse();
    let tz = config.tz()?;
    info!("Starting pvsavings ({})", tz);

    match &config.command {
        Command::Record(args) => mqtt::record(args, tz),
        Command::Analyze(args) => analyze(args, tz),
    }
}

fn analyze(args: &AnalyzeArgs, tz: Tz) -> Result<()> {
    let meter = tsv::read_raw(&args.meter_file, Source::Meter)?;
    let pv = tsv::read_raw(&args.pv_file, Source::Pv)?;
    let window = args.window(tz)?;

    let pipeline = Pipeline::new(tz, Duration::seconds(i64::from(args.interval_secs.max(1))));
    let analysis = pipeline
        .analyze(&meter, &pv, window)
        .context("Failed to build gap-free series")?;

    for run in [&analysis.meter, &analysis.pv] {
        let d = run.diagnostics;
        if d.malformed > 0 || d.zero_elapsed > 0 {
            warn!(
                "{}: {} malformed reading(s) dropped, {} zero-elapsed pair(s) skipped",
                run.series.source, d.malformed, d.zero_elapsed
            );
        }
    }

    for d in &analysis.daily {
        info!(
            "{}: grid import from power series {} kWh",
            d.day, d.grid_import_kwh
        );
    }
    for r in &analysis.records {
        info!(
            "{}: in {:?} kWh, out {:?} kWh, pv {:?} kWh, saved {:?} kWh",
            r.day,
            r.energy_imported_kwh,
            r.energy_exported_kwh,
            r.energy_pv_produced_kwh,
            r.energy_saved_kwh
        );
    }

    tsv::write_savings(&args.output, &analysis.records)?;
    if let Some(path) = &args.minutes_output {
        tsv::write_minutes(path, &analysis)?;
    }
    Ok(())
}
