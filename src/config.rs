use anyhow::{anyhow, bail, Result};
use chrono::NaiveDate;
use chrono_tz::Tz;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::resample::Window;

#[derive(Parser, Debug)]
#[command(
    name = "pvsavings",
    about = "Grid meter and PV plug recorder with gap-filled self-consumption analysis"
)]
pub struct Config {
    /// IANA time zone for local timestamps and day boundaries
    #[arg(long, global = true, default_value = "Europe/Berlin")]
    pub timezone: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Subscribe to the broker and append readings to the TSV files
    Record(RecordArgs),
    /// Build gap-free power series from the TSV files and report daily savings
    Analyze(AnalyzeArgs),
}

#[derive(Args, Debug)]
pub struct RecordArgs {
    /// MQTT broker hostname
    #[arg(long, default_value = "127.0.0.1")]
    pub mqtt_host: String,

    /// MQTT broker port
    #[arg(long, default_value_t = 1883)]
    pub mqtt_port: u16,

    /// MQTT client ID
    #[arg(long, default_value = "pvsavings-recorder")]
    pub mqtt_client_id: String,

    #[arg(long)]
    pub mqtt_username: Option<String>,

    #[arg(long)]
    pub mqtt_password: Option<String>,

    /// Tasmota SML sensor topic of the grid meter
    #[arg(long, default_value = "tele/tasmota_MT681/SENSOR")]
    pub meter_topic: String,

    /// Shelly plug status topic of the PV inverter. One plug per PV file:
    /// counters of different plugs must not be mixed.
    #[arg(long, default_value = "Plug3/status/switch:0")]
    pub pv_topic: String,

    #[arg(long, default_value = "data-meter.tsv")]
    pub meter_file: PathBuf,

    #[arg(long, default_value = "data-pv.tsv")]
    pub pv_file: PathBuf,

    /// Readings buffered between the broker connection and the file writer
    #[arg(long, default_value_t = 100)]
    pub queue_capacity: usize,

    /// Stop after this many readings were written (runs forever if omitted)
    #[arg(long)]
    pub max_readings: Option<usize>,
}

#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    #[arg(long, default_value = "data-meter.tsv")]
    pub meter_file: PathBuf,

    #[arg(long, default_value = "data-pv.tsv")]
    pub pv_file: PathBuf,

    /// First local day to analyse (inclusive)
    #[arg(long, requires = "to")]
    pub from: Option<NaiveDate>,

    /// Last local day boundary (exclusive)
    #[arg(long, requires = "from")]
    pub to: Option<NaiveDate>,

    /// Resampling interval in seconds
    #[arg(long, default_value_t = 60)]
    pub interval_secs: u32,

    /// Daily report
    #[arg(long, default_value = "savings.tsv")]
    pub output: PathBuf,

    /// Optional per-interval dump of the merged series
    #[arg(long)]
    pub minutes_output: Option<PathBuf>,
}

impl Config {
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse()
            .map_err(|e| anyhow!("Invalid time zone {:?}: {}", self.timezone, e))
    }
}

impl AnalyzeArgs {
    /// `[from 00:00, to 00:00)` in local time, if both days were given.
    pub fn window(&self, tz: Tz) -> Result<Option<Window>> {
        let (Some(from), Some(to)) = (self.from, self.to) else {
            return Ok(None);
        };
        if from >= to {
            bail!("--from {} must be before --to {}", from, to);
        }
        Ok(Some(Window::new(local_midnight(from, tz)?, local_midnight(to, tz)?)))
    }
}

fn local_midnight(day: NaiveDate, tz: Tz) -> Result<chrono::DateTime<Tz>> {
    day.and_hms_opt(0, 0, 0)
        .and_then(|naive| naive.and_local_timezone(tz).earliest())
        .ok_or_else(|| anyhow!("Midnight of {} does not exist in {}", day, tz))
}
