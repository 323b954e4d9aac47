use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat};
use log::debug;
use serde::Deserialize;

use crate::reading::{round_to, RawReading, Source};

/// Tasmota SML sensor message, e.g.
/// `{"Time":"2024-03-16T06:44:08","MT681":{"Total_in":16.4396,"Power_cur":80,"Total_out":14.6403}}`.
/// `Time` is local wall-clock time.
#[derive(Debug, Deserialize)]
struct TasmotaSensor {
    #[serde(rename = "Time")]
    time: String,
    #[serde(rename = "MT681")]
    meter: TasmotaMeter,
}

#[derive(Debug, Deserialize)]
struct TasmotaMeter {
    #[serde(rename = "Total_in")]
    total_in: Option<f64>,
    #[serde(rename = "Power_cur")]
    power_cur: Option<f64>,
    #[serde(rename = "Total_out")]
    total_out: Option<f64>,
}

/// Shelly Plus plug `status/switch:0` message (only the fields used here).
#[derive(Debug, Deserialize)]
struct ShellySwitch {
    /// Instantaneous power (W)
    apower: Option<f64>,
    aenergy: ShellyEnergy,
}

#[derive(Debug, Deserialize)]
struct ShellyEnergy {
    /// Wh since installation
    total: f64,
    /// mWh of the last three minutes
    #[serde(default)]
    by_minute: Vec<f64>,
    /// Unix seconds. Documented as the start of the last minute, but the
    /// device actually sends the current time.
    minute_ts: i64,
}

/// Decode one broker payload into an unparsed reading of `source`.
pub fn decode(source: Source, payload: &[u8]) -> Result<RawReading> {
    match source {
        Source::Meter => decode_tasmota(payload),
        Source::Pv => decode_shelly(payload),
    }
}

fn decode_tasmota(payload: &[u8]) -> Result<RawReading> {
    let msg: TasmotaSensor =
        serde_json::from_slice(payload).context("Failed to parse Tasmota payload")?;
    debug!("Tasmota: {:?}", msg);

    Ok(RawReading {
        time: msg.time,
        direct_power: msg.meter.power_cur.map(|v| v.to_string()),
        energy_in: msg.meter.total_in.map(|v| v.to_string()),
        energy_out: msg.meter.total_out.map(|v| v.to_string()),
        instant_power: None,
    })
}

fn decode_shelly(payload: &[u8]) -> Result<RawReading> {
    let msg: ShellySwitch =
        serde_json::from_slice(payload).context("Failed to parse Shelly payload")?;
    debug!("Shelly: {:?}", msg);

    let energy = msg.aenergy;
    let time = DateTime::from_timestamp(energy.minute_ts, 0)
        .ok_or_else(|| anyhow!("Shelly minute_ts out of range: {}", energy.minute_ts))?;

    // Average power of the previous full minute. Index 1 rather than 0: the
    // first entry is still accumulating when the message is sent.
    let watt_last = energy
        .by_minute
        .get(1)
        .map(|mwh| round_to(mwh * 60.0 / 1000.0, 1));

    Ok(RawReading {
        time: time.to_rfc3339_opts(SecondsFormat::Secs, true),
        direct_power: watt_last.map(|v| v.to_string()),
        energy_in: Some(round_to(energy.total / 1000.0, 3).to_string()),
        energy_out: None,
        instant_power: msg.apower.map(|v| v.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasmota_sensor() {
        let payload = br#"{"Time":"2024-03-16T06:44:08","MT681":{"Total_in":16.4396,"Power_cur":80,"Total_out":14.6403}}"#;
        let raw = decode(Source::Meter, payload).unwrap();
        assert_eq!(
            raw,
            RawReading {
                time: "2024-03-16T06:44:08".to_string(),
                direct_power: Some("80".to_string()),
                energy_in: Some("16.4396".to_string()),
                energy_out: Some("14.6403".to_string()),
                instant_power: None,
            }
        );
    }

    #[test]
    fn tasmota_without_power() {
        let payload = br#"{"Time":"2024-03-16T06:44:08","MT681":{"Total_in":16.4396,"Total_out":14.6403}}"#;
        let raw = decode(Source::Meter, payload).unwrap();
        assert_eq!(raw.direct_power, None);
    }

    #[test]
    fn shelly_switch_status() {
        let payload = br#"{
            "id": 0,
            "apower": 251.3,
            "aenergy": {"total": 12345.678, "by_minute": [1200.0, 4175.0, 4210.0], "minute_ts": 1718013600},
            "temperature": {"tC": 41.2}
        }"#;
        let raw = decode(Source::Pv, payload).unwrap();
        assert_eq!(raw.time, "2024-06-10T10:00:00Z");
        // 4175 mWh in one minute = 250.5 W
        assert_eq!(raw.direct_power.as_deref(), Some("250.5"));
        assert_eq!(raw.energy_in.as_deref(), Some("12.346"));
        assert_eq!(raw.energy_out, None);
        assert_eq!(raw.instant_power.as_deref(), Some("251.3"));
    }

    #[test]
    fn shelly_short_by_minute() {
        let payload = br#"{"aenergy": {"total": 1000.0, "by_minute": [5.0], "minute_ts": 1718013600}}"#;
        let raw = decode(Source::Pv, payload).unwrap();
        assert_eq!(raw.direct_power, None);
        assert_eq!(raw.energy_in.as_deref(), Some("1"));
        assert_eq!(raw.instant_power, None);
    }

    #[test]
    fn invalid_json_rejected() {
        assert!(decode(Source::Pv, b"{not json").is_err());
        assert!(decode(Source::Meter, br#"{"Time":"x"}"#).is_err());
    }
}
