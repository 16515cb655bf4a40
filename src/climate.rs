//! Temperature/humidity sensors registered on the AiSEG2.
//!
//! The settings screen does not render them as markup; it embeds the device list as a
//! JSON literal passed to an `init(...)` call in an inline script.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::ExtractError;
use crate::fetcher::{HtmlDocument, PageId};
use crate::normalizer::{slugify, KeyAllocator};
use crate::reading::{Reading, ReadingKind, Unit};

#[derive(Debug, Clone, PartialEq)]
pub struct ClimateSensor {
    pub device_id: String,
    pub name: String,
    pub location: String,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub online: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitPayload {
    reg_dev_list: RegisteredDevices,
}

#[derive(Debug, Deserialize)]
struct RegisteredDevices {
    #[serde(default)]
    list: Vec<RegisteredDevice>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisteredDevice {
    #[serde(default)]
    node_id: Value,
    #[serde(default)]
    device_name: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    state: Option<DeviceState>,
}

#[derive(Debug, Deserialize)]
struct DeviceState {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    connection: Option<String>,
}

fn init_call() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)init\((\{.*?\})\);</script>").expect("valid regex"))
}

fn temperature_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(-?\d+(?:\.\d+)?)℃").expect("valid regex"))
}

fn humidity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)％").expect("valid regex"))
}

fn mismatch(detail: impl Into<String>) -> ExtractError {
    ExtractError::StructureMismatch {
        page: PageId::Climate,
        detail: detail.into(),
    }
}

/// Lists the temperature/humidity sensors on the climate settings page.
pub fn extract_sensors(document: &HtmlDocument) -> Result<Vec<ClimateSensor>, ExtractError> {
    let payload = init_call()
        .captures(&document.body)
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| mismatch("init() payload not found"))?;
    let payload: InitPayload = serde_json::from_str(payload.as_str())
        .map_err(|e| mismatch(format!("init() payload is not valid JSON: {e}")))?;

    let sensors: Vec<ClimateSensor> = payload
        .reg_dev_list
        .list
        .into_iter()
        .filter_map(|device| {
            let state = device.state?;
            let label = state.label.filter(|label| label.contains('℃'))?;

            let temperature = temperature_re()
                .captures(&label)
                .and_then(|caps| caps[1].parse::<f64>().ok());
            let humidity = humidity_re()
                .captures(&label)
                .and_then(|caps| caps[1].parse::<f64>().ok());
            let device_id = match device.node_id {
                Value::String(id) => id,
                Value::Null => String::new(),
                other => other.to_string(),
            };

            Some(ClimateSensor {
                device_id,
                name: device.device_name.unwrap_or_else(|| "Unknown".to_string()),
                location: device.location.unwrap_or_else(|| "未設定".to_string()),
                temperature,
                humidity,
                online: state.connection.as_deref() == Some("online"),
            })
        })
        .collect();

    debug!("Found {} climate sensors", sensors.len());
    Ok(sensors)
}

/// Readings for the sensors that are online; offline ones report nothing.
///
/// Keys come from `keys`, so they never clash with readings already in the cycle.
/// Sensors without a node id are keyed by their name.
pub fn sensor_readings(sensors: &[ClimateSensor], keys: &mut KeyAllocator) -> Vec<Reading> {
    let mut readings = Vec::new();
    for sensor in sensors {
        if !sensor.online {
            debug!("Climate sensor {} is offline", sensor.name);
            continue;
        }
        let id = if sensor.device_id.trim().is_empty() {
            slugify(&sensor.name)
        } else {
            slugify(&sensor.device_id)
        };
        if let Some(temperature) = sensor.temperature {
            readings.push(Reading {
                key: keys.assign(format!("climate-{id}-temperature")),
                value: temperature,
                unit: Unit::Celsius,
                kind: ReadingKind::Temperature,
                name: Some(format!("{} Temperature", sensor.name)),
            });
        }
        if let Some(humidity) = sensor.humidity {
            readings.push(Reading {
                key: keys.assign(format!("climate-{id}-humidity")),
                value: humidity,
                unit: Unit::Percent,
                kind: ReadingKind::Humidity,
                name: Some(format!("{} Humidity", sensor.name)),
            });
        }
    }
    readings
}
