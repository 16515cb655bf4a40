use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{NormalizeError, PollError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Unit {
    #[serde(rename = "kWh")]
    KilowattHour,
    #[serde(rename = "W")]
    Watt,
    #[serde(rename = "°C")]
    Celsius,
    #[serde(rename = "%")]
    Percent,
}

impl Unit {
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::KilowattHour => "kWh",
            Unit::Watt => "W",
            Unit::Celsius => "°C",
            Unit::Percent => "%",
        }
    }

    pub fn device_class(&self) -> &'static str {
        match self {
            Unit::KilowattHour => "energy",
            Unit::Watt => "power",
            Unit::Celsius => "temperature",
            Unit::Percent => "humidity",
        }
    }

    /// Energy figures on the AiSEG2 are running totals that reset at midnight;
    /// everything else is a point-in-time measurement.
    pub fn state_class(&self) -> &'static str {
        match self {
            Unit::KilowattHour => "total",
            Unit::Watt | Unit::Celsius | Unit::Percent => "measurement",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingKind {
    TotalUsage,
    Purchased,
    Sold,
    Generated,
    Circuit,
    Temperature,
    Humidity,
}

impl ReadingKind {
    pub const TOTALS: [ReadingKind; 4] = [
        ReadingKind::TotalUsage,
        ReadingKind::Purchased,
        ReadingKind::Sold,
        ReadingKind::Generated,
    ];

    /// Stable key of the total-category readings.
    pub fn total_key(&self) -> Option<&'static str> {
        match self {
            ReadingKind::TotalUsage => Some("total_use"),
            ReadingKind::Purchased => Some("buy"),
            ReadingKind::Sold => Some("sell"),
            ReadingKind::Generated => Some("gen"),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ReadingKind::TotalUsage => "Total Energy Today",
            ReadingKind::Purchased => "Purchased Energy Today",
            ReadingKind::Sold => "Sold Energy Today",
            ReadingKind::Generated => "Generated Energy Today",
            ReadingKind::Circuit => "Circuit",
            ReadingKind::Temperature => "Temperature",
            ReadingKind::Humidity => "Humidity",
        }
    }
}

/// The form a key takes inside a Home Assistant entity id, where `-` is not allowed.
/// Two keys are the same key when their object ids match.
pub fn object_id(key: &str) -> String {
    key.replace('-', "_")
}

/// One normalized measurement, ready to hand to the host platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub key: String,
    pub value: f64,
    pub unit: Unit,
    pub kind: ReadingKind,
    /// Display name for circuit and climate readings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Reading {
    pub fn total(kind: ReadingKind, value: f64) -> Option<Self> {
        kind.total_key().map(|key| Self {
            key: key.to_string(),
            value,
            unit: Unit::KilowattHour,
            kind,
            name: None,
        })
    }

    pub fn friendly_name(&self) -> &str {
        self.name
            .as_deref()
            .unwrap_or_else(|| self.kind.display_name())
    }
}

/// The single artifact a poll cycle produces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollResult {
    pub cycle: u64,
    pub completed_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_outcome")]
    pub outcome: Result<Vec<Reading>, PollError>,
}

impl PollResult {
    pub fn readings(&self) -> Option<&[Reading]> {
        self.outcome.as_deref().ok()
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

fn serialize_outcome<S>(
    outcome: &Result<Vec<Reading>, PollError>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    #[derive(Serialize)]
    #[serde(rename_all = "snake_case")]
    enum Outcome<'a> {
        Readings(&'a [Reading]),
        Failure(String),
    }
    match outcome {
        Ok(readings) => Outcome::Readings(readings).serialize(serializer),
        Err(err) => Outcome::Failure(err.to_string()).serialize(serializer),
    }
}

/// Checks the snapshot invariants: unique keys, totals all present.
pub fn validate_snapshot(readings: &[Reading]) -> Result<(), NormalizeError> {
    let mut seen = HashSet::new();
    for reading in readings {
        if !seen.insert(object_id(&reading.key)) {
            return Err(NormalizeError::DuplicateKey(reading.key.clone()));
        }
    }
    let missing: Vec<&'static str> = ReadingKind::TOTALS
        .iter()
        .filter(|kind| !readings.iter().any(|r| r.kind == **kind))
        .filter_map(|kind| kind.total_key())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(NormalizeError::IncompleteTotals(missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totals() -> Vec<Reading> {
        ReadingKind::TOTALS
            .iter()
            .filter_map(|kind| Reading::total(*kind, 1.0))
            .collect()
    }

    #[test]
    fn test_entity_semantics() {
        assert_eq!(Unit::KilowattHour.device_class(), "energy");
        assert_eq!(Unit::KilowattHour.state_class(), "total");
        assert_eq!(Unit::Watt.state_class(), "measurement");
        assert_eq!(Unit::Celsius.symbol(), "°C");
    }

    #[test]
    fn test_validate_snapshot() {
        let mut readings = totals();
        assert_eq!(validate_snapshot(&readings), Ok(()));

        readings.push(Reading {
            key: "buy".to_string(),
            value: 0.5,
            unit: Unit::KilowattHour,
            kind: ReadingKind::Circuit,
            name: Some("buy".to_string()),
        });
        assert_eq!(
            validate_snapshot(&readings),
            Err(NormalizeError::DuplicateKey("buy".to_string()))
        );

        let mut lookalike = totals();
        lookalike.push(Reading {
            key: "total-use".to_string(),
            value: 0.5,
            unit: Unit::KilowattHour,
            kind: ReadingKind::Circuit,
            name: Some("Total Use".to_string()),
        });
        assert_eq!(
            validate_snapshot(&lookalike),
            Err(NormalizeError::DuplicateKey("total-use".to_string()))
        );

        let partial: Vec<Reading> = totals().into_iter().skip(1).collect();
        assert_eq!(
            validate_snapshot(&partial),
            Err(NormalizeError::IncompleteTotals(vec!["total_use"]))
        );
    }

    #[test]
    fn test_poll_result_serializes_outcome() {
        let result = PollResult {
            cycle: 7,
            completed_at: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
            outcome: Err(PollError::Cancelled),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["cycle"], 7);
        assert_eq!(json["outcome"]["failure"], "poll cycle cancelled");
    }
}
