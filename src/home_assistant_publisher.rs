use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::home_assistant::HomeAssistantAPI;
use crate::poller::Snapshot;
use crate::reading::{object_id, PollResult, Reading, Unit};

const ENTITY_PREFIX: &str = "sensor.aiseg2_bridge_";
const UNAVAILABLE: &str = "unavailable";
/// AiSEG2 daily counters roll over at midnight Japan time.
const JST_OFFSET_SECS: i32 = 9 * 3600;

/// Entity id for a reading key.
pub fn entity_id(key: &str) -> String {
    format!("{}{}", ENTITY_PREFIX, object_id(key))
}

/// Start of the current AiSEG2 day, in JST.
pub fn jst_midnight(now: DateTime<Utc>) -> Option<DateTime<FixedOffset>> {
    let jst = FixedOffset::east_opt(JST_OFFSET_SECS)?;
    now.with_timezone(&jst)
        .date_naive()
        .and_hms_opt(0, 0, 0)?
        .and_local_timezone(jst)
        .single()
}

pub fn entity_attributes(reading: &Reading, now: DateTime<Utc>) -> Map<String, Value> {
    let mut attributes = Map::new();
    attributes.insert("friendly_name".into(), json!(reading.friendly_name()));
    attributes.insert(
        "unit_of_measurement".into(),
        json!(reading.unit.symbol()),
    );
    attributes.insert("device_class".into(), json!(reading.unit.device_class()));
    attributes.insert("state_class".into(), json!(reading.unit.state_class()));
    if reading.unit == Unit::KilowattHour {
        if let Some(reset) = jst_midnight(now) {
            attributes.insert("last_reset".into(), json!(reset.to_rfc3339()));
        }
    }
    attributes.insert("manufacturer".into(), json!("Panasonic"));
    attributes.insert("model".into(), json!("AiSEG2"));
    attributes
}

/// Pushes every poll result into Home Assistant, or into the log when no instance is
/// configured.
pub struct HomeAssistantPublisher {
    receiver: watch::Receiver<Snapshot>,
    ha_client: Option<HomeAssistantAPI>,
    /// Entities set so far, with the attributes they were last given.
    published: BTreeMap<String, Map<String, Value>>,
}

impl HomeAssistantPublisher {
    pub fn new(receiver: watch::Receiver<Snapshot>, ha_client: Option<HomeAssistantAPI>) -> Self {
        if ha_client.is_none() {
            info!("HA_URL not set, readings will only be logged");
        }
        Self {
            receiver,
            ha_client,
            published: BTreeMap::new(),
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Publishes each new result until shutdown or until the poller goes away.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let changed = tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = self.receiver.changed() => changed,
            };
            if changed.is_err() {
                debug!("Poller dropped its result channel");
                break;
            }
            let snapshot = self.receiver.borrow_and_update().clone();
            if let Some(result) = snapshot {
                self.handle(&result).await;
            }
        }
        info!("Home Assistant publisher stopped");
    }

    pub async fn handle(&mut self, result: &PollResult) {
        match &result.outcome {
            Ok(readings) => self.publish_readings(readings, result.completed_at).await,
            Err(err) => {
                error!("Marking AiSEG2 sensors unavailable after cycle {}: {}", result.cycle, err);
                self.mark_unavailable().await;
            }
        }
    }

    pub fn published_entities(&self) -> impl Iterator<Item = &str> {
        self.published.keys().map(String::as_str)
    }

    async fn publish_readings(&mut self, readings: &[Reading], now: DateTime<Utc>) {
        let Some(client) = &self.ha_client else {
            for reading in readings {
                info!(
                    "{} = {} {}",
                    entity_id(&reading.key),
                    reading.value,
                    reading.unit
                );
            }
            return;
        };

        let mut sent = 0;
        for reading in readings {
            let entity = entity_id(&reading.key);
            let attributes = entity_attributes(reading, now);
            match client
                .publish_state(&entity, &reading.value.to_string(), attributes.clone())
                .await
            {
                Ok(_) => {
                    sent += 1;
                    self.published.insert(entity, attributes);
                }
                Err(e) => warn!("Failed to publish {}: {}", entity, e),
            }
        }
        debug!("Published {}/{} readings", sent, readings.len());
    }

    async fn mark_unavailable(&mut self) {
        let Some(client) = &self.ha_client else {
            return;
        };
        for (entity, attributes) in &self.published {
            if let Err(e) = client
                .publish_state(entity, UNAVAILABLE, attributes.clone())
                .await
            {
                warn!("Failed to mark {} unavailable: {}", entity, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HomeAssistantConfig;
    use crate::error::{FetchError, PollError};
    use crate::reading::ReadingKind;
    use mockito::Matcher;
    use secrecy::SecretString;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn readings() -> Vec<Reading> {
        vec![
            Reading::total(ReadingKind::Purchased, 5.5).unwrap(),
            Reading {
                key: "aircon-2".to_string(),
                value: 0.4,
                unit: Unit::KilowattHour,
                kind: ReadingKind::Circuit,
                name: Some("エアコン".to_string()),
            },
        ]
    }

    fn publisher(url: &str) -> HomeAssistantPublisher {
        let (_tx, rx) = watch::channel(None);
        let api = HomeAssistantAPI::new(&HomeAssistantConfig {
            url: url.to_string(),
            token: SecretString::from("test_token".to_string()),
        })
        .unwrap();
        HomeAssistantPublisher::new(rx, Some(api))
    }

    #[test]
    fn test_entity_id() {
        assert_eq!(entity_id("total_use"), "sensor.aiseg2_bridge_total_use");
        assert_eq!(entity_id("aircon-2"), "sensor.aiseg2_bridge_aircon_2");
    }

    #[test]
    fn test_last_reset_is_jst_midnight() {
        // 16:30 UTC is already the next day in Japan.
        let reset = jst_midnight(at("2024-03-01T16:30:00Z")).unwrap();
        assert_eq!(reset.to_rfc3339(), "2024-03-02T00:00:00+09:00");

        let reset = jst_midnight(at("2024-03-01T14:59:59Z")).unwrap();
        assert_eq!(reset.to_rfc3339(), "2024-03-01T00:00:00+09:00");
    }

    #[test]
    fn test_entity_attributes() {
        let now = at("2024-03-01T03:00:00Z");
        let attrs = entity_attributes(&readings()[0], now);
        assert_eq!(attrs["friendly_name"], "Purchased Energy Today");
        assert_eq!(attrs["unit_of_measurement"], "kWh");
        assert_eq!(attrs["device_class"], "energy");
        assert_eq!(attrs["state_class"], "total");
        assert_eq!(attrs["last_reset"], "2024-03-01T00:00:00+09:00");

        let temperature = Reading {
            key: "climate-7-temperature".to_string(),
            value: 21.5,
            unit: Unit::Celsius,
            kind: ReadingKind::Temperature,
            name: Some("居間 Temperature".to_string()),
        };
        let attrs = entity_attributes(&temperature, now);
        assert_eq!(attrs["state_class"], "measurement");
        assert_eq!(attrs["device_class"], "temperature");
        assert!(!attrs.contains_key("last_reset"));
    }

    #[tokio::test]
    async fn test_success_then_failure_marks_entities_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let buy = server
            .mock("POST", "/api/states/sensor.aiseg2_bridge_buy")
            .match_header("Authorization", "Bearer test_token")
            .match_body(Matcher::PartialJson(json!({"state": "5.5"})))
            .with_status(200)
            .with_body(r#"{"entity_id":"sensor.aiseg2_bridge_buy","state":"5.5"}"#)
            .create_async()
            .await;
        let aircon = server
            .mock("POST", "/api/states/sensor.aiseg2_bridge_aircon_2")
            .match_body(Matcher::PartialJson(json!({
                "state": "0.4",
                "attributes": {"friendly_name": "エアコン"}
            })))
            .with_status(201)
            .with_body(r#"{"entity_id":"sensor.aiseg2_bridge_aircon_2","state":"0.4"}"#)
            .create_async()
            .await;

        let mut publisher = publisher(&server.url());
        publisher
            .handle(&PollResult {
                cycle: 1,
                completed_at: Utc::now(),
                outcome: Ok(readings()),
            })
            .await;
        buy.assert_async().await;
        aircon.assert_async().await;
        assert_eq!(
            publisher.published_entities().collect::<Vec<_>>(),
            vec!["sensor.aiseg2_bridge_aircon_2", "sensor.aiseg2_bridge_buy"]
        );

        let unavailable = server
            .mock("POST", Matcher::Regex("^/api/states/sensor\\.aiseg2_bridge_".into()))
            .match_body(Matcher::PartialJson(json!({
                "state": "unavailable",
                "attributes": {"unit_of_measurement": "kWh"}
            })))
            .with_status(200)
            .with_body(r#"{"entity_id":"x","state":"unavailable"}"#)
            .expect(2)
            .create_async()
            .await;
        publisher
            .handle(&PollResult {
                cycle: 2,
                completed_at: Utc::now(),
                outcome: Err(PollError::Fetch(FetchError::Timeout)),
            })
            .await;
        unavailable.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_post_is_not_remembered() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let mut publisher = publisher(&server.url());
        publisher
            .handle(&PollResult {
                cycle: 1,
                completed_at: Utc::now(),
                outcome: Ok(readings()),
            })
            .await;
        assert_eq!(publisher.published_entities().count(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_when_poller_goes_away() {
        let (tx, rx) = watch::channel(None);
        let publisher = HomeAssistantPublisher::new(rx, None);
        let handle = publisher.spawn(CancellationToken::new());

        tx.send_replace(Some(std::sync::Arc::new(PollResult {
            cycle: 1,
            completed_at: Utc::now(),
            outcome: Ok(readings()),
        })));
        drop(tx);
        handle.await.unwrap();
    }
}
