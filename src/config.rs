use std::time::Duration;

use serde_derive::Deserialize;
use uuid::Uuid;

use crate::beacon::{BeaconLayout, IdentifierField, Region};

pub const DEFAULT_PRESENCE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SCAN_PERIOD_MS: u64 = 1_100;
pub const DEFAULT_BETWEEN_SCAN_PERIOD_MS: u64 = 0;
pub const DEFAULT_REGION_EXIT_MS: u64 = 10_000;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub scan: Option<ScanConfig>,
    pub region: Option<RegionConfig>,
    pub presence: Option<PresenceConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub layouts: Option<Vec<BeaconLayout>>,
    /// Company identifiers the adapter should pay attention to. Advertisements
    /// from other manufacturers are dropped before layout matching.
    pub manufacturer_codes: Option<Vec<u16>>,
    pub scan_period_ms: Option<u64>,
    pub between_scan_period_ms: Option<u64>,
    pub region_exit_ms: Option<u64>,
}

impl ScanConfig {
    pub fn layouts(&self) -> Vec<BeaconLayout> {
        self.layouts
            .clone()
            .unwrap_or_else(|| vec![BeaconLayout::IBeacon])
    }

    /// An empty list accepts every manufacturer.
    pub fn manufacturer_codes(&self) -> Vec<u16> {
        if let Some(codes) = &self.manufacturer_codes {
            return codes.clone();
        }
        let layouts = self.layouts();
        if layouts.iter().any(|l| l.company_ids().is_empty()) {
            return Vec::new();
        }
        layouts
            .iter()
            .flat_map(|l| l.company_ids().iter().copied())
            .collect()
    }

    pub fn scan_period(&self) -> Duration {
        Duration::from_millis(self.scan_period_ms.unwrap_or(DEFAULT_SCAN_PERIOD_MS))
    }

    pub fn between_scan_period(&self) -> Duration {
        Duration::from_millis(
            self.between_scan_period_ms
                .unwrap_or(DEFAULT_BETWEEN_SCAN_PERIOD_MS),
        )
    }

    pub fn region_exit_ms(&self) -> u64 {
        self.region_exit_ms.unwrap_or(DEFAULT_REGION_EXIT_MS)
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct RegionConfig {
    pub unique_id: Option<String>,
    pub id1: Option<Uuid>,
    pub id2: Option<u16>,
    pub id3: Option<u16>,
}

impl From<&RegionConfig> for Region {
    fn from(config: &RegionConfig) -> Self {
        Region {
            unique_id: config
                .unique_id
                .clone()
                .unwrap_or_else(|| "all-beacons".to_string()),
            id1: config.id1,
            id2: config.id2,
            id3: config.id3,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct PresenceConfig {
    pub timeout_ms: Option<u64>,
    /// Which part of the beacon identifier keys the presence map.
    pub key: Option<IdentifierField>,
}

impl PresenceConfig {
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.unwrap_or(DEFAULT_PRESENCE_TIMEOUT_MS)
    }

    pub fn key(&self) -> IdentifierField {
        self.key.unwrap_or_default()
    }
}

impl AppConfig {
    pub fn scan(&self) -> ScanConfig {
        self.scan.clone().unwrap_or_default()
    }

    pub fn region(&self) -> Region {
        self.region
            .as_ref()
            .map(Region::from)
            .unwrap_or_else(|| Region::from(&RegionConfig::default()))
    }

    pub fn presence(&self) -> PresenceConfig {
        self.presence.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config() {
        let config_str = r#"
            [mqtt]
            host = "localhost"
            port = 1883
            username = "user"
            password = "pass"

            [scan]
            layouts = ["ibeacon", "altbeacon"]
            manufacturer_codes = [76]
            scan_period_ms = 1000
            between_scan_period_ms = 5000

            [region]
            unique_id = "lobby"
            id1 = "00b08e64-0a0e-48c7-9571-6008519139ee"

            [presence]
            timeout_ms = 15000
            key = "id2"
        "#;
        let config: AppConfig = toml::de::from_str(config_str).unwrap();
        assert!(config.mqtt.host == "localhost");

        let scan = config.scan();
        assert_eq!(scan.layouts(), vec![BeaconLayout::IBeacon, BeaconLayout::AltBeacon]);
        assert_eq!(scan.manufacturer_codes(), vec![0x004C]);
        assert_eq!(scan.scan_period(), Duration::from_millis(1000));
        assert_eq!(scan.between_scan_period(), Duration::from_millis(5000));
        assert_eq!(scan.region_exit_ms(), DEFAULT_REGION_EXIT_MS);

        let region = config.region();
        assert_eq!(region.unique_id, "lobby");
        assert_eq!(
            region.id1,
            Some(Uuid::parse_str("00b08e64-0a0e-48c7-9571-6008519139ee").unwrap())
        );
        assert_eq!(region.id2, None);

        assert_eq!(config.presence().timeout_ms(), 15_000);
        assert_eq!(config.presence().key(), IdentifierField::Id2);
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = toml::de::from_str("[mqtt]\nhost = \"broker\"").unwrap();

        let scan = config.scan();
        assert_eq!(scan.layouts(), vec![BeaconLayout::IBeacon]);
        assert_eq!(scan.manufacturer_codes(), vec![0x004C]);
        assert_eq!(scan.scan_period(), Duration::from_millis(1100));
        assert_eq!(scan.between_scan_period(), Duration::ZERO);

        let region = config.region();
        assert_eq!(region.unique_id, "all-beacons");
        assert!(region.id1.is_none() && region.id2.is_none() && region.id3.is_none());

        assert_eq!(config.presence().timeout_ms(), 10_000);
        assert_eq!(config.presence().key(), IdentifierField::Id3);
    }

    #[test]
    fn test_altbeacon_accepts_any_manufacturer() {
        let scan = ScanConfig {
            layouts: Some(vec![BeaconLayout::IBeacon, BeaconLayout::AltBeacon]),
            ..Default::default()
        };
        assert!(scan.manufacturer_codes().is_empty());
    }

    #[test]
    fn test_example_config_parses() {
        let config: AppConfig =
            toml::de::from_str(include_str!("../config.example.toml")).unwrap();
        assert_eq!(config.scan().manufacturer_codes(), vec![0x004C]);
        assert!(config.region().id1.is_some());
    }
}
