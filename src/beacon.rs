use std::fmt;

use mac_address::MacAddress;
use serde_derive::Deserialize;
use uuid::Uuid;

/// Byte layouts of the beacon advertisements we know how to read.
///
/// Offsets are relative to the manufacturer data with the two company id
/// bytes already stripped, which is how btleplug hands it to us.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BeaconLayout {
    IBeacon,
    AltBeacon,
}

const IDENTIFIERS_END: usize = 22;

impl BeaconLayout {
    /// https://bitbucket.org/bluetooth-SIG/public/src/main/assigned_numbers/company_identifiers/company_identifiers.yaml
    ///
    /// Empty when the layout is not tied to a single manufacturer.
    pub fn company_ids(&self) -> &'static [u16] {
        match self {
            BeaconLayout::IBeacon => &[0x004C],
            BeaconLayout::AltBeacon => &[],
        }
    }

    fn matcher(&self) -> [u8; 2] {
        match self {
            BeaconLayout::IBeacon => [0x02, 0x15],
            BeaconLayout::AltBeacon => [0xBE, 0xAC],
        }
    }

    /// Reads identifiers and the measured power at 1m from `data`.
    pub fn parse(&self, company_id: u16, data: &[u8]) -> Option<(BeaconId, i8)> {
        let companies = self.company_ids();
        if !companies.is_empty() && !companies.contains(&company_id) {
            return None;
        }
        if data.len() <= IDENTIFIERS_END || data[..2] != self.matcher() {
            return None;
        }

        let id1 = Uuid::from_slice(&data[2..18]).ok()?;
        let id2 = u16::from_be_bytes([data[18], data[19]]);
        let id3 = u16::from_be_bytes([data[20], data[21]]);
        let measured_power = data[IDENTIFIERS_END] as i8;

        Some((BeaconId { id1, id2, id3 }, measured_power))
    }
}

/// Tries each layout in order, skipping manufacturers outside `codes`
/// unless `codes` is empty.
pub fn parse_advertisement(
    layouts: &[BeaconLayout],
    codes: &[u16],
    company_id: u16,
    data: &[u8],
) -> Option<(BeaconId, i8)> {
    if !codes.is_empty() && !codes.contains(&company_id) {
        return None;
    }
    layouts
        .iter()
        .find_map(|layout| layout.parse(company_id, data))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BeaconId {
    pub id1: Uuid,
    pub id2: u16,
    pub id3: u16,
}

impl BeaconId {
    pub fn identifier(&self, field: IdentifierField) -> Identifier {
        match field {
            IdentifierField::Id1 => Identifier::Uuid(self.id1),
            IdentifierField::Id2 => Identifier::Int(self.id2),
            IdentifierField::Id3 => Identifier::Int(self.id3),
        }
    }
}

impl fmt::Display for BeaconId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id1: {} id2: {} id3: {}", self.id1, self.id2, self.id3)
    }
}

#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierField {
    Id1,
    Id2,
    #[default]
    Id3,
}

/// One part of a beacon id, used as the presence key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Identifier {
    Uuid(Uuid),
    Int(u16),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Uuid(uuid) => write!(f, "{uuid}"),
            Identifier::Int(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Beacon {
    pub id: BeaconId,
    pub address: MacAddress,
    pub rssi: i16,
    pub measured_power: i8,
    /// Wall clock millis of the last advertisement seen in this scan cycle.
    pub last_cycle_detection_ms: u64,
}

impl Beacon {
    /// Estimated distance in meters, or -1.0 when rssi is unknown.
    ///
    /// Curve fitted against a Nexus 4 receiver, which is what most beacon
    /// SDKs ship as their default model.
    pub fn distance(&self) -> f64 {
        if self.rssi == 0 || self.measured_power == 0 {
            return -1.0;
        }
        let ratio = f64::from(self.rssi) / f64::from(self.measured_power);
        if ratio < 1.0 {
            ratio.powf(10.0)
        } else {
            0.42093 * ratio.powf(6.9476) + 0.54992
        }
    }
}

impl fmt::Display for Beacon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.address)
    }
}

/// A set of beacons to monitor and range. `None` fields match anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub unique_id: String,
    pub id1: Option<Uuid>,
    pub id2: Option<u16>,
    pub id3: Option<u16>,
}

impl Region {
    pub fn matches(&self, id: &BeaconId) -> bool {
        self.id1.is_none_or(|id1| id1 == id.id1)
            && self.id2.is_none_or(|id2| id2 == id.id2)
            && self.id3.is_none_or(|id3| id3 == id.id3)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |value: Option<String>| value.unwrap_or_else(|| "null".to_string());
        write!(
            f,
            "id1: {} id2: {} id3: {}",
            part(self.id1.map(|v| v.to_string())),
            part(self.id2.map(|v| v.to_string())),
            part(self.id3.map(|v| v.to_string())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "00b08e64-0a0e-48c7-9571-6008519139ee";

    fn advertisement(matcher: [u8; 2], major: u16, minor: u16, power: i8) -> Vec<u8> {
        let mut data = matcher.to_vec();
        data.extend_from_slice(Uuid::parse_str(UUID).unwrap().as_bytes());
        data.extend_from_slice(&major.to_be_bytes());
        data.extend_from_slice(&minor.to_be_bytes());
        data.push(power as u8);
        data
    }

    #[test]
    fn test_parse_ibeacon() {
        let data = advertisement([0x02, 0x15], 1, 513, -59);
        let (id, power) = BeaconLayout::IBeacon.parse(0x004C, &data).unwrap();
        assert_eq!(id.id1.to_string(), UUID);
        assert_eq!(id.id2, 1);
        assert_eq!(id.id3, 513);
        assert_eq!(power, -59);
    }

    #[test]
    fn test_parse_rejects_other_layouts() {
        let ibeacon = advertisement([0x02, 0x15], 1, 2, -59);
        assert!(BeaconLayout::IBeacon.parse(0x0118, &ibeacon).is_none());
        assert!(BeaconLayout::AltBeacon.parse(0x0118, &ibeacon).is_none());
        assert!(BeaconLayout::IBeacon.parse(0x004C, &ibeacon[..20]).is_none());

        let altbeacon = advertisement([0xBE, 0xAC], 1, 2, -59);
        assert!(BeaconLayout::AltBeacon.parse(0x0118, &altbeacon).is_some());
    }

    #[test]
    fn test_parse_advertisement_manufacturer_codes() {
        let layouts = [BeaconLayout::IBeacon, BeaconLayout::AltBeacon];
        let altbeacon = advertisement([0xBE, 0xAC], 7, 8, -60);

        assert!(parse_advertisement(&layouts, &[], 0x0118, &altbeacon).is_some());
        assert!(parse_advertisement(&layouts, &[0x004C], 0x0118, &altbeacon).is_none());
    }

    #[test]
    fn test_identifier_field() {
        let id = BeaconId {
            id1: Uuid::parse_str(UUID).unwrap(),
            id2: 10,
            id3: 20,
        };
        assert_eq!(id.identifier(IdentifierField::Id3), Identifier::Int(20));
        assert_eq!(id.identifier(IdentifierField::Id2).to_string(), "10");
        assert_eq!(id.identifier(IdentifierField::Id1).to_string(), UUID);
    }

    #[test]
    fn test_region_matches() {
        let id = BeaconId {
            id1: Uuid::parse_str(UUID).unwrap(),
            id2: 1,
            id3: 2,
        };
        let wildcard = Region {
            unique_id: "all-beacons".to_string(),
            id1: None,
            id2: None,
            id3: None,
        };
        assert!(wildcard.matches(&id));
        assert_eq!(wildcard.to_string(), "id1: null id2: null id3: null");

        let other = Region {
            id1: Some(Uuid::nil()),
            ..wildcard.clone()
        };
        assert!(!other.matches(&id));

        let minor = Region {
            id3: Some(2),
            ..wildcard
        };
        assert!(minor.matches(&id));
    }

    #[test]
    fn test_distance() {
        let mut beacon = Beacon {
            id: BeaconId {
                id1: Uuid::nil(),
                id2: 0,
                id3: 0,
            },
            address: MacAddress::new([0; 6]),
            rssi: -59,
            measured_power: -59,
            last_cycle_detection_ms: 0,
        };
        assert!((beacon.distance() - 0.97085).abs() < 1e-3);

        beacon.rssi = -70;
        assert!(beacon.distance() > 1.0);

        beacon.rssi = 0;
        assert_eq!(beacon.distance(), -1.0);
    }
}
