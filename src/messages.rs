use crate::beacon::{Beacon, Region};

/// Commands received over MQTT.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanCommand {
    Start,
    Stop,
}

impl ScanCommand {
    pub fn from_topic(topic: &str) -> Option<Self> {
        match topic.rsplit('/').next() {
            Some("start") => Some(ScanCommand::Start),
            Some("stop") => Some(ScanCommand::Stop),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionState {
    Inside,
    Outside,
}

/// Beacons ranged during one scan cycle.
#[derive(Clone, Debug)]
pub struct RangedBatch {
    pub region: Region,
    pub beacons: Vec<Beacon>,
}

impl RangedBatch {
    /// Detection time of the batch as a whole, zero when nothing was ranged.
    pub fn timestamp_ms(&self) -> u64 {
        self.beacons
            .first()
            .map(|b| b.last_cycle_detection_ms)
            .unwrap_or_default()
    }
}
