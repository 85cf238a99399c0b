use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use btleplug::api::{Central as _, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, PeripheralId};
use futures::StreamExt as _;
use log::{debug, info, warn};
use mac_address::MacAddress;
use tokio::sync::broadcast;

use crate::beacon::{Beacon, BeaconLayout, Region, parse_advertisement};
use crate::config::ScanConfig;
use crate::messages::{RangedBatch, RegionState};

pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Decides inside / outside from per-cycle sightings. Leaving needs
/// `exit_ms` without any sighting, so one missed cycle doesn't flap.
#[derive(Debug)]
pub struct RegionTracker {
    state: RegionState,
    last_seen_ms: Option<u64>,
    exit_ms: u64,
}

impl RegionTracker {
    pub fn new(exit_ms: u64) -> Self {
        RegionTracker {
            state: RegionState::Outside,
            last_seen_ms: None,
            exit_ms,
        }
    }

    /// Returns the new state on a transition.
    pub fn observe(&mut self, seen: bool, now_ms: u64) -> Option<RegionState> {
        if seen {
            self.last_seen_ms = Some(now_ms);
        }
        let next = match self.last_seen_ms {
            Some(last) if now_ms.saturating_sub(last) < self.exit_ms => RegionState::Inside,
            _ => RegionState::Outside,
        };
        if next == self.state {
            return None;
        }
        self.state = next;
        Some(next)
    }
}

/// Scans for beacon advertisements and publishes region state changes and
/// one ranged batch per scan cycle.
#[derive(Clone)]
pub struct Scanner {
    adapter: Adapter,
    region: Region,
    layouts: Vec<BeaconLayout>,
    manufacturer_codes: Vec<u16>,
    scan_period: Duration,
    between_scan_period: Duration,
    region_exit_ms: u64,
    region_tx: broadcast::Sender<RegionState>,
    ranged_tx: broadcast::Sender<RangedBatch>,
}

impl Scanner {
    pub fn new(adapter: Adapter, region: Region, config: &ScanConfig) -> Self {
        let (region_tx, _) = broadcast::channel(10);
        let (ranged_tx, _) = broadcast::channel(10);
        Scanner {
            adapter,
            region,
            layouts: config.layouts(),
            manufacturer_codes: config.manufacturer_codes(),
            scan_period: config.scan_period(),
            between_scan_period: config.between_scan_period(),
            region_exit_ms: config.region_exit_ms(),
            region_tx,
            ranged_tx,
        }
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn subscribe_region_state(&self) -> broadcast::Receiver<RegionState> {
        self.region_tx.subscribe()
    }

    pub fn subscribe_ranged(&self) -> broadcast::Receiver<RangedBatch> {
        self.ranged_tx.subscribe()
    }

    pub async fn start(&self) -> btleplug::Result<()> {
        info!("Starting beacon scan for region {}", self.region.unique_id);
        self.adapter.start_scan(ScanFilter::default()).await
    }

    pub async fn stop(&self) -> btleplug::Result<()> {
        info!("Stopping beacon scan");
        self.adapter.stop_scan().await
    }

    /// Runs scan cycles until the adapter's event stream ends.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut events = self.adapter.events().await?;
        let mut region_tracker = RegionTracker::new(self.region_exit_ms);

        loop {
            let mut cycle = HashMap::new();
            let deadline = tokio::time::sleep(self.scan_period);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    event = events.next() => match event {
                        Some(CentralEvent::ManufacturerDataAdvertisement { id, manufacturer_data }) => {
                            for (company_id, data) in manufacturer_data {
                                if let Some(beacon) = self.read_beacon(&id, company_id, &data).await {
                                    cycle.insert(beacon.id, beacon);
                                }
                            }
                        }
                        Some(_) => {}
                        None => {
                            info!("No more adapter events");
                            return Ok(());
                        }
                    }
                }
            }

            let now = epoch_millis();
            let mut beacons: Vec<Beacon> = cycle.into_values().collect();
            beacons.sort_by_key(|b| b.id);

            if let Some(state) = region_tracker.observe(!beacons.is_empty(), now) {
                // No subscriber is not an error; the next cycle tries again.
                let _ = self.region_tx.send(state);
            }
            let _ = self.ranged_tx.send(RangedBatch {
                region: self.region.clone(),
                beacons,
            });

            if !self.between_scan_period.is_zero() {
                self.stop().await?;
                tokio::time::sleep(self.between_scan_period).await;
                self.start().await?;
            }
        }
    }

    async fn read_beacon(&self, id: &PeripheralId, company_id: u16, data: &[u8]) -> Option<Beacon> {
        let (beacon_id, measured_power) =
            parse_advertisement(&self.layouts, &self.manufacturer_codes, company_id, data)?;
        if !self.region.matches(&beacon_id) {
            return None;
        }
        let (address, rssi) = match self.properties(id).await {
            Ok(found) => found,
            Err(err) => {
                warn!("Error reading properties of {:?}: {:?}", id, err);
                return None;
            }
        };
        debug!("Beacon {} rssi {}", beacon_id, rssi);

        Some(Beacon {
            id: beacon_id,
            address,
            rssi,
            measured_power,
            last_cycle_detection_ms: epoch_millis(),
        })
    }

    async fn properties(&self, id: &PeripheralId) -> btleplug::Result<(MacAddress, i16)> {
        let peripheral = self.adapter.peripheral(id).await?;
        let properties = peripheral.properties().await?;
        Ok(properties
            .map(|p| (MacAddress::new(p.address.into_inner()), p.rssi.unwrap_or_default()))
            .unwrap_or((MacAddress::new([0; 6]), 0)))
    }
}
