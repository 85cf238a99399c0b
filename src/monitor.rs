use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info};

use crate::beacon::{Identifier, IdentifierField, Region};
use crate::messages::{RangedBatch, RegionState};
use crate::notifier::{Notification, Notifier};
use crate::presence::{Detection, PresenceTracker, PresenceUpdate};

/// Turns region and ranging callbacks into presence notifications.
pub struct PresenceMonitor<N: Notifier> {
    tracker: PresenceTracker<Identifier>,
    notifier: N,
    key: IdentifierField,
    /// Cleared by `stop` so batches still queued from the old scan are
    /// dropped instead of re-entering beacons.
    active: AtomicBool,
}

impl<N: Notifier> PresenceMonitor<N> {
    pub fn new(notifier: N, key: IdentifierField, timeout_ms: u64) -> Self {
        PresenceMonitor {
            tracker: PresenceTracker::new(timeout_ms),
            notifier,
            key,
            active: AtomicBool::new(true),
        }
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub fn tracker(&self) -> &PresenceTracker<Identifier> {
        &self.tracker
    }

    pub fn on_region_state(&self, region: &Region, state: RegionState) {
        match state {
            RegionState::Outside => info!("outside beacon region: {region}"),
            RegionState::Inside => info!("inside beacon region: {region}"),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn on_ranged(&self, batch: &RangedBatch, now_ms: u64) -> PresenceUpdate<Identifier> {
        if !self.is_active() {
            debug!("Dropping {} beacons ranged after stop", batch.beacons.len());
            return PresenceUpdate {
                entered: Vec::new(),
                expired: Vec::new(),
            };
        }

        debug!(
            "ranged {} beacons in {}, {} tracked",
            batch.beacons.len(),
            batch.region.unique_id,
            self.tracker.len()
        );

        let detections: Vec<_> = batch
            .beacons
            .iter()
            .map(|beacon| Detection {
                id: beacon.id.identifier(self.key),
                seen_at_ms: beacon.last_cycle_detection_ms,
            })
            .collect();

        let update = self.tracker.update(&detections, now_ms);
        if !update.is_empty() {
            debug!(
                "{} entered, {} expired",
                update.entered.len(),
                update.expired.len()
            );
        }

        for entered in &update.entered {
            let notification =
                Notification::presence(entered.handle, format!("inside: {}", entered.id));
            self.post(&notification);
        }
        for expired in &update.expired {
            debug!("{} left, cancelling notification {}", expired.id, expired.handle.0);
            if let Err(err) = self.notifier.cancel(expired.handle) {
                error!("Error cancelling notification {}: {:?}", expired.handle.0, err);
            }
        }
        // The notifier drops the summary itself once nothing is left.
        let remaining = self.tracker.len();
        if !update.is_empty() && remaining > 0 {
            self.post(&Notification::summary(remaining));
        }

        let age_ms = now_ms.saturating_sub(batch.timestamp_ms());
        if self.tracker.is_stale(batch.timestamp_ms(), now_ms) {
            debug!("Ignoring stale ranged beacons from {age_ms} millis ago");
        } else {
            info!("Ranged: {} beacons", batch.beacons.len());
            for beacon in &batch.beacons {
                info!("{} about {:.2} meters away", beacon, beacon.distance());
            }
        }

        update
    }

    fn post(&self, notification: &Notification) {
        if let Err(err) = self.notifier.notify(notification) {
            error!("Error posting notification {}: {:?}", notification.handle.0, err);
        }
    }

    /// Forgets every tracked beacon ahead of a scan restart.
    pub fn start(&self) {
        self.active.store(true, Ordering::Release);
        let dropped = self.tracker.reset();
        debug!(
            "Tracking presence with a {} ms timeout, cleared {} beacons",
            self.tracker.timeout_ms(),
            dropped.len()
        );
    }

    /// Handles the stop action: forget everything and take all
    /// notifications down.
    pub fn stop(&self) {
        self.active.store(false, Ordering::Release);
        self.tracker.reset();
        if let Err(err) = self.notifier.cancel_all() {
            error!("Error cancelling notifications: {:?}", err);
        }
    }
}
