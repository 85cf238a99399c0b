use log::{debug, error, info};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::messages::ScanCommand;
use crate::monitor::PresenceMonitor;
use crate::mqtt::MqttClient;
use crate::notifier::{ForegroundStatus, Notifier};
use crate::scanner::{Scanner, epoch_millis};

/// Whether a scan start should go ahead. Missing bluetooth permission
/// defers setup to a later start command instead of failing.
fn scan_started(result: btleplug::Result<()>) -> anyhow::Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(btleplug::Error::PermissionDenied) => {
            debug!("Not setting up scanning until bluetooth permission granted by user");
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}

/// Drops tracked beacons, cancels their notifications and takes the
/// scanning indicator down.
fn tear_down<N: Notifier>(monitor: &PresenceMonitor<N>) {
    monitor.stop();
    if let Err(err) = monitor.notifier().clear_foreground() {
        error!("Error clearing scanning status: {:?}", err);
    }
}

/// Owns the scan lifecycle: starts and stops scanning on command and feeds
/// the scanner's streams into the presence monitor.
pub struct Manager {
    scanner: Scanner,
    mqtt_client: MqttClient,
    mqtt_event_loop: Option<rumqttc::EventLoop>,
    monitor: PresenceMonitor<MqttClient>,
    scan_task: Option<JoinHandle<()>>,
}

impl Manager {
    pub fn new(
        adapter: btleplug::platform::Adapter,
        config: &AppConfig,
        mqtt_client: MqttClient,
        mqtt_event_loop: rumqttc::EventLoop,
    ) -> Self {
        let presence = config.presence();
        let monitor = PresenceMonitor::new(
            mqtt_client.clone(),
            presence.key(),
            presence.timeout_ms(),
        );
        Manager {
            scanner: Scanner::new(adapter, config.region(), &config.scan()),
            mqtt_client,
            mqtt_event_loop: Some(mqtt_event_loop),
            monitor,
            scan_task: None,
        }
    }

    fn is_scanning(&self) -> bool {
        self.scan_task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Starts scanning unless bluetooth access hasn't been granted yet, in
    /// which case setup waits for the next start command.
    async fn setup_scanning(&mut self) -> anyhow::Result<()> {
        if self.is_scanning() {
            debug!("Already scanning");
            return Ok(());
        }

        if !scan_started(self.scanner.start().await)? {
            return Ok(());
        }

        let status = ForegroundStatus {
            title: "Scanning for Beacons".to_string(),
            text: format!("Monitoring region {}", self.scanner.region().unique_id),
            ongoing: true,
            stop_action: self.mqtt_client.stop_topic(),
        };
        if let Err(err) = self.monitor.notifier().show_foreground(&status) {
            error!("Error showing scanning status: {:?}", err);
        }

        self.monitor.start();

        let scanner = self.scanner.clone();
        self.scan_task = Some(tokio::spawn(async move {
            if let Err(err) = scanner.run().await {
                error!("Error scanning for beacons: {:?}", err);
            }
            debug!("Done scanning for beacons");
        }));

        Ok(())
    }

    async fn stop_scanning(&mut self) {
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
        if let Err(err) = self.scanner.stop().await {
            error!("Error stopping scan: {:?}", err);
        }
        tear_down(&self.monitor);
    }

    pub async fn run_loop(mut self) -> anyhow::Result<()> {
        let (tx, mut commands) = broadcast::channel(10);

        // Handle incoming MQTT messages (start / stop requests)
        let mqtt_task = self.mqtt_event_loop.take().map(|mut eventloop| {
            let mqtt_client = self.mqtt_client.clone();
            tokio::spawn(async move {
                mqtt_client.event_loop(&mut eventloop, tx).await;
            })
        });

        let mut region_states = self.scanner.subscribe_region_state();
        let mut ranged = self.scanner.subscribe_ranged();

        self.setup_scanning().await?;

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Ok(ScanCommand::Start) => {
                        info!("Received start request");
                        if let Err(err) = self.setup_scanning().await {
                            error!("Error starting scan: {:?}", err);
                        }
                    }
                    Ok(ScanCommand::Stop) => {
                        info!("Received stop request");
                        self.stop_scanning().await;
                        // Skip whatever the aborted scan already queued.
                        region_states = region_states.resubscribe();
                        ranged = ranged.resubscribe();
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        debug!("Command receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Command sender closed");
                        break;
                    }
                },
                Ok(state) = region_states.recv() => {
                    self.monitor.on_region_state(self.scanner.region(), state);
                    if let Err(err) = self.mqtt_client.announce_region(self.scanner.region(), state) {
                        error!("Error announcing region state: {:?}", err);
                    }
                }
                Ok(batch) = ranged.recv() => {
                    self.monitor.on_ranged(&batch, epoch_millis());
                }
                _ = &mut shutdown => {
                    info!("Shutting down");
                    break;
                }
            }
        }

        self.stop_scanning().await;
        info!("Exiting manager event loop");

        self.mqtt_client.disconnect().await?;
        if let Some(task) = mqtt_task {
            task.abort();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::IdentifierField;
    use crate::notifier::testing::{Call, RecordingNotifier};

    #[test]
    fn test_scan_started() {
        assert!(scan_started(Ok(())).unwrap());
    }

    #[test]
    fn test_permission_denied_defers_setup() {
        assert!(!scan_started(Err(btleplug::Error::PermissionDenied)).unwrap());
    }

    #[test]
    fn test_other_start_errors_propagate() {
        assert!(scan_started(Err(btleplug::Error::DeviceNotFound)).is_err());
    }

    #[test]
    fn test_tear_down_cancels_then_clears_indicator() {
        let monitor =
            PresenceMonitor::new(RecordingNotifier::default(), IdentifierField::Id3, 10_000);
        tear_down(&monitor);

        assert_eq!(
            monitor.notifier().take(),
            vec![Call::CancelAll, Call::ClearForeground]
        );
        assert!(!monitor.is_active());
        assert!(monitor.tracker().is_empty());
    }
}
