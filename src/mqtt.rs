use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info};
use rumqttc::{ClientError, MqttOptions, QoS, SubscribeFilter};
use serde_derive::Serialize;
use tokio::sync::broadcast;

use crate::beacon::Region;
use crate::config;
use crate::messages::{RegionState, ScanCommand};
use crate::notifier::{ForegroundStatus, Notification, Notifier};
use crate::presence::NotificationHandle;

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
    active: Arc<Mutex<HashSet<NotificationHandle>>>,
}

#[derive(Debug, Serialize)]
struct RegionMqttMessage<'a> {
    region: &'a str,
    state: &'a str,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = sanitize_name(
            config
                .publisher_id
                .as_deref()
                .unwrap_or("beacon-presence"),
        );

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config.topic_path.clone().unwrap_or("beacons".to_string()),
                active: Arc::new(Mutex::new(HashSet::new())),
            },
            eventloop,
        )
    }

    fn command_topic(&self, command: &str) -> String {
        format!("{}/scan/{}", self.topic_path, command)
    }

    fn device_topic(&self, suffix: &str) -> String {
        format!("{}/{}/{}", self.topic_path, self.publisher_id, suffix)
    }

    pub fn stop_topic(&self) -> String {
        self.command_topic("stop")
    }

    pub async fn subscribe(&self) -> Result<(), ClientError> {
        self.client
            .subscribe_many(vec![
                SubscribeFilter::new(self.command_topic("start"), QoS::AtMostOnce),
                SubscribeFilter::new(self.command_topic("stop"), QoS::AtMostOnce),
            ])
            .await?;

        Ok(())
    }

    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: broadcast::Sender<ScanCommand>,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        let Some(command) = ScanCommand::from_topic(&p.topic) else {
                            continue;
                        };

                        if let Err(err) = tx.send(command) {
                            error!("Error forwarding scan command: {:?}", err);
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub fn announce_region(&self, region: &Region, state: RegionState) -> Result<(), ClientError> {
        let message = RegionMqttMessage {
            region: &region.unique_id,
            state: match state {
                RegionState::Inside => "inside",
                RegionState::Outside => "outside",
            },
        };
        self.publish_retained(self.device_topic("region"), serde_json::to_vec(&message))
    }

    fn publish_retained(
        &self,
        topic: String,
        payload: serde_json::Result<Vec<u8>>,
    ) -> Result<(), ClientError> {
        let payload = match payload {
            Ok(payload) => payload,
            Err(err) => {
                error!("Error serializing payload for {}: {:?}", topic, err);
                return Ok(());
            }
        };
        self.client
            .try_publish(topic, QoS::AtLeastOnce, true, payload)
    }

    /// An empty retained message removes whatever the broker kept on `topic`.
    fn clear_retained(&self, topic: String) -> Result<(), ClientError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, true, Vec::new())
    }

    fn notification_topic(&self, notification: &Notification) -> String {
        if notification.summary {
            self.device_topic("notification/summary")
        } else {
            self.device_topic(&format!("notification/{}", notification.handle.0))
        }
    }

    fn active(&self) -> std::sync::MutexGuard<'_, HashSet<NotificationHandle>> {
        self.active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub async fn disconnect(&self) -> Result<(), ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

impl Notifier for MqttClient {
    type Error = ClientError;

    fn notify(&self, notification: &Notification) -> Result<(), ClientError> {
        info!("Posting notification {}: {}", notification.handle.0, notification.text);
        if !notification.summary {
            self.active().insert(notification.handle);
        }
        self.publish_retained(
            self.notification_topic(notification),
            serde_json::to_vec(notification),
        )
    }

    fn cancel(&self, handle: NotificationHandle) -> Result<(), ClientError> {
        debug!("Cancelling notification {}", handle.0);
        let remaining = {
            let mut active = self.active();
            active.remove(&handle);
            active.len()
        };
        self.clear_retained(self.device_topic(&format!("notification/{}", handle.0)))?;
        if remaining == 0 {
            self.clear_retained(self.device_topic("notification/summary"))?;
        }
        Ok(())
    }

    fn cancel_all(&self) -> Result<(), ClientError> {
        let handles: Vec<_> = self.active().drain().collect();
        info!("Cancelling {} notifications", handles.len());
        for handle in handles {
            self.clear_retained(self.device_topic(&format!("notification/{}", handle.0)))?;
        }
        self.clear_retained(self.device_topic("notification/summary"))
    }

    fn show_foreground(&self, status: &ForegroundStatus) -> Result<(), ClientError> {
        self.publish_retained(self.device_topic("foreground"), serde_json::to_vec(status))
    }

    fn clear_foreground(&self) -> Result<(), ClientError> {
        self.clear_retained(self.device_topic("foreground"))
    }
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (MqttClient, rumqttc::EventLoop) {
        let config = config::MqttConfig {
            host: "localhost".to_string(),
            port: None,
            username: None,
            password: None,
            publisher_id: Some("Hall Pi".to_string()),
            topic_path: None,
            keep_alive_seconds: None,
        };
        MqttClient::new(&config)
    }

    #[test]
    fn test_sanitize_name() {
        let name = "Test's Device 123";
        let sanitized = super::sanitize_name(name);
        assert_eq!(sanitized, "test_s_device_123");
        assert_eq!(super::sanitize_name("beacon-presence"), "beacon-presence");
    }

    #[test]
    fn test_topics() {
        let (client, _eventloop) = client();
        assert_eq!(client.stop_topic(), "beacons/scan/stop");
        assert_eq!(client.device_topic("foreground"), "beacons/hall_pi/foreground");

        let notification = Notification::presence(NotificationHandle(4), "inside: 1".to_string());
        assert_eq!(
            client.notification_topic(&notification),
            "beacons/hall_pi/notification/4"
        );
        assert_eq!(
            client.notification_topic(&Notification::summary(1)),
            "beacons/hall_pi/notification/summary"
        );
    }

    #[test]
    fn test_tracks_active_notifications() {
        // Publishes only queue up while the event loop is alive.
        let (client, _eventloop) = client();
        client
            .notify(&Notification::presence(NotificationHandle(1), "inside: 1".to_string()))
            .unwrap();
        client
            .notify(&Notification::presence(NotificationHandle(2), "inside: 2".to_string()))
            .unwrap();
        client.notify(&Notification::summary(2)).unwrap();
        assert_eq!(client.active().len(), 2);

        client.cancel(NotificationHandle(1)).unwrap();
        assert_eq!(client.active().len(), 1);

        client.cancel_all().unwrap();
        assert!(client.active().is_empty());
    }
}
