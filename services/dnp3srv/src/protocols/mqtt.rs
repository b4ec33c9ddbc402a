//! MQTT side of the bridge (rumqttc)
//!
//! Connect, reconnect and keep-alive belong to rumqttc's event loop. This
//! module subscribes to the telemetry topics on every (re)connect, turns
//! inbound publishes and connection changes into bridge events, and
//! publishes setpoints retained.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::bridge::{Bridge, BridgeEvent};
use crate::core::config::MqttSettings;
use crate::core::control::OutboundPublish;
use crate::error::{BridgeError, Result};

/// Outbound half of the MQTT client
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: &OutboundPublish) -> Result<()>;

    fn connected(&self) -> bool;
}

pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

pub struct MqttClient {
    client: AsyncClient,
    qos: QoS,
    connected: Arc<AtomicBool>,
}

impl MqttClient {
    /// Build the client and its (not yet polled) event loop
    pub fn new(settings: &MqttSettings) -> (Self, EventLoop) {
        let qos = qos_from_level(settings.qos);
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            options.set_credentials(username, password);
        }
        options.set_keep_alive(settings.keep_alive());
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            settings.availability_topic(),
            "offline",
            qos,
            true,
        ));

        let (client, eventloop) = AsyncClient::new(options, settings.request_capacity);
        (
            Self {
                client,
                qos,
                connected: Arc::new(AtomicBool::new(false)),
            },
            eventloop,
        )
    }

    /// Queue subscriptions without waiting on the event loop
    fn subscribe_all(&self, topics: &[String]) {
        for topic in topics {
            match self.client.try_subscribe(topic.as_str(), self.qos) {
                Ok(()) => debug!("Subscribed to {}", topic),
                Err(e) => error!("Subscribe to {} failed: {}", topic, e),
            }
        }
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("MQTT disconnect failed: {}", e);
        }
        self.connected.store(false, Ordering::Release);
    }
}

#[async_trait]
impl Publisher for MqttClient {
    async fn publish(&self, message: &OutboundPublish) -> Result<()> {
        self.client
            .publish(
                message.topic.as_str(),
                self.qos,
                true,
                message.payload.as_bytes().to_vec(),
            )
            .await
            .map_err(|e| BridgeError::publish(&message.topic, e))
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// Drive the rumqttc event loop until cancelled or disconnected
pub async fn run_event_loop(
    mut eventloop: EventLoop,
    client: Arc<MqttClient>,
    bridge: Arc<Bridge>,
    reconnect_delay: Duration,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                client.connected.store(true, Ordering::Release);
                client.subscribe_all(bridge.subscriptions());
                bridge.dispatch(BridgeEvent::Broker { connected: true });
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                bridge.dispatch(BridgeEvent::Telemetry {
                    topic: publish.topic,
                    payload,
                });
            },
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("MQTT client disconnected");
                break;
            },
            Ok(_) => {},
            Err(e) => {
                if client.connected.swap(false, Ordering::AcqRel) {
                    bridge.dispatch(BridgeEvent::Broker { connected: false });
                }
                warn!(
                    "MQTT connection error: {}. Retrying in {:?}",
                    e, reconnect_delay
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {},
                }
            },
        }
    }
    debug!("MQTT event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn test_client_starts_disconnected() {
        let (client, _eventloop) = MqttClient::new(&MqttSettings::default());
        assert!(!client.connected());
    }
}
