//! MQTT device bus.
//!
//! One connection per process. The daemon subscribes to its own topic
//! (named after the AI) and republishes action payloads to whatever topics
//! the action table names. Publishes are best-effort: a broker outage is
//! logged and the message dropped, never retried.

use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use tracing::{debug, error, info, warn};

pub struct MqttBus {
    client: Client,
}

impl MqttBus {
    /// Connect, subscribe to the daemon's own topic and start the event
    /// loop on a dedicated thread. `on_message` fires for every publish
    /// arriving on the subscribed topic.
    pub fn connect(
        host: &str,
        port: u16,
        keep_alive_secs: u64,
        own_topic: &str,
        on_message: impl Fn(&[u8]) + Send + 'static,
    ) -> Result<Self> {
        let client_id = format!("dawnd-{}", std::process::id());
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(keep_alive_secs));

        // Credentials come from the environment, never from config files.
        if let (Ok(user), Ok(pass)) = (std::env::var("MQTT_USERNAME"), std::env::var("MQTT_PASSWORD")) {
            options.set_credentials(user, pass);
        }

        let (client, mut connection) = Client::new(options, 64);
        client.subscribe(own_topic, QoS::AtLeastOnce).with_context(|| format!("failed to subscribe to {own_topic}"))?;

        let topic = own_topic.to_string();
        std::thread::Builder::new()
            .name("mqtt-bus".into())
            .spawn(move || {
                for event in connection.iter() {
                    match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            if publish.topic == topic {
                                debug!("Inbound message on {} ({} bytes)", publish.topic, publish.payload.len());
                                on_message(&publish.payload);
                            }
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("MQTT broker connection established");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            // The event loop reconnects on its own; just
                            // keep it from spinning hot while the broker
                            // is away.
                            warn!("MQTT connection error: {}", e);
                            std::thread::sleep(Duration::from_secs(1));
                        }
                    }
                }
                debug!("MQTT event loop finished");
            })
            .context("failed to spawn MQTT thread")?;

        info!("MQTT bus connected to {}:{}, subscribed to {}", host, port, own_topic);
        Ok(Self { client })
    }

    /// Best-effort publish; failures are logged and the payload dropped.
    pub fn publish(&self, topic: &str, payload: &[u8]) {
        if let Err(e) = self.client.try_publish(topic, QoS::AtLeastOnce, false, payload) {
            error!("MQTT publish to {} failed: {}", topic, e);
        }
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        let _ = self.client.disconnect();
    }
}
