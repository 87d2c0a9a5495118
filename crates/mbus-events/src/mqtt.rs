//! MQTT transport on `rumqttc`

use std::time::Duration;

use async_trait::async_trait;
use mbus_core::{EventsConfig, MQTT_MAX_PAYLOAD};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{EventTransport, EventsError, TransportEvent};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 64;

/// Connection to an MQTT broker
///
/// Every [`connect`](EventTransport::connect) builds a fresh client; the
/// event loop runs on its own task and forwards publishes to the connector.
pub struct MqttTransport {
    options: MqttOptions,
    client: Mutex<Option<AsyncClient>>,
}

impl MqttTransport {
    /// Build transport from `[mqtt]` settings
    #[must_use]
    pub fn new(config: &EventsConfig) -> Self {
        let client_id = format!("mbus-{}", uuid::Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, config.broker.clone(), config.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_max_packet_size(MQTT_MAX_PAYLOAD, MQTT_MAX_PAYLOAD);
        if !config.user.is_empty() {
            options.set_credentials(config.user.clone(), config.password.clone());
        }

        Self {
            options,
            client: Mutex::new(None),
        }
    }

    fn client(&self) -> Result<AsyncClient, EventsError> {
        self.client.lock().clone().ok_or(EventsError::NotConnected)
    }
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (host, port) = self.options.broker_address();
        f.debug_struct("MqttTransport")
            .field("host", &host)
            .field("port", &port)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EventTransport for MqttTransport {
    async fn connect(
        &self,
        inbound: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), EventsError> {
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    return Err(EventsError::Connection(format!("{:?}", ack.code)));
                }
                Ok(_) => {}
                Err(e) => return Err(EventsError::Connection(e.to_string())),
            }
        }
        debug!("MQTT session established");

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        trace!(topic = %publish.topic, bytes = publish.payload.len(), "inbound publish");
                        let message = TransportEvent::Message {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                        if inbound.send(message).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = inbound.send(TransportEvent::ConnectionLost(e.to_string()));
                        break;
                    }
                }
            }
        });

        *self.client.lock() = Some(client);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), EventsError> {
        self.client()?
            .subscribe(filter, QoS::AtMostOnce)
            .await
            .map_err(|e| EventsError::Subscribe {
                filter: filter.to_string(),
                reason: e.to_string(),
            })
    }

    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), EventsError> {
        self.client()?
            .publish(topic, QoS::AtMostOnce, retain, payload.to_vec())
            .await
            .map_err(|e| EventsError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}
