use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{MqttOptions, QoS};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::{BrokerConfig, ConfigSnapshot};
use crate::messages::OutboundEvent;
use crate::sink::{Sink, SinkError};

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_CLIENT_ID: &str = "beacon-scan";
const REQUEST_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Publishes outbound events as JSON to the snapshot's broker and topic.
///
/// A connection is opened per scan run in `acquire` and closed in `release`.
/// `handle` only enqueues the publish; a background task drives the client
/// event loop and counts broker acknowledgements, so `acquire` fails when
/// called outside a Tokio runtime.
#[derive(Debug)]
pub struct MqttSink {
    client_id: String,
    keep_alive: Duration,
    credentials: Option<(String, String)>,
    connection: Option<Connection>,
}

#[derive(Debug)]
struct Connection {
    client: rumqttc::AsyncClient,
    topic: String,
    acked: Arc<AtomicU64>,
    published: u64,
    task: JoinHandle<()>,
}

impl MqttSink {
    pub fn new(config: &BrokerConfig) -> Self {
        MqttSink {
            client_id: config
                .client_id
                .clone()
                .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            keep_alive: Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)),
            credentials: config.username.clone().zip(config.password.clone()),
            connection: None,
        }
    }

    fn options(&self, config: &ConfigSnapshot) -> Result<MqttOptions, SinkError> {
        let (host, port) = parse_broker_address(&config.broker)?;

        let mut mqttoptions = MqttOptions::new(self.client_id.clone(), host, port);
        mqttoptions.set_keep_alive(self.keep_alive);

        if let Some((username, password)) = &self.credentials {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        Ok(mqttoptions)
    }
}

impl Sink for MqttSink {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn acquire(&mut self, config: &ConfigSnapshot) -> Result<(), SinkError> {
        let mqttoptions = self.options(config)?;
        let runtime = Handle::try_current()
            .map_err(|_| SinkError::Connect("no Tokio runtime to drive the client".to_string()))?;
        info!(
            "Connecting MQTT publisher to {} (topic {})",
            config.broker, config.topic
        );

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, REQUEST_CAPACITY);
        let acked = Arc::new(AtomicU64::new(0));
        let task = runtime.spawn(drive_event_loop(eventloop, acked.clone()));

        self.connection = Some(Connection {
            client,
            topic: config.topic.clone(),
            acked,
            published: 0,
            task,
        });
        Ok(())
    }

    fn handle(&mut self, event: &OutboundEvent) -> Result<(), SinkError> {
        let connection = self.connection.as_mut().ok_or(SinkError::NotConnected)?;
        let payload = serde_json::to_vec(event)?;

        debug!("Publishing {} to {}", event.beacon_type(), connection.topic);
        connection
            .client
            .try_publish(connection.topic.as_str(), QoS::AtLeastOnce, false, payload)
            .map_err(|err| SinkError::Publish(err.to_string()))?;
        connection.published += 1;
        Ok(())
    }

    fn release(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };

        info!(
            "Closing MQTT publisher ({} published, {} acknowledged)",
            connection.published,
            connection.acked.load(Ordering::Relaxed)
        );

        if let Err(err) = connection.client.try_disconnect() {
            warn!("Error requesting MQTT disconnect: {:?}", err);
            connection.task.abort();
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            debug!("No runtime to flush the MQTT disconnect, aborting event loop");
            connection.task.abort();
            return;
        };

        // Give the event loop a moment to flush the disconnect, then stop it.
        runtime.spawn(async move {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut connection.task)
                .await
                .is_err()
            {
                debug!("MQTT event loop did not finish in time, aborting");
                connection.task.abort();
            }
        });
    }
}

async fn drive_event_loop(mut eventloop: rumqttc::EventLoop, acked: Arc<AtomicU64>) {
    loop {
        match eventloop.poll().await {
            Ok(notification) => match notification {
                rumqttc::Event::Incoming(rumqttc::Packet::PubAck(_)) => {
                    acked.fetch_add(1, Ordering::Relaxed);
                }
                rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                    debug!("Connection acknowledged");
                }
                rumqttc::Event::Outgoing(rumqttc::Outgoing::Disconnect) => {
                    debug!("Disconnected MQTT client");
                    break;
                }
                _ => {}
            },
            Err(e) => {
                error!("Error polling MQTT event loop: {:?}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Split `host[:port]`, defaulting the port to 1883.
fn parse_broker_address(address: &str) -> Result<(String, u16), SinkError> {
    let address = address.trim();
    let address = address
        .strip_prefix("mqtt://")
        .or_else(|| address.strip_prefix("tcp://"))
        .unwrap_or(address);

    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| SinkError::Connect(format!("invalid port in {address:?}")))?;
            (host, port)
        }
        None => (address, DEFAULT_PORT),
    };

    if host.is_empty() {
        return Err(SinkError::Connect(format!("missing host in {address:?}")));
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::sample_event;

    #[test]
    fn test_parse_broker_address() {
        assert_eq!(
            parse_broker_address("localhost:1884").unwrap(),
            ("localhost".to_string(), 1884)
        );
        assert_eq!(
            parse_broker_address("mqtt://broker.local").unwrap(),
            ("broker.local".to_string(), 1883)
        );
        assert!(parse_broker_address("localhost:notaport").is_err());
        assert!(parse_broker_address(":1883").is_err());
    }

    #[test]
    fn test_publish_without_connection() {
        let mut sink = MqttSink::new(&BrokerConfig::default());
        let err = sink.handle(&sample_event()).unwrap_err();
        assert!(matches!(err, SinkError::NotConnected));
        // Releasing an unacquired sink is a no-op.
        sink.release();
    }

    #[test]
    fn test_acquire_rejects_bad_broker() {
        let mut sink = MqttSink::new(&BrokerConfig::default());
        let config = ConfigSnapshot {
            broker: "localhost:99999".to_string(),
            topic: "beacons".to_string(),
        };
        assert!(matches!(sink.acquire(&config), Err(SinkError::Connect(_))));
    }

    #[test]
    fn test_acquire_outside_runtime_fails() {
        let mut sink = MqttSink::new(&BrokerConfig::default());
        let config = ConfigSnapshot {
            broker: "127.0.0.1:1".to_string(),
            topic: "beacons".to_string(),
        };
        assert!(matches!(sink.acquire(&config), Err(SinkError::Connect(_))));
        assert!(sink.connection.is_none());
    }

    #[test]
    fn test_release_outside_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let mut sink = MqttSink::new(&BrokerConfig::default());
        let config = ConfigSnapshot {
            broker: "127.0.0.1:1".to_string(),
            topic: "beacons".to_string(),
        };
        {
            let _guard = runtime.enter();
            sink.acquire(&config).unwrap();
        }

        sink.release();
        assert!(sink.connection.is_none());
    }

    #[tokio::test]
    async fn test_publish_is_enqueued_and_released() {
        let mut sink = MqttSink::new(&BrokerConfig::default());
        let config = ConfigSnapshot {
            broker: "127.0.0.1:1".to_string(),
            topic: "beacons".to_string(),
        };
        sink.acquire(&config).unwrap();

        sink.handle(&sample_event()).unwrap();
        assert_eq!(sink.connection.as_ref().map(|c| c.published), Some(1));

        sink.release();
        assert!(sink.connection.is_none());
    }
}
