use crate::config::MqttConfig;
use crate::models::{MeterReading, Metrics};
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Prefix picked up by the Prometheus MQTT gateway
pub const METRIC_TOPIC_BASE: &str = "prometheus/job/meter/node";
/// Prefix for the JSON payload consumed by Home Assistant
pub const AGGREGATE_TOPIC_BASE: &str = "home/meter";

const REQUEST_QUEUE_SIZE: usize = 10;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("MQTT connection to {host}:{port} failed: {reason}")]
    Connect { host: String, port: u16, reason: String },
    #[error("timed out connecting to MQTT broker {host}:{port}")]
    ConnectTimeout { host: String, port: u16 },
    #[error("MQTT publish to {topic} failed: {source}")]
    Publish { topic: String, source: ClientError },
    #[error("MQTT subscribe to {topic} failed: {source}")]
    Subscribe { topic: String, source: ClientError },
    #[error("unable to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outbound side of the broker connection. Publishing hands the message to
/// the client and does not wait for an acknowledgement.
#[allow(async_fn_in_trait)]
pub trait MetricPublisher {
    async fn publish(&mut self, topic: &str, payload: String, retain: bool) -> Result<(), TransportError>;

    async fn close(&mut self);
}

pub fn metric_topic(meter_name: &str, metric: &str) -> String {
    format!("{}/{}/{}", METRIC_TOPIC_BASE, meter_name, metric)
}

pub fn aggregate_topic(meter_name: &str) -> String {
    format!("{}/{}", AGGREGATE_TOPIC_BASE, meter_name)
}

/// Plain number as payload, always with a decimal point (`250.0`, `12.346`).
pub fn format_metric_value(value: f64) -> String {
    format!("{:?}", value)
}

/// Publishes every metric on its own retained topic, then all of them as one
/// JSON document with a timestamp.
pub async fn publish_metrics<P: MetricPublisher>(
    publisher: &mut P,
    meter_name: &str,
    metrics: &Metrics,
    timestamp: u64,
) -> Result<(), TransportError> {
    for (name, value) in metrics {
        publisher.publish(&metric_topic(meter_name, name), format_metric_value(*value), true).await?;
    }

    let payload = serde_json::to_string(&MeterReading { metrics, timestamp })?;
    publisher.publish(&aggregate_topic(meter_name), payload, true).await?;
    Ok(())
}

fn mqtt_options(config: &MqttConfig, client_id: &str) -> MqttOptions {
    let mut mqttoptions = MqttOptions::new(client_id, config.host.clone(), config.port);
    mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive.max(5)));
    if let Some(user) = &config.user {
        mqttoptions.set_credentials(user.clone(), config.pass.clone().unwrap_or_default());
    }
    mqttoptions
}

async fn wait_for_connack(eventloop: &mut EventLoop, config: &MqttConfig) -> Result<(), TransportError> {
    let connect = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        return Ok(());
                    }
                    return Err(format!("broker refused connection: {:?}", ack.code));
                }
                Ok(_) => {}
                Err(e) => return Err(e.to_string()),
            }
        }
    };

    match tokio::time::timeout(Duration::from_secs(config.connect_timeout), connect).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(reason)) => Err(TransportError::Connect { host: config.host.clone(), port: config.port, reason }),
        Err(_) => Err(TransportError::ConnectTimeout { host: config.host.clone(), port: config.port }),
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
    eventloop: JoinHandle<()>,
}

impl MqttPublisher {
    /// Connects to the broker and waits for it to accept the session, so an
    /// unreachable broker is reported at startup. Afterwards the event loop
    /// runs in its own task and reconnects on its own.
    pub async fn connect(config: &MqttConfig, client_id: &str) -> Result<Self, TransportError> {
        info!("MQTT connection to {}:{} starting up", config.host, config.port);
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(config, client_id), REQUEST_QUEUE_SIZE);

        wait_for_connack(&mut eventloop, config).await?;
        info!("Connected to MQTT broker {}:{}", config.host, config.port);

        Ok(Self::spawn(client, eventloop))
    }

    /// Runs the event loop in its own task, reconnecting after errors.
    fn spawn(client: AsyncClient, mut eventloop: EventLoop) -> Self {
        let eventloop = tokio::spawn(async move {
            debug!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Reconnected to MQTT broker");
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("MQTT disconnect sent, leaving event loop");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        MqttPublisher { client, eventloop }
    }
}

impl MetricPublisher for MqttPublisher {
    /// Queues the message without waiting. While the broker is away the
    /// queue fills up and further publishes fail instead of blocking.
    async fn publish(&mut self, topic: &str, payload: String, retain: bool) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload)
            .map_err(|source| TransportError::Publish { topic: topic.to_string(), source })
    }

    async fn close(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            warn!("MQTT disconnect failed: {}", e);
        }
        if tokio::time::timeout(Duration::from_secs(2), &mut self.eventloop).await.is_err() {
            self.eventloop.abort();
        }
        info!("MQTT connection closed");
    }
}

/// Subscribes to `topic` and returns the first payload that arrives within
/// `wait`, usually the retained one. `None` if nothing came.
pub async fn read_retained(
    config: &MqttConfig,
    client_id: &str,
    topic: &str,
    wait: Duration,
) -> Result<Option<String>, TransportError> {
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config, client_id), REQUEST_QUEUE_SIZE);
    wait_for_connack(&mut eventloop, config).await?;

    client
        .subscribe(topic, QoS::AtMostOnce)
        .await
        .map_err(|source| TransportError::Subscribe { topic: topic.to_string(), source })?;

    let receive = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(p))) if p.topic == topic => {
                    return Ok(String::from_utf8_lossy(&p.payload).into_owned());
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(TransportError::Connect {
                        host: config.host.clone(),
                        port: config.port,
                        reason: e.to_string(),
                    })
                }
            }
        }
    };

    let result = match tokio::time::timeout(wait, receive).await {
        Ok(Ok(payload)) => Ok(Some(payload)),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            debug!("Nothing received on {} within {:?}", topic, wait);
            Ok(None)
        }
    };

    let _ = client.try_disconnect();
    // Flush the disconnect packet
    let _ = tokio::time::timeout(Duration::from_millis(500), eventloop.poll()).await;
    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Remembers everything published, optionally failing after `fail_after` messages.
    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        pub published: Vec<(String, String, bool)>,
        pub fail_after: Option<usize>,
        pub closed: bool,
    }

    impl MetricPublisher for RecordingPublisher {
        async fn publish(&mut self, topic: &str, payload: String, retain: bool) -> Result<(), TransportError> {
            if self.fail_after.is_some_and(|n| self.published.len() >= n) {
                return Err(TransportError::Connect {
                    host: "localhost".to_string(),
                    port: 1883,
                    reason: "connection reset".to_string(),
                });
            }
            self.published.push((topic.to_string(), payload, retain));
            Ok(())
        }

        async fn close(&mut self) {
            self.closed = true;
        }
    }

    #[test]
    fn test_topics() {
        assert_eq!(metric_topic("light", "total_kwh"), "prometheus/job/meter/node/light/total_kwh");
        assert_eq!(aggregate_topic("heating"), "home/meter/heating");
    }

    #[test]
    fn test_value_format() {
        assert_eq!(format_metric_value(12.346), "12.346");
        assert_eq!(format_metric_value(250.0), "250.0");
        assert_eq!(format_metric_value(-0.5), "-0.5");
    }

    #[tokio::test]
    async fn test_publish_metrics_layout() {
        let mut metrics = Metrics::new();
        metrics.insert("power_w".to_string(), 250.0);
        metrics.insert("total_kwh".to_string(), 12.346);

        let mut publisher = RecordingPublisher::default();
        publish_metrics(&mut publisher, "light", &metrics, 1_700_000_000).await.unwrap();

        assert_eq!(publisher.published.len(), 3);
        assert_eq!(publisher.published[0], ("prometheus/job/meter/node/light/power_w".to_string(), "250.0".to_string(), true));
        assert_eq!(publisher.published[1], ("prometheus/job/meter/node/light/total_kwh".to_string(), "12.346".to_string(), true));

        let (topic, payload, retain) = &publisher.published[2];
        assert_eq!(topic, "home/meter/light");
        assert!(retain);
        let json: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(json["total_kwh"], 12.346);
        assert_eq!(json["power_w"], 250.0);
        assert_eq!(json["timestamp"], 1_700_000_000u64);
    }

    #[tokio::test]
    async fn test_meters_stay_in_their_namespace() {
        let mut light = Metrics::new();
        light.insert("total_kwh".to_string(), 1.0);
        let mut heating = Metrics::new();
        heating.insert("total_kwh".to_string(), 2.0);

        let mut publisher = RecordingPublisher::default();
        publish_metrics(&mut publisher, "light", &light, 1).await.unwrap();
        publish_metrics(&mut publisher, "heating", &heating, 1).await.unwrap();

        for (topic, payload, _) in &publisher.published {
            if topic.contains("/light") {
                assert!(payload == "1.0" || payload.contains("1.0"), "{topic}: {payload}");
                assert!(!payload.contains("2.0"));
            } else {
                assert!(topic.contains("/heating"));
                assert!(!payload.contains("1.0"));
            }
        }
    }

    #[tokio::test]
    async fn test_publish_does_not_block_while_broker_is_down() {
        let config = MqttConfig { host: "127.0.0.1".to_string(), port: 1, ..MqttConfig::default() };
        let (client, eventloop) = AsyncClient::new(mqtt_options(&config, "sml2mqtt-test"), REQUEST_QUEUE_SIZE);
        let mut publisher = MqttPublisher::spawn(client, eventloop);

        let metrics: Metrics = crate::metering_sml::meter_definitions::REGISTRY
            .iter()
            .map(|entry| (entry.metric.to_string(), 1.0))
            .collect();

        let mut failed_cycles = 0;
        for _ in 0..4 {
            let cycle = tokio::time::timeout(Duration::from_secs(1), publish_metrics(&mut publisher, "light", &metrics, 1));
            let result = cycle.await.expect("publish_metrics must not wait for the broker");
            if matches!(result, Err(TransportError::Publish { .. })) {
                failed_cycles += 1;
            }
        }
        // The request queue holds one cycle, every later one fails fast
        assert!(failed_cycles >= 3, "only {failed_cycles} cycles failed");

        let closing = tokio::time::timeout(Duration::from_secs(4), publisher.close());
        assert!(closing.await.is_ok(), "close must not wait for the broker");
    }

    #[tokio::test]
    async fn test_publish_error_is_returned() {
        let mut metrics = Metrics::new();
        metrics.insert("power_w".to_string(), 1.0);

        let mut publisher = RecordingPublisher { fail_after: Some(0), ..Default::default() };
        assert!(publish_metrics(&mut publisher, "light", &metrics, 1).await.is_err());
    }
}
