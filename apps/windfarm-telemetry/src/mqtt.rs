use crate::config::Config;
use crate::ingest::TelemetryIngestor;
use crate::telemetry::parse_mqtt_payload;
use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::time::{sleep, Duration};

pub fn telemetry_filter(prefix: &str) -> String {
    format!("{}/+/telemetry", prefix.trim_end_matches('/'))
}

pub async fn run_listener(config: Config, ingestor: TelemetryIngestor) -> Result<()> {
    let filter = telemetry_filter(&config.mqtt_topic_prefix);
    loop {
        let mut mqttoptions = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        mqttoptions.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 32);
        let stats = ingestor.stats();

        match client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
            Ok(_) => {
                tracing::info!(topic=%filter, "subscribed to turbine telemetry");
                stats.set_mqtt_connected(true);
            }
            Err(err) => {
                tracing::warn!(error=%err, "failed to subscribe to MQTT; retrying");
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let mut payload = publish.payload.to_vec();
                    match parse_mqtt_payload(&config.mqtt_topic_prefix, &publish.topic, &mut payload) {
                        Ok(Some(record)) => {
                            if let Err(err) = ingestor.ingest(record).await {
                                tracing::warn!(error=%err, topic=%publish.topic, "rejected MQTT record");
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            tracing::warn!(error=%err, topic=%publish.topic, "failed to decode MQTT payload")
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    stats.set_mqtt_connected(true);
                }
                Ok(_) => {}
                Err(err) => {
                    stats.set_mqtt_connected(false);
                    tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}
