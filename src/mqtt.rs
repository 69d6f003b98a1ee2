use crate::config::Config;
use crate::error::RouteError;
use crate::pipeline::{IngestStats, LaneRouter};
use crate::router;
use anyhow::Result;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// Connects to the broker, subscribes to the fleet topic tree, and feeds
/// decoded messages into the device lanes. Lost connections are retried
/// forever; the broker retains no session state we depend on, so every
/// reconnect resubscribes from scratch.
pub async fn run_listener(
    config: Config,
    lanes: Arc<LaneRouter>,
    shutdown: CancellationToken,
) -> Result<()> {
    let filter = format!("{}/+/+", config.mqtt_topic_prefix);
    let stats = lanes.stats();
    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }

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

        match client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
            Ok(_) => {
                tracing::info!(topic = %filter, "subscribed to fleet feed");
                stats.set_mqtt_connected(true);
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to subscribe; retrying");
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    stats.set_mqtt_connected(false);
                    return Ok(());
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        let received_at = Utc::now();
                        let (category, device_id) =
                            match router::classify(&config.mqtt_topic_prefix, &publish.topic) {
                                Ok(parts) => parts,
                                Err(err) => {
                                    count_route_error(&stats, &err);
                                    tracing::debug!(error = %err, topic = %publish.topic, "dropping message");
                                    continue;
                                }
                            };
                        let mut payload = publish.payload.to_vec();
                        match router::decode(category, device_id, &mut payload, received_at) {
                            Ok(msg) => lanes.dispatch(msg),
                            Err(err) => {
                                stats.record_malformed();
                                tracing::warn!(error = %err, topic = %publish.topic, "failed to decode payload");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        stats.set_mqtt_connected(false);
                        tracing::warn!(error = %err, "MQTT connection dropped; reconnecting");
                        break;
                    }
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}

/// Only a bad category is an unknown topic; broken topic shapes and empty
/// device ids count as malformed input.
fn count_route_error(stats: &IngestStats, err: &RouteError) {
    match err {
        RouteError::UnknownCategory(_) => stats.record_unknown_topic(),
        RouteError::MalformedTopic(_)
        | RouteError::EmptyDeviceId(_)
        | RouteError::MalformedPayload(_) => stats.record_malformed(),
    }
}
