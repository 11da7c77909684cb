use crate::config::Config;
use crate::dead_letter::{DeadLetter, DeadLetterSink};
use crate::error::DeadLetterReason;
use crate::ingest::liveness::{Heartbeat, LivenessHandle};
use crate::ingest::DataMessage;
use crate::pipeline::PipelineHandle;
use crate::telemetry::{
    parse_data_payload, parse_heartbeat_payload, parse_topic, topic_filters, MessageKind,
};
use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::Rng;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::time::{sleep, Duration};

/// Bounded exponential backoff with equal jitter: attempt `n` waits somewhere in
/// `[d/2, d]` where `d = min(min * 2^n, max)`.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            attempt: 0,
        }
    }

    fn ceiling(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(20)).unwrap_or(u32::MAX);
        self.min.saturating_mul(factor).min(self.max)
    }

    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        let half = ceiling / 2;
        let spread = (ceiling - half).as_millis() as u64;
        let jitter = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=spread)
        };
        half + Duration::from_millis(jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// What a single publish turns into once its topic and payload have been looked at.
#[derive(Debug)]
pub enum Inbound {
    Data(DataMessage),
    Heartbeat(Heartbeat),
    Rejected(DeadLetter),
    Ignored,
}

pub fn classify_publish(
    topic_prefix: &str,
    topic: &str,
    payload: Bytes,
    received_at: DateTime<Utc>,
) -> Inbound {
    let Some(parsed) = parse_topic(topic_prefix, topic) else {
        tracing::debug!(topic, "ignoring publish on unrecognised topic");
        return Inbound::Ignored;
    };

    let mut scratch = payload.to_vec();
    match parsed.kind {
        MessageKind::Heartbeat => match parse_heartbeat_payload(&mut scratch) {
            Ok(()) => Inbound::Heartbeat(Heartbeat {
                sensor: parsed.sensor.to_string(),
                raw: payload,
                received_at,
            }),
            Err(err) => {
                tracing::warn!(error = %err, topic, "failed to decode heartbeat payload");
                Inbound::Rejected(DeadLetter::from_raw(
                    DeadLetterReason::MalformedPayload,
                    topic,
                    &payload,
                    received_at,
                ))
            }
        },
        MessageKind::Data => match parse_data_payload(&mut scratch) {
            Ok(batch) => Inbound::Data(DataMessage {
                sensor: parsed.sensor.to_string(),
                topic: topic.to_string(),
                batch,
                raw: payload,
                received_at,
            }),
            Err(err) => {
                tracing::warn!(error = %err, topic, "failed to decode data payload");
                Inbound::Rejected(DeadLetter::from_raw(
                    DeadLetterReason::MalformedPayload,
                    topic,
                    &payload,
                    received_at,
                ))
            }
        },
    }
}

fn mqtt_options(config: &Config) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    options.set_keep_alive(config.mqtt_keepalive());
    if let Some(username) = &config.mqtt_username {
        options.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    options
}

/// Owns the MQTT connection for the lifetime of the worker. Only returns when the
/// processing queue has gone away.
pub async fn run_listener(
    config: Config,
    pipeline: PipelineHandle,
    liveness: LivenessHandle,
    dead_letters: DeadLetterSink,
) -> Result<()> {
    let filters = topic_filters(&config.mqtt_topic_prefix);
    let stats = pipeline.stats();
    let mut backoff = ReconnectBackoff::new(config.reconnect_min(), config.reconnect_max());

    let (client, mut eventloop) = AsyncClient::new(mqtt_options(&config), 64);
    tracing::info!(
        host = %config.mqtt_host,
        port = config.mqtt_port,
        client_id = %config.mqtt_client_id,
        "connecting to MQTT broker"
    );

    loop {
        match eventloop.poll().await {
            // A refused ConnAck surfaces as `ConnectionError::ConnectionRefused` below.
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                backoff.reset();
                stats.set_mqtt_connected(true);
                for filter in &filters {
                    match client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
                        Ok(()) => tracing::info!(topic = %filter, "subscribed"),
                        Err(err) => {
                            tracing::warn!(error = %err, topic = %filter, "failed to queue subscribe")
                        }
                    }
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let inbound = classify_publish(
                    &config.mqtt_topic_prefix,
                    &publish.topic,
                    publish.payload,
                    Utc::now(),
                );
                match inbound {
                    Inbound::Data(message) => pipeline
                        .enqueue(message)
                        .await
                        .context("message processor stopped")?,
                    Inbound::Heartbeat(heartbeat) => liveness.heartbeat(heartbeat),
                    Inbound::Rejected(letter) => dead_letters.record(letter),
                    Inbound::Ignored => {}
                }
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                stats.set_mqtt_connected(false);
                tracing::warn!("MQTT broker sent disconnect");
            }
            Ok(_) => {}
            Err(err) => {
                stats.set_mqtt_connected(false);
                let delay = backoff.next_delay();
                tracing::warn!(
                    error = %err,
                    attempt = backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "MQTT connection dropped; reconnecting"
                );
                sleep(delay).await;
            }
        }
    }
}
