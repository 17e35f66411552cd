//! MQTT transport
//!
//! One shared client carries all device traffic. The event loop task owns
//! reconnection: every successful (re)connect re-runs the batched topic
//! subscription, and every inbound publish is handed to a fresh worker task
//! so the receive loop never blocks on downstream processing.

pub mod middleware;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::MqttConfig;
use crate::{Error, Result};

/// Keep-alive interval
const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Deadline for one publish
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Health poll cadence
const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Pause before re-polling a failed connection
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Topics per subscribe request
const SUBSCRIBE_BATCH: usize = 100;

/// Event loop request queue depth
const REQUEST_QUEUE: usize = 64;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    ShuttingDown = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            4 => Self::ShuttingDown,
            _ => Self::Disconnected,
        }
    }
}

/// One message delivered by the broker
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Raw topic string
    pub topic: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
}

/// Receives every inbound message on its own worker task
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message; errors are the handler's to log
    async fn handle(&self, message: InboundMessage);
}

/// Cloneable handle for publishing through the shared client
#[derive(Clone)]
pub struct TransportHandle {
    client: AsyncClient,
    state: Arc<AtomicU8>,
}

impl TransportHandle {
    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Whether the client currently holds a broker connection
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Publish a payload at QoS 0.
    ///
    /// Waits for the request to be accepted by the event loop, bounded by a
    /// five-second deadline; cancelling the caller's context aborts the wait.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`], [`Error::PublishTimeout`], or
    /// [`Error::Mqtt`] when the client is shutting down or the request fails.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.state() == ConnectionState::ShuttingDown {
            return Err(Error::Mqtt("client is shutting down".to_string()));
        }

        let send = self.client.publish(topic, QoS::AtMostOnce, false, payload);
        tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(PUBLISH_TIMEOUT, send) => match result {
                Err(_) => Err(Error::PublishTimeout),
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(Error::Mqtt(e.to_string())),
            },
        }
    }
}

/// Start the shared MQTT client.
///
/// Spawns the event loop task and the 30-second health poll; both stop when
/// `shutdown` fires.
///
/// # Errors
///
/// Returns an error when the broker address cannot be parsed.
pub fn start(
    config: &MqttConfig,
    topics: Vec<String>,
    handler: Arc<dyn MessageHandler>,
    shutdown: CancellationToken,
) -> Result<TransportHandle> {
    let (host, port) = parse_address(&config.address)?;

    let client_id = Uuid::new_v4().to_string();
    let mut options = MqttOptions::new(client_id.clone(), host, port);
    options.set_keep_alive(KEEP_ALIVE);
    if !config.client.username.is_empty() {
        options.set_credentials(
            config.client.username.clone(),
            config.client.password.clone(),
        );
    }

    let (client, event_loop) = AsyncClient::new(options, REQUEST_QUEUE);
    let state = Arc::new(AtomicU8::new(ConnectionState::Connecting as u8));

    let handle = TransportHandle {
        client: client.clone(),
        state: Arc::clone(&state),
    };

    tokio::spawn(run_event_loop(
        event_loop,
        client,
        topics,
        handler,
        Arc::clone(&state),
        shutdown.clone(),
    ));
    tokio::spawn(run_health_loop(handle.clone(), shutdown));

    tracing::info!(address = %config.address, client_id = %client_id, "mqtt client started");
    Ok(handle)
}

/// Split a `tcp://host:port` broker address
fn parse_address(address: &str) -> Result<(String, u16)> {
    let stripped = address
        .strip_prefix("tcp://")
        .or_else(|| address.strip_prefix("mqtt://"))
        .unwrap_or(address);
    if stripped.is_empty() {
        return Err(Error::Config("mqtt.address is empty".to_string()));
    }

    match stripped.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| Error::Config(format!("bad mqtt port in {address:?}")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((stripped.to_string(), 1883)),
    }
}

/// Group topics into `SubscribeFilter` batches at QoS 0
fn subscription_batches(topics: &[String]) -> Vec<Vec<SubscribeFilter>> {
    topics
        .chunks(SUBSCRIBE_BATCH)
        .map(|chunk| {
            chunk
                .iter()
                .map(|t| SubscribeFilter::new(t.clone(), QoS::AtMostOnce))
                .collect()
        })
        .collect()
}

async fn subscribe_topics(client: &AsyncClient, topics: &[String]) -> Result<()> {
    if topics.is_empty() {
        return Err(Error::Config("no topics configured".to_string()));
    }
    for batch in subscription_batches(topics) {
        let count = batch.len();
        client
            .subscribe_many(batch)
            .await
            .map_err(|e| Error::Mqtt(e.to_string()))?;
        tracing::info!(count, "subscribed topic batch");
    }
    Ok(())
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    topics: Vec<String>,
    handler: Arc<dyn MessageHandler>,
    state: Arc<AtomicU8>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => {
                state.store(ConnectionState::ShuttingDown as u8, Ordering::Relaxed);
                let _ = client.disconnect().await;
                return;
            }
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                state.store(ConnectionState::Connected as u8, Ordering::Relaxed);
                tracing::info!(code = ?ack.code, "mqtt connected");
                // re-run on every reconnect so subscriptions survive
                if let Err(e) = subscribe_topics(&client, &topics).await {
                    tracing::error!(error = %e, "subscription failed, dropping connection for retry");
                    let _ = client.disconnect().await;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                let handler = Arc::clone(&handler);
                // fresh worker per message: the receive loop never blocks
                tokio::spawn(async move {
                    handler.handle(message).await;
                });
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                state.store(ConnectionState::Reconnecting as u8, Ordering::Relaxed);
                tracing::warn!("broker sent disconnect");
            }
            Ok(_) => {}
            Err(e) => {
                if shutdown.is_cancelled() {
                    return;
                }
                state.store(ConnectionState::Reconnecting as u8, Ordering::Relaxed);
                tracing::error!(error = %e, "mqtt connection lost, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Log a warning while the connection is down; the event loop task owns the
/// actual retry.
async fn run_health_loop(handle: TransportHandle, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let state = handle.state();
                if !matches!(state, ConnectionState::Connected | ConnectionState::ShuttingDown) {
                    tracing::warn!(state = ?state, "mqtt health check: not connected");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_prefixed_address() {
        assert_eq!(
            parse_address("tcp://broker.local:1883").unwrap(),
            ("broker.local".to_string(), 1883)
        );
        assert_eq!(
            parse_address("mqtt://10.0.0.5:8883").unwrap(),
            ("10.0.0.5".to_string(), 8883)
        );
    }

    #[test]
    fn bare_host_defaults_to_1883() {
        assert_eq!(
            parse_address("broker.local").unwrap(),
            ("broker.local".to_string(), 1883)
        );
    }

    #[test]
    fn rejects_bad_port() {
        assert!(parse_address("tcp://broker.local:xyz").is_err());
        assert!(parse_address("").is_err());
    }

    #[test]
    fn batches_cap_at_one_hundred() {
        let topics: Vec<String> = (0..250).map(|i| format!("test/T0001/D{i}/voice/server")).collect();
        let batches = subscription_batches(&topics);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 100);
        assert_eq!(batches[1].len(), 100);
        assert_eq!(batches[2].len(), 50);
        assert!(batches
            .iter()
            .flatten()
            .all(|f| f.qos == QoS::AtMostOnce));
    }
}
