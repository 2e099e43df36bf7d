use crate::config::MqttSettings;
use crate::home_assistant::{OFFLINE, STATUS_TOPIC};
use anyhow::Context;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const SUBSCRIBE_RETRY: Duration = Duration::from_millis(500);

/// MQTT QoS level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Qos {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for Qos {
    type Error = anyhow::Error;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => anyhow::bail!("Invalid MQTT QoS level {other}, expected 0, 1 or 2"),
        }
    }
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// Things the broker tells the bridge about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Connection (re)established
    Connected,
    /// Message received on the Home Assistant status topic
    StatusMessage(String),
}

/// The part of an MQTT client the publisher needs
#[async_trait]
pub trait MqttTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: String, qos: Qos) -> anyhow::Result<()>;

    /// Disconnects and waits up to `grace` for queued messages to go out
    async fn disconnect(&self, grace: Duration) -> anyhow::Result<()>;
}

/// [`MqttTransport`] backed by rumqttc. The network event loop runs in its
/// own task and reports back through a [`BrokerEvent`] channel.
pub struct RumqttTransport {
    client: AsyncClient,
    stopping: Arc<AtomicBool>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttTransport {
    /// Starts connecting to the broker. The offline will is registered on
    /// [`STATUS_TOPIC`] and the Home Assistant status topic is subscribed on
    /// every connection.
    pub fn connect(settings: &MqttSettings) -> (Self, mpsc::Receiver<BrokerEvent>) {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(settings.keep_alive);
        if let Some(username) = &settings.username {
            options.set_credentials(username, settings.password.clone().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            STATUS_TOPIC,
            OFFLINE,
            settings.qos.into(),
            false,
        ));

        info!(
            "MQTT connecting to {}:{} as {}",
            settings.host, settings.port, settings.client_id
        );
        let (client, event_loop) = AsyncClient::new(options, 10);
        let (event_tx, event_rx) = mpsc::channel(16);
        let stopping = Arc::new(AtomicBool::new(false));

        let event_task = tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            settings.status_topic.clone(),
            settings.qos,
            event_tx,
            stopping.clone(),
        ));

        let transport = Self {
            client,
            stopping,
            event_task: Mutex::new(Some(event_task)),
        };
        (transport, event_rx)
    }
}

#[async_trait]
impl MqttTransport for RumqttTransport {
    /// Queues the message without waiting. While the broker is unreachable
    /// the request queue fills up and further messages are dropped.
    async fn publish(&self, topic: &str, payload: String, qos: Qos) -> anyhow::Result<()> {
        self.client
            .try_publish(topic, qos.into(), false, payload)
            .with_context(|| format!("Failed to publish to {topic}"))
    }

    async fn disconnect(&self, grace: Duration) -> anyhow::Result<()> {
        self.stopping.store(true, Ordering::Relaxed);
        let requested = self
            .client
            .try_disconnect()
            .context("Failed to request MQTT disconnect");

        if let Some(task) = self.event_task.lock().await.take() {
            if timeout(grace, task).await.is_err() {
                warn!("MQTT event loop still running after {:?}", grace);
            }
        }
        requested
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    status_topic: String,
    qos: Qos,
    events: mpsc::Sender<BrokerEvent>,
    stopping: Arc<AtomicBool>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT connected!");
                // The request queue may still be full of messages from the
                // outage, it only drains once this poll returns
                let client = client.clone();
                let topic = status_topic.clone();
                let stopping = stopping.clone();
                tokio::spawn(async move {
                    let attempt = || client.try_subscribe(topic.as_str(), qos.into());
                    if retry_until_accepted(attempt, SUBSCRIBE_RETRY, &stopping).await {
                        debug!("Subscribed to {}", topic);
                    }
                });
                forward(&events, BrokerEvent::Connected);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == status_topic => {
                let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                debug!("Status topic {} reports {}", status_topic, payload);
                forward(&events, BrokerEvent::StatusMessage(payload));
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("MQTT disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if stopping.load(Ordering::Relaxed) {
                    break;
                }
                warn!("MQTT connection error: {}. Reconnecting in 1s", e);
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
    debug!("MQTT event loop exiting");
}

/// Calls `attempt` every `interval` until it succeeds. Gives up and returns
/// false once `stopping` is set.
async fn retry_until_accepted<E: std::fmt::Display>(
    mut attempt: impl FnMut() -> Result<(), E>,
    interval: Duration,
    stopping: &AtomicBool,
) -> bool {
    let mut failures = 0u32;
    loop {
        if stopping.load(Ordering::Relaxed) {
            return false;
        }
        match attempt() {
            Ok(()) => return true,
            Err(e) => {
                failures += 1;
                if failures == 1 {
                    warn!("MQTT request not accepted, retrying: {}", e);
                }
            }
        }
        sleep(interval).await;
    }
}

fn forward(events: &mpsc::Sender<BrokerEvent>, event: BrokerEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = events.try_send(event) {
        warn!("Dropping broker event {:?}, bridge is not keeping up", event);
    }
}
