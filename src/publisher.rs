use crate::device_state::DeviceState;
use crate::fragment_decoder::Reading;
use crate::home_assistant::{
    discovery_configs, SummationPayload, DEMAND_TOPIC, OFFLINE, ONLINE, STATUS_TOPIC,
    SUMMATION_TOPIC,
};
use crate::mqtt_transport::{BrokerEvent, MqttTransport, Qos};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// EMU-2 connection status announcing the meter link dropped
const REJOINING: &str = "Rejoining";

/// Longest a single publish may take before the message is given up on
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Turns readings into MQTT messages and keeps track of whether the device
/// is online and whether Home Assistant has been told about it.
pub struct Publisher<T: MqttTransport> {
    transport: T,
    state: DeviceState,
    discovery_prefix: String,
    qos: Qos,
}

impl<T: MqttTransport> Publisher<T> {
    pub fn new(transport: T, discovery_prefix: impl Into<String>, qos: Qos) -> Self {
        Self {
            transport,
            state: DeviceState::new(),
            discovery_prefix: discovery_prefix.into(),
            qos,
        }
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn handle_reading(&mut self, reading: &Reading) {
        self.state.observe_device(reading.device_id());

        match reading {
            Reading::InstantaneousDemand { demand_kw, .. } => {
                self.set_online(true).await;
                if let Some(demand_kw) = demand_kw {
                    self.publish(DEMAND_TOPIC, format_demand(*demand_kw)).await;
                }
            }
            Reading::Summation {
                delivered_kwh,
                received_kwh,
                ..
            } => {
                self.set_online(true).await;
                let payload = SummationPayload {
                    delivered: *delivered_kwh,
                    received: *received_kwh,
                };
                match serde_json::to_string(&payload) {
                    Ok(json) => self.publish(SUMMATION_TOPIC, json).await,
                    Err(e) => warn!("Failed to serialize summation {:?}: {}", payload, e),
                }
            }
            Reading::ConnectionStatus { status, .. } => {
                debug!("Connection status: {}", status);
                if status == REJOINING {
                    self.set_online(false).await;
                }
            }
        }

        if let Some(device_id) = self.state.take_initial_discovery() {
            self.send_discovery(&device_id).await;
        }
    }

    pub async fn handle_broker_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => {
                // The broker may have published our will while we were away
                if self.state.is_online() {
                    info!("Reconnected while online, republishing status");
                    self.publish(STATUS_TOPIC, ONLINE.to_string()).await;
                }
            }
            BrokerEvent::StatusMessage(payload) if payload == ONLINE => {
                match self.state.device_id().map(str::to_owned) {
                    Some(device_id) => {
                        info!("Home Assistant came online, resending discovery");
                        self.send_discovery(&device_id).await;
                    }
                    None => debug!("Home Assistant came online before the device was seen"),
                }
            }
            BrokerEvent::StatusMessage(payload) => {
                debug!("Ignoring Home Assistant status {}", payload);
            }
        }
    }

    /// Publishes "offline" if needed and disconnects, waiting at most `grace`
    pub async fn shutdown(&mut self, grace: Duration) {
        let shutdown = async {
            self.set_online(false).await;
            if let Err(e) = self.transport.disconnect(grace).await {
                warn!("MQTT disconnect failed: {:#}", e);
            }
        };
        if timeout(grace, shutdown).await.is_err() {
            warn!("MQTT shutdown did not finish within {:?}", grace);
        }
    }

    async fn send_discovery(&self, device_id: &str) {
        for (topic, config) in discovery_configs(&self.discovery_prefix, device_id) {
            match serde_json::to_string(&config) {
                Ok(json) => self.publish(&topic, json).await,
                Err(e) => warn!("Failed to serialize discovery config for {}: {}", topic, e),
            }
        }
    }

    async fn set_online(&mut self, online: bool) {
        if self.state.set_online(online) {
            let status = if online { ONLINE } else { OFFLINE };
            info!("State switching to {}", status);
            self.publish(STATUS_TOPIC, status.to_string()).await;
        }
    }

    async fn publish(&self, topic: &str, payload: String) {
        match timeout(PUBLISH_TIMEOUT, self.transport.publish(topic, payload, self.qos)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{:#}", e),
            Err(_) => warn!("Publish to {} timed out after {:?}", topic, PUBLISH_TIMEOUT),
        }
    }
}

/// Shortest decimal form that reads back as the same value, e.g. `0.063` or
/// `2.0`. Exponents are signed and at least two digits wide (`1e-05`, `1e+16`).
fn format_demand(demand_kw: f64) -> String {
    let repr = format!("{demand_kw:?}");
    match repr.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => repr,
    }
}
