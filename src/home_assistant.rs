use serde_derive::Serialize;

pub const DEMAND_TOPIC: &str = "rainforest/instantaneousdemand";
pub const SUMMATION_TOPIC: &str = "rainforest/summationdelivered";
pub const STATUS_TOPIC: &str = "rainforest/status";

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

/// Device block shared by every sensor config of the EMU-2
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HADevice {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub model_id: String,
    pub identifiers: Vec<String>,
}

impl HADevice {
    pub fn emu2(device_id: &str) -> Self {
        Self {
            name: "Rainforest EMU-2".to_string(),
            manufacturer: "Rainforest Automation".to_string(),
            model: "EMU-2".to_string(),
            model_id: "EMU-2".to_string(),
            identifiers: vec![device_id.to_string()],
        }
    }
}

/// MQTT discovery config of a single sensor entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HASensorConfig {
    pub device_class: String,
    pub device: HADevice,
    pub name: String,
    pub state_class: String,
    pub unit_of_measurement: String,
    pub unique_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
    pub state_topic: String,
    pub availability_topic: String,
}

/// Payload published on [`SUMMATION_TOPIC`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SummationPayload {
    pub delivered: f64,
    pub received: f64,
}

/// Builds the three sensor configs and the topics they are published on.
pub fn discovery_configs(discovery_prefix: &str, device_id: &str) -> Vec<(String, HASensorConfig)> {
    let device = HADevice::emu2(device_id);
    let sensor = |device_class: &str,
                  name: &str,
                  state_class: &str,
                  unit: &str,
                  id_suffix: &str,
                  value_template: Option<&str>,
                  state_topic: &str| HASensorConfig {
        device_class: device_class.to_string(),
        device: device.clone(),
        name: name.to_string(),
        state_class: state_class.to_string(),
        unit_of_measurement: unit.to_string(),
        unique_id: format!("{device_id}{id_suffix}"),
        value_template: value_template.map(str::to_string),
        state_topic: state_topic.to_string(),
        availability_topic: STATUS_TOPIC.to_string(),
    };

    vec![
        (
            format!("{discovery_prefix}/sensor/emu2_delivered/config"),
            sensor(
                "energy",
                "Cumulative Energy Delivered",
                "total",
                "kWh",
                "dlvr",
                Some("{{ value_json.delivered }}"),
                SUMMATION_TOPIC,
            ),
        ),
        (
            format!("{discovery_prefix}/sensor/emu2_received/config"),
            sensor(
                "energy",
                "Cumulative Energy Received",
                "total",
                "kWh",
                "rcvd",
                Some("{{ value_json.received }}"),
                SUMMATION_TOPIC,
            ),
        ),
        (
            format!("{discovery_prefix}/sensor/emu2_power/config"),
            sensor(
                "power",
                "Power",
                "measurement",
                "kW",
                "pwr",
                None,
                DEMAND_TOPIC,
            ),
        ),
    ]
}
