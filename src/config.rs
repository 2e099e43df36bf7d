use crate::mqtt_transport::Qos;
use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_BAUD_RATE: u32 = 115_200;
const KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Publishes Rainforest EMU-2 readings to MQTT with Home Assistant discovery
#[derive(Parser, Debug, Clone)]
#[command(name = "emu2_mqtt_bridge", version, about)]
pub struct Args {
    /// Rainforest EMU-2 serial port, e.g. 'ttyACM0' or '/dev/ttyACM0'
    #[arg(env = "EMU2_SERIAL_PORT")]
    pub serial_port: String,

    /// Serial baud rate
    #[arg(long, env = "EMU2_BAUD_RATE", default_value_t = DEFAULT_BAUD_RATE)]
    pub baud_rate: u32,

    /// Enable debug logging
    #[arg(long, env = "EMU2_DEBUG")]
    pub debug: bool,

    /// MQTT client name
    #[arg(long, env = "MQTT_CLIENT_NAME", default_value = "emu2mqtt")]
    pub mqtt_client_name: String,

    /// MQTT server
    #[arg(long, env = "MQTT_SERVER", default_value = "localhost")]
    pub mqtt_server: String,

    /// MQTT server port
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    /// MQTT username, no authentication when empty
    #[arg(long, env = "MQTT_USERNAME", default_value = "")]
    pub mqtt_username: String,

    /// File holding the MQTT password
    #[arg(long, env = "MQTT_PW_FILE")]
    pub mqtt_pw_file: Option<PathBuf>,

    /// MQTT discovery topic prefix
    #[arg(long, env = "MQTT_DISC_TOPIC", default_value = "homeassistant")]
    pub mqtt_disc_topic: String,

    /// Home Assistant status topic
    #[arg(long, env = "MQTT_STATUS_TOPIC", default_value = "homeassistant/status")]
    pub mqtt_status_topic: String,

    /// MQTT QoS
    #[arg(long, env = "MQTT_QOS", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
    pub mqtt_qos: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttSettings {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub status_topic: String,
    pub qos: Qos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub serial_port: PathBuf,
    pub baud_rate: u32,
    pub debug: bool,
    pub discovery_prefix: String,
    pub mqtt: MqttSettings,
}

impl Args {
    /// Resolves the arguments, reading the password file if one was given
    pub fn into_config(self) -> anyhow::Result<BridgeConfig> {
        let qos = Qos::try_from(self.mqtt_qos)?;
        let password = match &self.mqtt_pw_file {
            Some(path) => Some(read_password(path)?),
            None => None,
        };
        let username = Some(self.mqtt_username).filter(|name| !name.is_empty());

        Ok(BridgeConfig {
            serial_port: serial_port_path(&self.serial_port),
            baud_rate: self.baud_rate,
            debug: self.debug,
            discovery_prefix: self.mqtt_disc_topic,
            mqtt: MqttSettings {
                client_id: self.mqtt_client_name,
                host: self.mqtt_server,
                port: self.mqtt_port,
                username,
                password,
                keep_alive: KEEP_ALIVE,
                status_topic: self.mqtt_status_topic,
                qos,
            },
        })
    }
}

/// Bare device names live under /dev
fn serial_port_path(port: &str) -> PathBuf {
    let path = Path::new(port);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        Path::new("/dev").join(path)
    }
}

fn read_password(path: &Path) -> anyhow::Result<String> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read MQTT password file {}", path.display()))?;
    Ok(contents.trim_end_matches(['\r', '\n']).to_string())
}
