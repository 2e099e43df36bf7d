//! Rainforest EMU-2 to MQTT bridge library
//!
//! The EMU-2 streams XML messages over its USB serial port. This library puts
//! the messages back together from arbitrary serial reads, decodes them into
//! readings and publishes them to MQTT, along with Home Assistant discovery
//! documents for the power and energy sensors.

pub mod bridge;
pub mod config;
pub mod device_state;
pub mod fragment_assembler;
pub mod fragment_decoder;
pub mod home_assistant;
pub mod message_tag;
pub mod mqtt_transport;
pub mod publisher;
pub mod serial_source;

// Re-export commonly used types for easier access
pub use bridge::Bridge;
pub use config::{Args, BridgeConfig};
pub use fragment_assembler::FragmentAssembler;
pub use fragment_decoder::{decode, Reading};
pub use mqtt_transport::{BrokerEvent, MqttTransport, Qos, RumqttTransport};
pub use publisher::Publisher;
pub use serial_source::{ByteSource, SerialByteSource};
