/// Runtime view of the EMU-2 as seen from the serial stream.
/// Lives for the process only, nothing here is persisted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeviceState {
    device_id: Option<String>,
    online: bool,
    discovery_sent: bool,
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn discovery_sent(&self) -> bool {
        self.discovery_sent
    }

    pub fn observe_device(&mut self, device_id: &str) {
        if self.device_id.as_deref() != Some(device_id) {
            self.device_id = Some(device_id.to_string());
        }
    }

    /// Updates the online flag, returning true only when it actually changed
    pub fn set_online(&mut self, online: bool) -> bool {
        let changed = self.online != online;
        self.online = online;
        changed
    }

    /// Returns the device id when the one-time discovery is due, and latches it.
    pub fn take_initial_discovery(&mut self) -> Option<String> {
        if self.discovery_sent {
            return None;
        }
        let device_id = self.device_id.clone()?;
        self.discovery_sent = true;
        Some(device_id)
    }
}
