use anyhow::Context;
use serialport::SerialPort;
use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Non-blocking view of a byte stream: ask how much is waiting, then take it
pub trait ByteSource: Send {
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Reads what is currently buffered by the driver without waiting for more
    fn read_available(&mut self) -> io::Result<Vec<u8>>;
}

/// The EMU-2 USB serial port
pub struct SerialByteSource {
    port: Box<dyn SerialPort>,
}

impl SerialByteSource {
    pub fn open(path: &Path, baud_rate: u32) -> anyhow::Result<Self> {
        let name = path.to_string_lossy();
        info!("Opening serial port {} at {} baud", name, baud_rate);
        let port = serialport::new(name.as_ref(), baud_rate)
            .timeout(Duration::from_secs(1))
            .open()
            .with_context(|| format!("Failed to open serial port {name}"))?;
        Ok(Self { port })
    }
}

impl ByteSource for SerialByteSource {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read_available(&mut self) -> io::Result<Vec<u8>> {
        let available = self.bytes_available()?;
        let mut buffer = vec![0u8; available];
        let read = self.port.read(&mut buffer)?;
        buffer.truncate(read);
        Ok(buffer)
    }
}
