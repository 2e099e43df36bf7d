use crate::fragment_assembler::FragmentAssembler;
use crate::fragment_decoder::decode;
use crate::mqtt_transport::{BrokerEvent, MqttTransport};
use crate::publisher::Publisher;
use crate::serial_source::ByteSource;
use std::io;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause while a message or opening tag is incomplete
pub const PARTIAL_DATA_DELAY: Duration = Duration::from_millis(50);
/// Pause when the serial port had nothing to read
pub const IDLE_DELAY: Duration = Duration::from_millis(250);

const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Serial to MQTT worker. Everything runs on the caller's task: reading the
/// port, assembling and decoding messages, publishing and reacting to broker
/// events, so the device state is never shared.
pub struct Bridge<S: ByteSource, T: MqttTransport> {
    source: S,
    assembler: FragmentAssembler,
    publisher: Publisher<T>,
    broker_events: Receiver<BrokerEvent>,
}

impl<S: ByteSource, T: MqttTransport> Bridge<S, T> {
    pub fn new(source: S, publisher: Publisher<T>, broker_events: Receiver<BrokerEvent>) -> Self {
        Self {
            source,
            assembler: FragmentAssembler::new(),
            publisher,
            broker_events,
        }
    }

    pub fn publisher(&self) -> &Publisher<T> {
        &self.publisher
    }

    /// Polls the device until `cancel` fires.
    ///
    /// Bad data never stops the loop. It only gives up when reading the port
    /// keeps failing, which usually means the device was unplugged.
    pub async fn run(&mut self, cancel: &CancellationToken) -> anyhow::Result<()> {
        info!("emu2 bridge running");
        let mut consecutive_errors = 0u32;

        while !cancel.is_cancelled() {
            // A step may be stuck on a publish, cancellation must not wait for it
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.step() => polled,
            };

            let delay = match polled {
                Ok(delay) => {
                    consecutive_errors = 0;
                    delay
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(
                        "Serial read error ({}/{}): {}",
                        consecutive_errors, MAX_CONSECUTIVE_ERRORS, e
                    );
                    if !self.assembler.buffered().is_empty() {
                        debug!("Dropping partial data: {}", self.assembler.buffered());
                    }
                    // Bytes may have been lost, a held message cannot be trusted
                    self.assembler.reset();
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        error!("Too many consecutive serial read errors, stopping");
                        return Err(e.into());
                    }
                    Some(IDLE_DELAY)
                }
            };

            if let Some(delay) = delay {
                if !self.wait(delay, cancel).await {
                    break;
                }
            }
        }

        info!("emu2 bridge stopped");
        Ok(())
    }

    /// Best-effort offline status, then MQTT disconnect
    pub async fn shutdown(mut self, grace: Duration) {
        info!("Shutting down, allowing {:?} for the last messages", grace);
        self.publisher.shutdown(grace).await;
    }

    /// Reads and handles whatever the device has sent.
    /// Returns how long to pause before polling again, if at all.
    pub async fn poll_once(&mut self) -> io::Result<Option<Duration>> {
        if self.source.bytes_available()? == 0 {
            return Ok(Some(IDLE_DELAY));
        }
        let chunk = self.source.read_available()?;

        let assembled = match self.assembler.feed(&chunk) {
            Ok(assembled) => assembled,
            Err(e) => {
                warn!("Failed to decode {} bytes of serial data: {}", chunk.len(), e);
                return Ok(None);
            }
        };

        let partial_tag = assembled.has_partial_tag();
        for fragment in assembled {
            self.process_fragment(&fragment).await;
        }

        if partial_tag || self.assembler.is_mid_fragment() {
            Ok(Some(PARTIAL_DATA_DELAY))
        } else {
            Ok(None)
        }
    }

    async fn step(&mut self) -> io::Result<Option<Duration>> {
        self.drain_broker_events().await;
        self.poll_once().await
    }

    async fn process_fragment(&mut self, fragment: &str) {
        debug!("Parsing: {}", fragment);
        match decode(fragment) {
            Ok(reading) => self.publisher.handle_reading(&reading).await,
            Err(e) => warn!("Failed to parse XML ({}): {}", e, fragment),
        }
    }

    async fn drain_broker_events(&mut self) {
        while let Ok(event) = self.broker_events.try_recv() {
            self.publisher.handle_broker_event(event).await;
        }
    }

    /// Sleeps for `delay` while still serving broker events.
    /// Returns false if cancelled.
    async fn wait(&mut self, delay: Duration, cancel: &CancellationToken) -> bool {
        let pause = sleep(delay);
        tokio::pin!(pause);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = &mut pause => return true,
                Some(event) = self.broker_events.recv() => {
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = self.publisher.handle_broker_event(event) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::home_assistant::{DEMAND_TOPIC, STATUS_TOPIC};
    use crate::mqtt_transport::Qos;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    const DEMAND: &str = "<InstantaneousDemand>\r\n  <DeviceMacId>0xd8d5b9000000abcd</DeviceMacId>\r\n  <Demand>0x0001</Demand>\r\n  <Multiplier>0x00000001</Multiplier>\r\n  <Divisor>0x00000010</Divisor>\r\n  <DigitsRight>0x03</DigitsRight>\r\n</InstantaneousDemand>\r\n";

    #[derive(Default)]
    struct ChunkSource {
        chunks: VecDeque<io::Result<Vec<u8>>>,
    }

    impl ByteSource for ChunkSource {
        fn bytes_available(&mut self) -> io::Result<usize> {
            if matches!(self.chunks.front(), Some(Err(_))) {
                return Err(self.chunks.pop_front().unwrap().unwrap_err());
            }
            Ok(self
                .chunks
                .front()
                .map_or(0, |chunk| chunk.as_ref().map_or(0, Vec::len)))
        }

        fn read_available(&mut self) -> io::Result<Vec<u8>> {
            self.chunks.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingTransport {
        published: Arc<Mutex<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl MqttTransport for RecordingTransport {
        async fn publish(&self, topic: &str, payload: String, _qos: Qos) -> anyhow::Result<()> {
            self.published.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }

        async fn disconnect(&self, _grace: Duration) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn bridge(
        chunks: Vec<io::Result<Vec<u8>>>,
    ) -> (
        Bridge<ChunkSource, RecordingTransport>,
        RecordingTransport,
        mpsc::Sender<BrokerEvent>,
    ) {
        let transport = RecordingTransport::default();
        let (events_tx, events_rx) = mpsc::channel(4);
        let source = ChunkSource {
            chunks: chunks.into(),
        };
        let publisher = Publisher::new(transport.clone(), "homeassistant", Qos::AtMostOnce);
        (Bridge::new(source, publisher, events_rx), transport, events_tx)
    }

    #[tokio::test]
    async fn test_poll_once_delays() {
        let (head, tail) = DEMAND.split_at(40);
        let (mut bridge, transport, _events) = bridge(vec![
            Ok(b"<Inst".to_vec()),
            Ok(head["<Inst".len()..].as_bytes().to_vec()),
            Ok(tail.as_bytes().to_vec()),
            Ok(vec![0xff, 0xfe]),
        ]);

        assert_eq!(bridge.poll_once().await.unwrap(), Some(PARTIAL_DATA_DELAY));
        assert_eq!(bridge.poll_once().await.unwrap(), Some(PARTIAL_DATA_DELAY));
        assert_eq!(bridge.poll_once().await.unwrap(), None);
        // Undecodable chunk is dropped, polling continues right away
        assert_eq!(bridge.poll_once().await.unwrap(), None);
        assert_eq!(bridge.poll_once().await.unwrap(), Some(IDLE_DELAY));

        let published = transport.published.lock().unwrap().clone();
        assert!(published.contains(&(DEMAND_TOPIC.to_string(), "0.063".to_string())));
        assert!(published.contains(&(STATUS_TOPIC.to_string(), "online".to_string())));
    }

    #[tokio::test]
    async fn test_malformed_fragment_is_skipped() {
        let malformed = "<InstantaneousDemand>\r\n  <Demand>0x01</Dem\r\n</InstantaneousDemand>\r\n";
        let (mut bridge, transport, _events) = bridge(vec![Ok(malformed.as_bytes().to_vec())]);

        assert_eq!(bridge.poll_once().await.unwrap(), None);
        assert!(transport.published.lock().unwrap().is_empty());
        assert_eq!(bridge.publisher().state().device_id(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_after_repeated_errors() {
        let chunks = (0..MAX_CONSECUTIVE_ERRORS)
            .map(|_| Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone")))
            .collect();
        let (mut bridge, _transport, _events) = bridge(chunks);

        let err = bridge.run(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "device gone");
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_below_limit_are_tolerated() {
        let mut chunks: Vec<io::Result<Vec<u8>>> = (0..MAX_CONSECUTIVE_ERRORS - 1)
            .map(|_| Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone")))
            .collect();
        chunks.push(Ok(DEMAND.as_bytes().to_vec()));
        let (mut bridge, transport, _events) = bridge(chunks);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(10)).await;
            canceller.cancel();
        });

        bridge.run(&cancel).await.unwrap();
        assert!(transport
            .published
            .lock()
            .unwrap()
            .contains(&(DEMAND_TOPIC.to_string(), "0.063".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_error_drops_held_message() {
        let (head, tail) = DEMAND.split_at(60);
        let (mut bridge, transport, _events) = bridge(vec![
            Ok(head.as_bytes().to_vec()),
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone")),
            Ok(tail.as_bytes().to_vec()),
            Ok(DEMAND.as_bytes().to_vec()),
        ]);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(10)).await;
            canceller.cancel();
        });
        bridge.run(&cancel).await.unwrap();

        let demands: Vec<String> = transport
            .published
            .lock()
            .unwrap()
            .iter()
            .filter(|(topic, _)| topic == DEMAND_TOPIC)
            .map(|(_, payload)| payload.clone())
            .collect();
        assert_eq!(demands, ["0.063"]);
    }

    /// Transport whose broker never answers
    struct StalledTransport;

    #[async_trait]
    impl MqttTransport for StalledTransport {
        async fn publish(&self, _topic: &str, _payload: String, _qos: Qos) -> anyhow::Result<()> {
            std::future::pending().await
        }

        async fn disconnect(&self, _grace: Duration) -> anyhow::Result<()> {
            std::future::pending().await
        }
    }

    /// Sends the same message on every read
    struct RepeatingSource;

    impl ByteSource for RepeatingSource {
        fn bytes_available(&mut self) -> io::Result<usize> {
            Ok(DEMAND.len())
        }

        fn read_available(&mut self) -> io::Result<Vec<u8>> {
            Ok(DEMAND.as_bytes().to_vec())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_publish_is_stuck() {
        let (_events_tx, events_rx) = mpsc::channel(4);
        let publisher = Publisher::new(StalledTransport, "homeassistant", Qos::AtMostOnce);
        let mut bridge = Bridge::new(RepeatingSource, publisher, events_rx);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(2), bridge.run(&cancel))
            .await
            .expect("run did not return after cancel")
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        tokio::time::timeout(Duration::from_secs(5), bridge.shutdown(Duration::from_secs(4)))
            .await
            .expect("shutdown did not respect its grace period");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_broker_event_publish_is_stuck() {
        let (events_tx, events_rx) = mpsc::channel(4);
        let source = ChunkSource {
            chunks: vec![Ok(DEMAND.as_bytes().to_vec())].into(),
        };
        let publisher = Publisher::new(StalledTransport, "homeassistant", Qos::AtMostOnce);
        let mut bridge = Bridge::new(source, publisher, events_rx);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            // The first message gives up on its five publishes after 25s
            sleep(Duration::from_secs(30)).await;
            events_tx
                .send(BrokerEvent::StatusMessage("online".to_string()))
                .await
                .unwrap();
            sleep(Duration::from_secs(1)).await;
            canceller.cancel();
            // Keeps the channel open until the bridge is gone
            sleep(Duration::from_secs(3600)).await;
        });

        let started = tokio::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(40), bridge.run(&cancel))
            .await
            .expect("run did not return after cancel")
            .unwrap();
        assert!(bridge.publisher().state().discovery_sent());
        assert!(started.elapsed() < Duration::from_secs(32));
    }

    #[tokio::test]
    async fn test_run_returns_when_already_cancelled() {
        let (mut bridge, transport, _events) = bridge(vec![Ok(DEMAND.as_bytes().to_vec())]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        bridge.run(&cancel).await.unwrap();
        assert!(transport.published.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_events_served_while_idle() {
        let (mut bridge, transport, events) = bridge(vec![Ok(DEMAND.as_bytes().to_vec())]);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();

        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            events
                .send(BrokerEvent::StatusMessage("online".to_string()))
                .await
                .unwrap();
            sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        bridge.run(&cancel).await.unwrap();

        let configs = transport
            .published
            .lock()
            .unwrap()
            .iter()
            .filter(|(topic, _)| topic.ends_with("/config"))
            .count();
        assert_eq!(configs, 6);
    }
}
