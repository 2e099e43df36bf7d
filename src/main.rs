use clap::Parser;
use emu2_mqtt_bridge::{Args, Bridge, Publisher, RumqttTransport, SerialByteSource};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

/// Time given to the final offline status to reach the broker
const SHUTDOWN_GRACE: Duration = Duration::from_secs(4);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;
    tracing_subscriber::fmt()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .init();

    info!("emu2mqtt loading...");

    let source = SerialByteSource::open(&config.serial_port, config.baud_rate)?;
    let (transport, broker_events) = RumqttTransport::connect(&config.mqtt);
    let publisher = Publisher::new(transport, config.discovery_prefix.clone(), config.mqtt.qos);
    let mut bridge = Bridge::new(source, publisher, broker_events);

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let result = bridge.run(&cancel).await;
    bridge.shutdown(SHUTDOWN_GRACE).await;
    result
}

/// Cancels the bridge on Ctrl+C or SIGTERM
async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Caught a SIGINT, cleaning up and exiting"),
        _ = terminate => info!("Caught a SIGTERM, cleaning up and exiting"),
    }
    cancel.cancel();
}
