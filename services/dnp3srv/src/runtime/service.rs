//! Service lifecycle
//!
//! Wires the MQTT client, the outstation stack and the bridge together,
//! runs until the shutdown future resolves, then tears everything down in
//! order: session offline, DNP3 server stopped, queued publishes flushed,
//! availability set to offline, MQTT disconnected.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::bridge::{Bridge, BridgeEvent, LinkEvent};
use crate::core::config::BridgeConfig;
use crate::error::Result;
#[cfg(not(feature = "dnp3-tcp"))]
use crate::error::BridgeError;
use crate::protocols::mqtt::{run_event_loop, MqttClient, Publisher};
#[cfg(feature = "dnp3-tcp")]
use crate::protocols::outstation_tcp::TcpOutstation;
use crate::protocols::stack::{MemoryStack, OutstationStack};
use crate::runtime::publisher::run_publisher;

/// Outbound queue between the bridge and the publisher task
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Upper bound on each shutdown step that waits on the network
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackMode {
    /// In-memory outstation; the session is brought online immediately
    Simulated,
    /// DNP3 TCP server
    Tcp,
}

enum StackHandle {
    Memory(Arc<MemoryStack>),
    #[cfg(feature = "dnp3-tcp")]
    Tcp(Arc<TcpOutstation>),
}

impl StackHandle {
    fn new(mode: StackMode, decode_debug: bool) -> Result<Self> {
        match mode {
            StackMode::Simulated => Ok(Self::Memory(Arc::new(MemoryStack::new()))),
            #[cfg(feature = "dnp3-tcp")]
            StackMode::Tcp => Ok(Self::Tcp(Arc::new(TcpOutstation::new(decode_debug)))),
            #[cfg(not(feature = "dnp3-tcp"))]
            StackMode::Tcp => {
                let _ = decode_debug;
                Err(BridgeError::config(
                    "built without the dnp3-tcp feature, only --simulate is available",
                ))
            },
        }
    }

    fn as_stack(&self) -> Arc<dyn OutstationStack> {
        match self {
            Self::Memory(stack) => stack.clone() as Arc<dyn OutstationStack>,
            #[cfg(feature = "dnp3-tcp")]
            Self::Tcp(stack) => stack.clone() as Arc<dyn OutstationStack>,
        }
    }

    async fn start(&self, bridge: &Arc<Bridge>, address: u16) -> Result<()> {
        match self {
            Self::Memory(_) => {
                info!("Simulated outstation, no DNP3 server started");
                bridge.dispatch(BridgeEvent::Link(LinkEvent::Connected {
                    destination: address,
                }));
                Ok(())
            },
            #[cfg(feature = "dnp3-tcp")]
            Self::Tcp(stack) => stack.start(bridge.clone()).await,
        }
    }

    fn stop(&self) {
        match self {
            Self::Memory(_) => {},
            #[cfg(feature = "dnp3-tcp")]
            Self::Tcp(stack) => stack.stop(),
        }
    }
}

/// Run the bridge until `shutdown` resolves
pub async fn start_bridge_service(
    config: BridgeConfig,
    mode: StackMode,
    decode_debug: bool,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let (client, eventloop) = MqttClient::new(&config.mqtt);
    let client = Arc::new(client);

    let stack = StackHandle::new(mode, decode_debug)?;
    let bridge = Arc::new(Bridge::new(&config, stack.as_stack(), outbound_tx)?);

    let publisher_token = CancellationToken::new();
    let mqtt_token = CancellationToken::new();

    let publisher = tokio::spawn(run_publisher(
        outbound_rx,
        client.clone() as Arc<dyn Publisher>,
        publisher_token.clone(),
    ));
    let mut mqtt_loop = tokio::spawn(run_event_loop(
        eventloop,
        client.clone(),
        bridge.clone(),
        config.mqtt.reconnect_delay(),
        mqtt_token.clone(),
    ));

    bridge.dispatch(BridgeEvent::Link(LinkEvent::Listening));
    if let Err(e) = stack.start(&bridge, config.outstation.address).await {
        publisher_token.cancel();
        mqtt_token.cancel();
        return Err(e);
    }
    info!(
        "dnp3srv running: {} telemetry topics, {} controls",
        bridge.subscriptions().len(),
        config.controls.len()
    );

    shutdown.await;
    info!("Starting graceful shutdown...");

    bridge.dispatch(BridgeEvent::Link(LinkEvent::Closed));
    stack.stop();

    publisher_token.cancel();
    match publisher.await {
        Ok(published) => info!("Publisher finished after {} messages", published),
        Err(e) => warn!("Publisher task failed: {}", e),
    }

    let offline = bridge.availability(false);
    match tokio::time::timeout(SHUTDOWN_GRACE, client.publish(&offline)).await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => warn!("{}", e),
        Err(_) => warn!("Timed out publishing offline availability"),
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, client.disconnect()).await.is_err() {
        warn!("Timed out requesting MQTT disconnect");
    }

    if tokio::time::timeout(SHUTDOWN_GRACE, &mut mqtt_loop).await.is_err() {
        warn!("MQTT event loop did not stop in {:?}, cancelling", SHUTDOWN_GRACE);
        mqtt_token.cancel();
        if let Err(e) = mqtt_loop.await {
            warn!("MQTT task failed: {}", e);
        }
    }

    info!("dnp3srv stopped");
    Ok(())
}
