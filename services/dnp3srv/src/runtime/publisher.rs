//! Outbound publisher task
//!
//! Consumes the bridge's outbound queue and hands each message to the MQTT
//! client. A failed publish is logged for its topic and does not stop the
//! loop. On cancellation whatever is already queued still goes out.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::core::control::OutboundPublish;
use crate::protocols::mqtt::Publisher;

/// Returns the number of messages published successfully
pub async fn run_publisher(
    mut rx: mpsc::Receiver<OutboundPublish>,
    publisher: Arc<dyn Publisher>,
    token: CancellationToken,
) -> usize {
    let mut published = 0;

    loop {
        let message = tokio::select! {
            () = token.cancelled() => break,
            message = rx.recv() => message,
        };
        let Some(message) = message else {
            debug!("Outbound queue closed");
            return published;
        };
        published += usize::from(send(publisher.as_ref(), &message).await);
    }

    rx.close();
    let mut drained = 0;
    while let Ok(message) = rx.try_recv() {
        published += usize::from(send(publisher.as_ref(), &message).await);
        drained += 1;
    }
    info!("Publisher stopped, {} queued messages flushed", drained);
    published
}

async fn send(publisher: &dyn Publisher, message: &OutboundPublish) -> bool {
    match publisher.publish(message).await {
        Ok(()) => {
            debug!("Published {} = {}", message.topic, message.payload);
            true
        },
        Err(e) => {
            error!("{}", e);
            false
        },
    }
}
