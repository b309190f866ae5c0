//! Streams a session subscription or the notification feed to one client.
//!
//! A pump owns its [`Subscription`]; when the pump ends, for any reason, the
//! subscription is dropped and the viewer is detached. Write failures end
//! only that pump.

use futures::{Sink, SinkExt};
use log::{debug, warn};
use tether_notify::Notification;
use tether_pty::{Subscription, SubscriptionMessage, SubscriptionMode};
use tokio::io::AsyncWrite;
use tokio::sync::broadcast;
use tokio_util::codec::{FramedWrite, LinesCodec, LinesCodecError};

use crate::ipc::{BinaryEvent, BinaryEventCodec, CodecError, TextEvent};

#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    #[error("write failed: {0}")]
    Lines(#[from] LinesCodecError),
    #[error("write failed: {0}")]
    Codec(#[from] CodecError),
    #[error("encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Forward `subscription` to `writer` in the subscription's mode until the
/// session exits, the client goes away, or `shutdown` fires. Returns the
/// number of messages written.
pub async fn pump_subscription<W>(
    subscription: Subscription,
    writer: W,
    shutdown: broadcast::Receiver<()>,
) -> Result<usize, PumpError>
where
    W: AsyncWrite + Unpin,
{
    match subscription.mode() {
        SubscriptionMode::Text => {
            let sink = FramedWrite::new(writer, LinesCodec::new());
            pump(subscription, sink, shutdown, |message| {
                TextEvent::from_message(message)
                    .map(|event| serde_json::to_string(&event))
                    .transpose()
                    .map_err(PumpError::from)
            })
            .await
        }
        SubscriptionMode::Binary => {
            let sink = FramedWrite::new(writer, BinaryEventCodec);
            pump(subscription, sink, shutdown, |message| {
                Ok(Some(BinaryEvent::from(message)))
            })
            .await
        }
    }
}

async fn pump<S, T, F>(
    mut subscription: Subscription,
    mut sink: S,
    mut shutdown: broadcast::Receiver<()>,
    mut render: F,
) -> Result<usize, PumpError>
where
    S: Sink<T> + Unpin,
    PumpError: From<S::Error>,
    F: FnMut(SubscriptionMessage) -> Result<Option<T>, PumpError>,
{
    let mut sent = 0;
    loop {
        let message = tokio::select! {
            message = subscription.next() => message,
            _ = shutdown.recv() => {
                debug!("subscription pump stopping for shutdown");
                break;
            }
        };
        let Some(message) = message else {
            break;
        };
        if let Some(item) = render(message)? {
            sink.send(item).await?;
            sent += 1;
        }
    }
    subscription.detach();
    Ok(sent)
}

/// Forward gated notifications as JSON lines until shutdown or write failure.
pub async fn pump_notifications<W>(
    mut notifications: broadcast::Receiver<Notification>,
    writer: W,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<usize, PumpError>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, LinesCodec::new());
    let mut sent = 0;
    loop {
        let received = tokio::select! {
            received = notifications.recv() => received,
            _ = shutdown.recv() => break,
        };
        match received {
            Ok(notification) => {
                sink.send(serde_json::to_string(&notification)?).await?;
                sent += 1;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("notification listener lagged, {skipped} notifications dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(sent)
}
