//! Per-connection duplex pumps.
//!
//! The write pump forwards every newly published snapshot to the client; the
//! read pump decodes inbound commands and dispatches them. Both run as their
//! own task and the first one to finish tears the other down.

use crate::control::Dispatcher;
use crate::metrics::Metrics;
use crate::sampler::SnapshotFeed;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum PumpError {
    #[error("websocket read failed: {0}")]
    Read(#[source] BoxError),
    #[error("websocket write failed: {0}")]
    Write(#[source] BoxError),
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("pump task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub async fn serve_socket(
    socket: WebSocket,
    peer: SocketAddr,
    feed: SnapshotFeed,
    dispatcher: Dispatcher,
    metrics: Arc<Metrics>,
) {
    metrics.stream_connected();
    info!(peer = %peer, "stream client connected");

    let (sink, stream) = socket.split();
    match supervise(write_pump(sink, feed), read_pump(stream, dispatcher)).await {
        Ok(()) => info!(peer = %peer, "stream client disconnected"),
        Err(err) => warn!(peer = %peer, error = %err, "stream connection closed"),
    }

    metrics.stream_disconnected();
}

/// Runs both pumps and returns as soon as either finishes, aborting the
/// other so no task outlives the connection.
pub(crate) async fn supervise<W, R>(write: W, read: R) -> Result<(), PumpError>
where
    W: Future<Output = Result<(), PumpError>> + Send + 'static,
    R: Future<Output = Result<(), PumpError>> + Send + 'static,
{
    let mut write_task = tokio::spawn(write);
    let mut read_task = tokio::spawn(read);

    let finished = tokio::select! {
        res = &mut write_task => res,
        res = &mut read_task => res,
    };
    write_task.abort();
    read_task.abort();

    finished?
}

/// Writes the latest snapshot on connect and then each new one as the
/// sampler publishes it. Ends cleanly when the sampler goes away.
pub(crate) async fn write_pump<S>(mut sink: S, mut feed: SnapshotFeed) -> Result<(), PumpError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    loop {
        let latest = feed.borrow_and_update().clone();
        if let Some(snapshot) = latest {
            let payload = serde_json::to_string(&*snapshot)?;
            sink.send(Message::Text(payload))
                .await
                .map_err(|err| PumpError::Write(Box::new(err)))?;
        }
        if feed.changed().await.is_err() {
            debug!("snapshot feed closed, write pump exiting");
            return Ok(());
        }
    }
}

/// Consumes inbound messages until the client closes the connection or the
/// read fails. Each command is dispatched before the next one is read.
pub(crate) async fn read_pump<St, E>(mut stream: St, dispatcher: Dispatcher) -> Result<(), PumpError>
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    while let Some(message) = stream.next().await {
        match message.map_err(|err| PumpError::Read(Box::new(err)))? {
            Message::Text(text) => dispatcher.handle(text.as_bytes()).await,
            Message::Binary(bytes) => dispatcher.handle(&bytes).await,
            Message::Close(_) => return Ok(()),
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    Ok(())
}
