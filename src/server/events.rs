//! SSE (Server-Sent Events) stream of topology events.
//!
//! Each subscriber gets its own broadcast receiver, forwarded into a
//! bounded channel so a slow client only ever lags itself.

use std::convert::Infallible;

use axum::response::sse::Event;
use futures::stream::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::control::PartitionEvent;

const FORWARD_CAPACITY: usize = 64;

/// Convert a topology event receiver into an SSE stream. The event name is
/// the event kind; the data is the event as JSON.
pub fn partition_events_to_sse_stream(
    mut rx: broadcast::Receiver<PartitionEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let (tx, out) = mpsc::channel(FORWARD_CAPACITY);

    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        debug!("Event client disconnected");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event client lagged, events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    ReceiverStream::new(out).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().event(event.name()).data(data))
    })
}
