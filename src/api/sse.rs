//! SSE adapter over the event broadcaster.
//!
//! Clients subscribe with an optional `types` filter and may present a
//! Last-Event-ID on reconnect; the stream resumes from live events (no
//! backfill) and never reorders, since sequences are stamped centrally.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use serde::Deserialize;
use std::collections::HashSet;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::auth::is_authorized;
use super::state::AppState;
use crate::domain::{EventKind, PlatformEvent};
use crate::events::EventBroadcaster;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Comma-separated event kinds; absent means all
    types: Option<String>,
    token: Option<String>,
}

/// Observer stream that unsubscribes itself when the client goes away.
struct ObserverStream {
    observer_id: u64,
    rx: mpsc::Receiver<PlatformEvent>,
    broadcaster: Arc<EventBroadcaster>,
}

impl Stream for ObserverStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                let sse = Event::default()
                    .id(event.sequence.to_string())
                    .event(event.kind.as_str())
                    .data(serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string()));
                Poll::Ready(Some(Ok(sse)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ObserverStream {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.observer_id);
    }
}

pub async fn event_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    if !is_authorized(&headers, query.token.as_deref(), &state.auth_token) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let filter = query.types.as_deref().map(parse_filter).transpose()?;

    if let Some(last_id) = headers.get("last-event-id").and_then(|v| v.to_str().ok()) {
        // No backfill: the client resumes from live events only.
        debug!(last_id, "observer reconnected");
    }

    let observer = state.broadcaster.subscribe(filter);
    info!(observer = observer.id, "SSE observer connected");

    let stream = ObserverStream {
        observer_id: observer.id,
        rx: observer.rx,
        broadcaster: state.broadcaster.clone(),
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn parse_filter(raw: &str) -> Result<HashSet<EventKind>, StatusCode> {
    let mut kinds = HashSet::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let kind = EventKind::parse(part).ok_or(StatusCode::BAD_REQUEST)?;
        kinds.insert(kind);
    }
    if kinds.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(kinds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_kinds() {
        let filter = parse_filter("trade, settlement").unwrap();
        assert!(filter.contains(&EventKind::Trade));
        assert!(filter.contains(&EventKind::Settlement));
        assert_eq!(filter.len(), 2);
    }

    #[test]
    fn rejects_unknown_kind() {
        assert_eq!(parse_filter("trade,bogus"), Err(StatusCode::BAD_REQUEST));
        assert_eq!(parse_filter(" ,"), Err(StatusCode::BAD_REQUEST));
    }
}
