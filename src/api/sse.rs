// =============================================================================
// Live event stream — GET /live (server-sent events)
// =============================================================================
//
// Bridges one event-bus subscription into an SSE response. The client sees
// the synthetic `connected` event immediately and a heartbeat marker every
// 30 seconds; slow clients lose oldest events rather than stalling
// publishers.
// =============================================================================

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures_util::Stream;
use tracing::info;

use crate::app_state::AppState;
use crate::events::Subscription;

pub async fn live_stream(State(state): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let sub = state.bus.subscribe(None);
    info!(subscription = sub.id(), "live stream attached");

    (headers, Sse::new(subscription_stream(sub)).keep_alive(KeepAlive::new())).into_response()
}

fn subscription_stream(
    sub: Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> {
    futures_util::stream::unfold(sub, |mut sub| async move {
        let bus_event = sub.recv().await?;
        let data = serde_json::to_string(&bus_event.data).unwrap_or_else(|_| "null".to_string());
        let event = Event::default().event(bus_event.topic).data(data);
        Some((Ok(event), sub))
    })
}
