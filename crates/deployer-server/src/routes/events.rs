use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;

use crate::state::AppState;

/// GET /api/events — SSE stream emitting an `action` event per history record.
///
/// Lagging subscribers silently skip the records they missed.
pub async fn sse_events(State(app): State<AppState>) -> impl axum::response::IntoResponse {
    let rx = app.controller.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| {
        let record = msg.ok()?;
        Event::default()
            .event("action")
            .json_data(&record)
            .ok()
            .map(Ok::<Event, Infallible>)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
