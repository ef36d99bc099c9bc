//! Full-duplex event channels: one global stream for project lifecycle,
//! one stream per project.
//!
//! Clients receive the bus's JSON events in publication order within a
//! project. A `since` query parameter replays the retained ring from that
//! global sequence number before live delivery begins. Ping/pong keepalive
//! drops dead connections.

use std::time::Duration;

use axum::{
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::Instant;

use super::api::SharedState;
use crate::events::{Event, EventFilter, Subscription};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong before the connection is considered dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Deserialize, Default)]
pub struct WsQuery {
    /// Replay retained events with a global sequence greater than this.
    pub since: Option<u64>,
}

pub async fn ws_global(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let bus = state.bus().clone();
    ws.on_upgrade(move |socket| {
        let filter = EventFilter::all();
        let replay = query.since.map(|since| bus.replay(since, &filter));
        let subscription = bus.subscribe(filter);
        run_socket_loop(socket, subscription, replay)
    })
}

pub async fn ws_project(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let bus = state.bus().clone();
    ws.on_upgrade(move |socket| {
        let filter = EventFilter::for_project(project_id);
        let replay = query.since.map(|since| bus.replay(since, &filter));
        let subscription = bus.subscribe(filter);
        run_socket_loop(socket, subscription, replay)
    })
}

fn encode(event: &Event) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(err) => {
            tracing::warn!("failed to serialize event for websocket: {err}");
            None
        }
    }
}

/// Forward bus events to the socket, answer pings, and cut dead peers.
async fn run_socket_loop(
    socket: WebSocket,
    mut subscription: Subscription,
    replay: Option<Vec<Event>>,
) {
    let (mut sender, mut receiver) = socket.split();

    if let Some(events) = replay {
        for event in &events {
            if let Some(json) = encode(event)
                && sender.send(Message::Text(json)).await.is_err()
            {
                return;
            }
        }
    }

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            event = subscription.recv() => {
                match event {
                    Some(event) => {
                        let Some(json) = encode(&event) else { continue };
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    // Bus dropped this subscriber (overflow) or shut down.
                    None => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

pub fn ws_routes() -> axum::Router<SharedState> {
    use axum::routing::get;
    axum::Router::new()
        .route("/ws", get(ws_global))
        .route("/ws/projects/:id", get(ws_project))
}
