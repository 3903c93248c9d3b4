use super::types::*;
use super::AppState;
use crate::buffer::{strip_ansi, RingBuffer};
use crate::utils::parse_capacity;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, watch, Mutex};

/// One named ring buffer plus the channels its followers listen on.
#[derive(Clone)]
pub struct BufferSession {
    pub buffer: Arc<Mutex<RingBuffer>>,
    pub updates: broadcast::Sender<Bytes>,
    pub last_accessed: Arc<Mutex<SystemTime>>,
    /// Flips to `true` once the session is deleted.
    closed: Arc<watch::Sender<bool>>,
}

impl BufferSession {
    pub fn new(buffer: RingBuffer) -> Self {
        let (updates, _) = broadcast::channel(FOLLOW_BACKLOG);
        let (closed, _) = watch::channel(false);
        Self {
            buffer: Arc::new(Mutex::new(buffer)),
            updates,
            last_accessed: Arc::new(Mutex::new(SystemTime::now())),
            closed: Arc::new(closed),
        }
    }

    pub async fn touch(&self) {
        *self.last_accessed.lock().await = SystemTime::now();
    }

    pub async fn idle(&self) -> Duration {
        self.last_accessed
            .lock()
            .await
            .elapsed()
            .unwrap_or_default()
    }

    /// Writes and publishes under the buffer lock, so followers see writes in buffer order.
    pub async fn append(&self, data: Bytes) -> BufferStats {
        self.touch().await;
        let mut buffer = self.buffer.lock().await;
        buffer.write(&data);
        // No followers is fine.
        let _ = self.updates.send(data);
        BufferStats::from(&*buffer)
    }

    /// Tells every follower to hang up. Clones held by follower tasks keep
    /// the channels alive, so dropping the session alone is not enough.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

fn not_found(id: u32) -> Response {
    tracing::warn!("Buffer {} not found", id);
    error_response(StatusCode::NOT_FOUND, "Buffer not found")
}

pub async fn create_buffer(
    State(state): State<AppState>,
    Json(options): Json<BufferOptions>,
) -> impl IntoResponse {
    let capacity = match options.capacity.as_ref() {
        Some(value) => match parse_capacity(value, "capacity") {
            Ok(capacity) => capacity,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
        },
        None => DEFAULT_CAPACITY,
    };

    if capacity > MAX_CAPACITY {
        tracing::warn!(capacity, "Rejected oversized buffer request");
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("capacity must not exceed {MAX_CAPACITY} bytes."),
        );
    }

    let buffer = match RingBuffer::new(capacity) {
        Ok(buffer) => buffer,
        Err(e) => {
            tracing::error!("Failed to create buffer: {}", e);
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    let id = state.allocate_id();
    state
        .sessions
        .lock()
        .await
        .insert(id, BufferSession::new(buffer));
    tracing::info!(id, capacity, "Buffer created");

    (StatusCode::OK, id.to_string()).into_response()
}

pub async fn write_buffer(
    State(state): State<AppState>,
    Path(id): Path<u32>,
    body: Bytes,
) -> impl IntoResponse {
    let Some(session) = state.session(id).await else {
        return not_found(id);
    };

    let bytes = body.len();
    let stats = session.append(body).await;
    tracing::debug!(id, bytes, total_written = stats.total_written, "Buffer write");
    Json(stats).into_response()
}

pub async fn snapshot_buffer(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> impl IntoResponse {
    let Some(session) = state.session(id).await else {
        return not_found(id);
    };

    session.touch().await;
    let contents = session.buffer.lock().await.snapshot().into_owned();
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        contents,
    )
        .into_response()
}

pub async fn buffer_text(
    State(state): State<AppState>,
    Path(id): Path<u32>,
    Query(query): Query<TextQuery>,
) -> impl IntoResponse {
    let Some(session) = state.session(id).await else {
        return not_found(id);
    };

    session.touch().await;
    let text = session.buffer.lock().await.to_text_lossy();
    if query.strip_ansi {
        strip_ansi(&text).into_owned().into_response()
    } else {
        text.into_response()
    }
}

pub async fn buffer_stats(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> impl IntoResponse {
    let Some(session) = state.session(id).await else {
        return not_found(id);
    };

    let buffer = BufferStats::from(&*session.buffer.lock().await);
    let idle_ms = u64::try_from(session.idle().await.as_millis()).unwrap_or(u64::MAX);
    Json(SessionStats { buffer, idle_ms }).into_response()
}

pub async fn reset_buffer(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> impl IntoResponse {
    let Some(session) = state.session(id).await else {
        return not_found(id);
    };

    session.buffer.lock().await.reset();
    tracing::info!("Buffer {} reset", id);
    Json(serde_json::json!({"success": true})).into_response()
}

pub async fn delete_buffer(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> impl IntoResponse {
    tracing::info!("Deleting buffer {}", id);
    let removed = state.sessions.lock().await.remove(&id);
    if let Some(session) = removed {
        session.close();
        Json(serde_json::json!({"success": true})).into_response()
    } else {
        not_found(id)
    }
}

pub async fn follow_buffer(
    ws: WebSocketUpgrade,
    Path(id): Path<u32>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    tracing::info!("WebSocket follow request for buffer {}", id);
    let Some(session) = state.session(id).await else {
        return not_found(id);
    };
    session.touch().await;
    ws.on_upgrade(move |socket| handle_socket(socket, id, session))
        .into_response()
}

async fn handle_socket(socket: WebSocket, id: u32, session: BufferSession) {
    let (mut sender, mut receiver) = socket.split();

    // Snapshot and subscribe together so no write is missed or sent twice.
    let (initial, mut updates, mut closed) = {
        let buffer = session.buffer.lock().await;
        (
            buffer.snapshot().into_owned(),
            session.updates.subscribe(),
            session.closed.subscribe(),
        )
    };

    if !initial.is_empty() && sender.send(Message::Binary(initial.into())).await.is_err() {
        return;
    }
    tracing::info!("WebSocket follow established for buffer {}", id);

    let mut buffer_to_ws = tokio::spawn(async move {
        let deleted = *closed.borrow_and_update();
        if !deleted {
            loop {
                tokio::select! {
                    // Only ever changes to `true`; an error means the session is gone too.
                    _ = closed.changed() => break,
                    update = updates.recv() => match update {
                        Ok(data) => {
                            if sender.send(Message::Binary(data)).await.is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(id, skipped, "Follower lagged behind, writes dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }
        tracing::info!("Buffer {} closed, hanging up follower", id);
        let _ = sender.send(Message::Close(None)).await;
    });

    let mut ws_to_buffer = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            let data = match message {
                Message::Text(text) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                Message::Binary(data) => data,
                Message::Close(_) => break,
                _ => continue,
            };
            session.append(data).await;
        }
    });

    tokio::select! {
        _ = &mut buffer_to_ws => {
            ws_to_buffer.abort();
            tracing::info!("Buffer to WebSocket task completed for buffer {}", id);
        }
        _ = &mut ws_to_buffer => {
            buffer_to_ws.abort();
            tracing::info!("WebSocket to buffer task completed for buffer {}", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    async fn body_bytes(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable")
    }

    async fn stats_of(response: Response) -> BufferStats {
        serde_json::from_slice(&body_bytes(response).await).expect("stats json")
    }

    async fn create(state: &AppState, capacity: serde_json::Value) -> u32 {
        let options = BufferOptions {
            capacity: Some(capacity),
        };
        let response = create_buffer(State(state.clone()), Json(options))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let id = body_bytes(response).await;
        std::str::from_utf8(&id).unwrap().parse().unwrap()
    }

    async fn serve(state: AppState) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        let app = crate::server::router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("server should run");
        });
        addr
    }

    async fn next_binary<S>(ws: &mut S) -> Bytes
    where
        S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("frame within timeout")
                .expect("socket open")
                .expect("valid frame");
            match message {
                WsMessage::Binary(data) => return data,
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_create_assigns_distinct_ids() {
        let state = AppState::new();
        let a = create(&state, json!(16)).await;
        let b = create(&state, json!("32")).await;
        assert_ne!(a, b);
        assert_eq!(state.sessions.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_create_default_capacity() {
        let state = AppState::new();
        let response = create_buffer(State(state.clone()), Json(BufferOptions::default()))
            .await
            .into_response();
        let id: u32 = std::str::from_utf8(&body_bytes(response).await)
            .unwrap()
            .parse()
            .unwrap();

        let stats = stats_of(buffer_stats(State(state), Path(id)).await.into_response()).await;
        assert_eq!(stats.capacity, DEFAULT_CAPACITY);
        assert_eq!(stats.total_written, 0);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_capacity() {
        let state = AppState::new();
        for capacity in [json!(0), json!("0"), json!(-3), json!("big")] {
            let options = BufferOptions {
                capacity: Some(capacity),
            };
            let response = create_buffer(State(state.clone()), Json(options))
                .await
                .into_response();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
        assert!(state.sessions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_write_then_snapshot_keeps_tail() {
        let state = AppState::new();
        let id = create(&state, json!(5)).await;

        let response = write_buffer(
            State(state.clone()),
            Path(id),
            Bytes::from_static(b"hello world"),
        )
        .await
        .into_response();
        let stats = stats_of(response).await;
        assert_eq!(
            stats,
            BufferStats {
                capacity: 5,
                total_written: 11,
                len: 5,
                evicted: 6,
            }
        );

        let response = snapshot_buffer(State(state), Path(id)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );
        assert_eq!(&body_bytes(response).await[..], b"world");
    }

    #[tokio::test]
    async fn test_text_strips_ansi_on_request() {
        let state = AppState::new();
        let id = create(&state, json!(64)).await;
        write_buffer(
            State(state.clone()),
            Path(id),
            Bytes::from_static(b"\x1b[32mok\x1b[0m done"),
        )
        .await;

        let raw = buffer_text(State(state.clone()), Path(id), Query(TextQuery::default()))
            .await
            .into_response();
        assert_eq!(&body_bytes(raw).await[..], b"\x1b[32mok\x1b[0m done");

        let stripped = buffer_text(State(state), Path(id), Query(TextQuery { strip_ansi: true }))
            .await
            .into_response();
        assert_eq!(&body_bytes(stripped).await[..], b"ok done");
    }

    #[tokio::test]
    async fn test_reset_and_delete() {
        let state = AppState::new();
        let id = create(&state, json!(8)).await;
        write_buffer(State(state.clone()), Path(id), Bytes::from_static(b"abc")).await;

        let response = reset_buffer(State(state.clone()), Path(id)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let stats = stats_of(buffer_stats(State(state.clone()), Path(id)).await.into_response()).await;
        assert_eq!(stats.total_written, 0);
        assert_eq!(stats.len, 0);

        let response = delete_buffer(State(state.clone()), Path(id)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let response = snapshot_buffer(State(state.clone()), Path(id)).await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = delete_buffer(State(state), Path(id)).await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_buffer_is_not_found() {
        let state = AppState::new();
        let response = write_buffer(State(state.clone()), Path(42), Bytes::from_static(b"x"))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = buffer_stats(State(state), Path(42)).await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_append_publishes_to_followers() {
        let session = BufferSession::new(RingBuffer::new(4).unwrap());
        let mut follower = session.updates.subscribe();

        session.append(Bytes::from_static(b"ab")).await;
        session.append(Bytes::from_static(b"cdef")).await;

        assert_eq!(&follower.recv().await.unwrap()[..], b"ab");
        assert_eq!(&follower.recv().await.unwrap()[..], b"cdef");
        assert_eq!(&*session.buffer.lock().await.snapshot(), b"cdef");
    }

    #[tokio::test]
    async fn test_create_rejects_capacity_above_limit() {
        let state = AppState::new();
        for capacity in [json!("70000000000000"), json!(MAX_CAPACITY + 1)] {
            let options = BufferOptions {
                capacity: Some(capacity),
            };
            let response = create_buffer(State(state.clone()), Json(options))
                .await
                .into_response();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body: serde_json::Value =
                serde_json::from_slice(&body_bytes(response).await).expect("error json");
            assert!(body["error"].as_str().unwrap().contains("must not exceed"));
        }
        assert!(state.sessions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_stats_report_idle_time() {
        let state = AppState::new();
        let id = create(&state, json!(8)).await;
        let session = state.session(id).await.unwrap();
        *session.last_accessed.lock().await = SystemTime::now() - Duration::from_secs(30);

        let response = buffer_stats(State(state.clone()), Path(id)).await.into_response();
        let stats: SessionStats =
            serde_json::from_slice(&body_bytes(response).await).expect("stats json");
        assert!(stats.idle_ms >= 30_000);
        assert_eq!(stats.buffer.capacity, 8);

        write_buffer(State(state.clone()), Path(id), Bytes::from_static(b"hi")).await;
        let response = buffer_stats(State(state), Path(id)).await.into_response();
        let stats: SessionStats =
            serde_json::from_slice(&body_bytes(response).await).expect("stats json");
        assert!(stats.idle_ms < 30_000);
        assert_eq!(stats.buffer.total_written, 2);
    }

    #[tokio::test]
    async fn test_follow_replays_snapshot_then_live_writes() {
        let state = AppState::new();
        let id = create(&state, json!(5)).await;
        write_buffer(
            State(state.clone()),
            Path(id),
            Bytes::from_static(b"hello world"),
        )
        .await;

        let addr = serve(state.clone()).await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/buffers/{id}/follow"))
            .await
            .expect("websocket handshake");

        assert_eq!(&next_binary(&mut ws).await[..], b"world");

        write_buffer(State(state.clone()), Path(id), Bytes::from_static(b"ab")).await;
        write_buffer(State(state.clone()), Path(id), Bytes::from_static(b"cd")).await;
        assert_eq!(&next_binary(&mut ws).await[..], b"ab");
        assert_eq!(&next_binary(&mut ws).await[..], b"cd");

        // Client frames are written into the ring and published like any other write.
        ws.send(WsMessage::text("xy")).await.expect("send text frame");
        assert_eq!(&next_binary(&mut ws).await[..], b"xy");

        let response = snapshot_buffer(State(state.clone()), Path(id))
            .await
            .into_response();
        assert_eq!(&body_bytes(response).await[..], b"bcdxy");

        // Every write was delivered exactly once.
        let extra = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
        assert!(extra.is_err(), "unexpected extra frame: {extra:?}");
    }

    #[tokio::test]
    async fn test_delete_hangs_up_followers() {
        let state = AppState::new();
        let id = create(&state, json!(8)).await;
        write_buffer(State(state.clone()), Path(id), Bytes::from_static(b"log")).await;

        let addr = serve(state.clone()).await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/buffers/{id}/follow"))
            .await
            .expect("websocket handshake");
        assert_eq!(&next_binary(&mut ws).await[..], b"log");

        let response = delete_buffer(State(state.clone()), Path(id))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("follower should be hung up after delete");
        assert!(matches!(next, Some(Ok(WsMessage::Close(_))) | None));
    }

    #[tokio::test]
    async fn test_close_seen_by_late_subscribers() {
        let session = BufferSession::new(RingBuffer::new(4).unwrap());
        session.close();
        assert!(*session.closed.subscribe().borrow());
    }
}
