mod handlers;
mod types;

use axum::{
    routing::{get, post},
    Router,
};

use std::sync::atomic::{AtomicU32, Ordering};
use std::{collections::HashMap, sync::Arc};
use std::{io::ErrorKind, net::Ipv4Addr};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, TraceLayer};

pub use handlers::*;
pub use types::*;

pub type Sessions = Arc<Mutex<HashMap<u32, BufferSession>>>;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Sessions,
    next_id: Arc<AtomicU32>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU32::new(1)),
        }
    }

    fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Clones the session handles so the map lock is not held while the buffer is used.
    pub async fn session(&self, id: u32) -> Option<BufferSession> {
        self.sessions.lock().await.get(&id).cloned()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/buffers", post(create_buffer))
        .route("/buffers/{id}", get(snapshot_buffer).delete(delete_buffer))
        .route("/buffers/{id}/write", post(write_buffer))
        .route("/buffers/{id}/text", get(buffer_text))
        .route("/buffers/{id}/stats", get(buffer_stats))
        .route("/buffers/{id}/reset", post(reset_buffer))
        .route("/buffers/{id}/follow", get(follow_buffer))
        .with_state(state)
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
}

pub async fn start_server(host: Ipv4Addr, port: u16) {
    let app = router(AppState::new());
    let addr: std::net::SocketAddr = (host, port).into();

    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            match listener.local_addr() {
                Ok(local) => tracing::info!("listening on {}", local),
                Err(_) => tracing::info!("listening on {}", addr),
            }

            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Server error: {}", e);
            }
        }
        Err(e) => {
            if e.kind() == ErrorKind::AddrInUse {
                tracing::error!("Port {} is already in use", port);
            } else {
                tracing::error!("Failed to bind: {}", e);
            }
        }
    }
}
