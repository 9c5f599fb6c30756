//! Local stand-in for the marketplace chat backend: the live transport plus
//! the three chat REST routes, all state in memory.

pub mod connection;
pub mod dispatcher;
pub mod routes;

use std::net::SocketAddr;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::dispatcher::Dispatcher;
use crate::routes::require_auth;

pub fn router(dispatcher: Dispatcher) -> Router {
    let api_routes = Router::new()
        .route("/chat", get(routes::list_chats))
        .route("/chat/initiate", post(routes::initiate_chat))
        .route("/chat/{room_id}", get(routes::get_history))
        .layer(middleware::from_fn(require_auth))
        .with_state(dispatcher.clone());

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(dispatcher);

    Router::new()
        .merge(api_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind `addr` and serve in the background. Returns the bound address
/// (useful with port 0) and the dispatcher for inspection.
pub async fn spawn(addr: SocketAddr) -> anyhow::Result<(SocketAddr, Dispatcher)> {
    let dispatcher = Dispatcher::new();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let app = router(dispatcher.clone());

    info!("Gateway listening on {}", local_addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Gateway server error: {}", e);
        }
    });

    Ok((local_addr, dispatcher))
}

async fn ws_upgrade(
    State(dispatcher): State<Dispatcher>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, dispatcher))
}
