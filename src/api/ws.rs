//! WebSocket upgrade handlers. The actual protocol lives in [`crate::hub`];
//! these just pick which hub a connecting socket belongs to.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::Response;
use uuid::Uuid;

use super::AppState;

pub async fn ws_passenger(
    State(state): State<AppState>,
    Path(passenger_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        state.passenger_hub.handle_socket(socket, passenger_id).await;
    })
}

pub async fn ws_driver(
    State(state): State<AppState>,
    Path(driver_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        state.driver_hub.handle_socket(socket, driver_id).await;
    })
}
