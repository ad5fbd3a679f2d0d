//! HTTP + WebSocket surface: request/response shapes and route wiring. The
//! orchestrator, persistence gateway, and broker do the actual work; this
//! module only translates between wire formats and their calls.

pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::auth::TokenVerifier;
use crate::broker::BrokerGateway;
use crate::hub::Hub;
use crate::orchestrator::Orchestrator;
use crate::persistence::PersistenceGateway;

#[derive(Clone)]
pub struct AppState {
    pub persistence: Arc<dyn PersistenceGateway>,
    pub broker: Arc<dyn BrokerGateway>,
    pub orchestrator: Arc<Orchestrator>,
    pub passenger_hub: Hub,
    pub driver_hub: Hub,
    pub auth: Arc<TokenVerifier>,
}

#[derive(OpenApi)]
#[openapi(paths(
    http::register,
    http::create_ride,
), components(schemas(
    http::RegisterRequest,
    http::AuthResponse,
    http::CreateRideBody,
    crate::persistence::RideResponse,
)))]
pub struct ApiDoc;

pub fn router(state: AppState) -> (Router, utoipa::openapi::OpenApi) {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .routes(routes!(http::register))
        .routes(routes!(http::create_ride))
        .route("/login", axum::routing::post(http::login))
        .route("/user/info", get(http::user_info))
        .route("/rides/{ride_id}/cancel", axum::routing::post(http::cancel_ride))
        .route("/drivers/{driver_id}/online", axum::routing::post(http::driver_online))
        .route("/drivers/{driver_id}/offline", axum::routing::post(http::driver_offline))
        .route("/drivers/{driver_id}/location", axum::routing::post(http::driver_location))
        .route("/drivers/{driver_id}/route", axum::routing::post(http::driver_route))
        .route("/drivers/{driver_id}/start", axum::routing::post(http::driver_start))
        .route("/drivers/{driver_id}/complete", axum::routing::post(http::driver_complete))
        .route("/ws/passengers/{passenger_id}", get(ws::ws_passenger))
        .route("/ws/drivers/{driver_id}", get(ws::ws_driver))
        .with_state(state)
        .split_for_parts();
    (router, api)
}
