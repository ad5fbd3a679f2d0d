//! Thin HTTP surface binding the orchestrator/persistence/broker
//! capabilities to JSON request/response bodies. Validation here is
//! intentionally shallow — the state machine and the persistence gateway
//! are the actual source of truth.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::AppState;
use crate::auth::Claims;
use crate::domain::{LatLng, RideType, UserRole};
use crate::error::{EngineError, EngineResult};
use crate::persistence::{CompleteRideRequest, CreateRideRequest, NewUser};

fn bearer_claims(state: &AppState, headers: &HeaderMap) -> EngineResult<Claims> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| EngineError::AuthFailed("missing Authorization header".into()))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| EngineError::AuthFailed("malformed Authorization header".into()))?;
    state.auth.verify(token)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    pub role: UserRole,
    /// Required when `role` is `DRIVER`.
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub vehicle_type: Option<String>,
    #[serde(default)]
    pub vehicle_attrs: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuthResponse {
    pub id: Uuid,
    pub token: String,
}

#[utoipa::path(post, path = "/register", request_body = RegisterRequest, responses((status = 200, body = AuthResponse)))]
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> EngineResult<Json<AuthResponse>> {
    let password_hash = state.auth.hash_password(&req.password)?;

    let driver_profile = if req.role == UserRole::Driver {
        let license = req
            .license
            .clone()
            .ok_or_else(|| EngineError::InvalidInput("license is required for drivers".into()))?;
        let vehicle_type = req
            .vehicle_type
            .clone()
            .ok_or_else(|| EngineError::InvalidInput("vehicle_type is required for drivers".into()))?;
        Some(crate::persistence::NewDriverProfile {
            license,
            vehicle_type,
            vehicle_attrs: req.vehicle_attrs.clone().unwrap_or(serde_json::json!({})),
        })
    } else {
        None
    };

    let id = state
        .persistence
        .register_user(NewUser {
            name: req.name.clone(),
            email: req.email.clone(),
            role: req.role,
            password_hash,
            driver_profile,
        })
        .await?;
    let claims = Claims::new(id, req.name, req.email, req.role);
    let token = state.auth.issue(&claims)?;
    Ok(Json(AuthResponse { id, token }))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> EngineResult<Json<AuthResponse>> {
    let user = state.persistence.find_user_by_email(&req.email).await?;
    if user.status != crate::domain::UserStatus::Active {
        return Err(EngineError::InvalidInput("account is not active".into()));
    }
    if !state.auth.check_password(&req.password, &user.password_hash)? {
        return Err(EngineError::InvalidInput("wrong password".into()));
    }
    let claims = Claims::new(user.id, user.name, user.email, user.role);
    let token = state.auth.issue(&claims)?;
    Ok(Json(AuthResponse { id: user.id, token }))
}

pub async fn user_info(State(state): State<AppState>, headers: HeaderMap) -> EngineResult<Json<Claims>> {
    Ok(Json(bearer_claims(&state, &headers)?))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateRideBody {
    pub passenger_id: Uuid,
    pub pickup_lat: f64,
    pub pickup_lng: f64,
    pub pickup_address: Option<String>,
    pub destination_lat: f64,
    pub destination_lng: f64,
    pub destination_address: Option<String>,
    pub ride_type: String,
}

#[utoipa::path(post, path = "/rides", request_body = CreateRideBody, responses((status = 200, body = crate::persistence::RideResponse)))]
pub async fn create_ride(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateRideBody>,
) -> EngineResult<Json<crate::persistence::RideResponse>> {
    let claims = bearer_claims(&state, &headers)?;
    if claims.user_id != body.passenger_id {
        return Err(EngineError::AuthFailed("passenger_id must match token".into()));
    }
    validate_latlng(body.pickup_lat, body.pickup_lng)?;
    validate_latlng(body.destination_lat, body.destination_lng)?;

    let response = state
        .orchestrator
        .create_ride(CreateRideRequest {
            passenger_id: body.passenger_id,
            pickup: LatLng {
                lat: body.pickup_lat,
                lng: body.pickup_lng,
            },
            pickup_address: body.pickup_address,
            destination: LatLng {
                lat: body.destination_lat,
                lng: body.destination_lng,
            },
            destination_address: body.destination_address,
            ride_type: RideType::parse_or_economy(&body.ride_type),
        })
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct CancelRideBody {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelRideResponse {
    pub ride_id: Uuid,
    pub status: crate::domain::RideStatus,
    pub cancelled_at: chrono::DateTime<chrono::Utc>,
    pub message: String,
}

pub async fn cancel_ride(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(ride_id): Path<Uuid>,
    Json(body): Json<CancelRideBody>,
) -> EngineResult<Json<CancelRideResponse>> {
    let claims = bearer_claims(&state, &headers)?;
    state
        .orchestrator
        .cancel_ride(ride_id, claims.user_id, body.reason)
        .await?;
    Ok(Json(CancelRideResponse {
        ride_id,
        status: crate::domain::RideStatus::Cancelled,
        cancelled_at: chrono::Utc::now(),
        message: "ride cancelled".into(),
    }))
}

fn validate_latlng(lat: f64, lng: f64) -> EngineResult<()> {
    if !(-90.0..=90.0).contains(&lat) {
        return Err(EngineError::InvalidInput(format!("latitude {lat} out of range")));
    }
    if !(-180.0..=180.0).contains(&lng) {
        return Err(EngineError::InvalidInput(format!("longitude {lng} out of range")));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct OnlineBody {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Serialize)]
pub struct OnlineResponse {
    pub status: crate::domain::DriverStatus,
    pub session_id: Uuid,
    pub message: String,
}

pub async fn driver_online(
    State(state): State<AppState>,
    Path(driver_id): Path<Uuid>,
    Json(body): Json<OnlineBody>,
) -> EngineResult<Json<OnlineResponse>> {
    validate_latlng(body.lat, body.lng)?;
    let session_id = state
        .persistence
        .driver_go_online(driver_id, LatLng { lat: body.lat, lng: body.lng })
        .await?;
    Ok(Json(OnlineResponse {
        status: crate::domain::DriverStatus::Available,
        session_id,
        message: "driver is online".into(),
    }))
}

#[derive(Debug, Serialize)]
pub struct OfflineResponse {
    pub status: crate::domain::DriverStatus,
    pub session_id: Uuid,
    pub session_summary: SessionSummaryBody,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SessionSummaryBody {
    pub duration_hours: f64,
    pub rides_completed: i64,
    pub earnings: f64,
}

pub async fn driver_offline(
    State(state): State<AppState>,
    Path(driver_id): Path<Uuid>,
) -> EngineResult<Json<OfflineResponse>> {
    let summary = state.persistence.driver_go_offline(driver_id).await?;
    Ok(Json(OfflineResponse {
        status: crate::domain::DriverStatus::Offline,
        session_id: summary.session_id,
        session_summary: SessionSummaryBody {
            duration_hours: summary.duration_hours,
            rides_completed: summary.rides_completed,
            earnings: summary.earnings,
        },
        message: "driver is offline".into(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct DriverLocationBody {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy_meters: Option<f64>,
    #[serde(default)]
    pub speed_kmh: Option<f64>,
    #[serde(default)]
    pub heading_degrees: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct DriverLocationResponse {
    pub coordinate_id: Uuid,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

pub async fn driver_location(
    State(state): State<AppState>,
    Path(driver_id): Path<Uuid>,
    Json(body): Json<DriverLocationBody>,
) -> EngineResult<Json<DriverLocationResponse>> {
    validate_latlng(body.latitude, body.longitude)?;
    if body.accuracy_meters.is_some_and(|v| v < 0.0) {
        return Err(EngineError::InvalidInput("accuracy_meters must be non-negative".into()));
    }
    if body.speed_kmh.is_some_and(|v| v < 0.0) {
        return Err(EngineError::InvalidInput("speed_kmh must be non-negative".into()));
    }
    if body.heading_degrees.is_some_and(|v| !(0.0..360.0).contains(&v)) {
        return Err(EngineError::InvalidInput("heading_degrees must be in [0, 360)".into()));
    }

    let coordinate_id = state
        .persistence
        .driver_update_location(driver_id, LatLng { lat: body.latitude, lng: body.longitude })
        .await?;
    Ok(Json(DriverLocationResponse {
        coordinate_id,
        updated_at: chrono::Utc::now(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct DriverRideStatusBody {
    pub ride_id: Uuid,
}

/// Publishes a driver-originated status notification onto the bus, the
/// same path a real driver-service instance would use. The orchestrator's
/// status consumer loop then applies the transition, so an HTTP-originated
/// status change and a bus-originated one are handled identically.
async fn publish_driver_status(
    state: &AppState,
    driver_id: Uuid,
    ride_id: Uuid,
    status: &str,
) -> EngineResult<()> {
    state
        .broker
        .publish_ride_status(crate::broker::RideStatusUpdate {
            ride_id,
            status: status.to_string(),
            timestamp: chrono::Utc::now(),
            driver_id,
            correlation_id: Uuid::new_v4(),
        })
        .await
}

pub async fn driver_route(
    State(state): State<AppState>,
    Path(driver_id): Path<Uuid>,
    Json(body): Json<DriverRideStatusBody>,
) -> EngineResult<Json<serde_json::Value>> {
    publish_driver_status(&state, driver_id, body.ride_id, "EN_ROUTE").await?;
    Ok(Json(serde_json::json!({ "status": "EN_ROUTE" })))
}

pub async fn driver_start(
    State(state): State<AppState>,
    Path(driver_id): Path<Uuid>,
    Json(body): Json<DriverRideStatusBody>,
) -> EngineResult<Json<serde_json::Value>> {
    publish_driver_status(&state, driver_id, body.ride_id, "IN_PROGRESS").await?;
    Ok(Json(serde_json::json!({ "status": "IN_PROGRESS" })))
}

#[derive(Debug, Deserialize)]
pub struct CompleteRideBody {
    pub ride_id: Uuid,
    pub final_location: FinalLocationBody,
    pub actual_distance_km: f64,
    pub actual_duration_minutes: f64,
}

#[derive(Debug, Deserialize)]
pub struct FinalLocationBody {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Serialize)]
pub struct CompleteRideResponse {
    pub ride_id: Uuid,
    pub status: crate::domain::DriverStatus,
    pub completed_at: chrono::DateTime<chrono::Utc>,
    pub driver_earnings: f64,
    pub message: String,
}

pub async fn driver_complete(
    State(state): State<AppState>,
    Path(driver_id): Path<Uuid>,
    Json(body): Json<CompleteRideBody>,
) -> EngineResult<Json<CompleteRideResponse>> {
    let final_fare = state
        .persistence
        .driver_complete_ride(
            driver_id,
            CompleteRideRequest {
                ride_id: body.ride_id,
                final_location: LatLng {
                    lat: body.final_location.lat,
                    lng: body.final_location.lng,
                },
                actual_distance_km: body.actual_distance_km,
                actual_duration_minutes: body.actual_duration_minutes,
            },
        )
        .await?;
    Ok(Json(CompleteRideResponse {
        ride_id: body.ride_id,
        status: crate::domain::DriverStatus::Available,
        completed_at: chrono::Utc::now(),
        driver_earnings: final_fare,
        message: "ride completed".into(),
    }))
}
