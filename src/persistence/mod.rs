//! Persistence gateway: transactional access to rides, coordinates, events,
//! driver sessions, and location history.
//!
//! The trait is the capability the rest of the engine depends on, passed in
//! at construction rather than looked up globally; [`sqlite::SqlitePersistence`]
//! is the only implementation today.

mod sqlite;

pub use sqlite::SqlitePersistence;

use crate::domain::{
    Driver, DriverSession, LatLng, Ride, RideContext, RideEventType, RideStatus, RideType, User,
};
use crate::error::EngineResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CreateRideRequest {
    pub passenger_id: Uuid,
    pub pickup: LatLng,
    pub pickup_address: Option<String>,
    pub destination: LatLng,
    pub destination_address: Option<String>,
    pub ride_type: RideType,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct RideResponse {
    pub ride_id: Uuid,
    pub ride_number: String,
    pub status: RideStatus,
    pub estimated_fare: f64,
    pub estimated_duration_minutes: i64,
    pub estimated_distance_km: f64,
}

/// The fields a given transition may set. Every field is optional/flag-based
/// because not every transition touches every column; `transition_ride`
/// only applies what the caller sets, after the `expected_from` guard
/// passes.
#[derive(Debug, Clone, Default)]
pub struct RidePatch {
    pub driver_id: Option<Uuid>,
    pub set_matched_at: bool,
    pub set_started_at: bool,
    pub set_arrived_at: bool,
    pub set_completed_at: bool,
    pub set_cancelled_at: bool,
    pub cancellation_reason: Option<String>,
    pub final_fare: Option<f64>,
    pub distance_km: Option<f64>,
    pub duration_minutes: Option<f64>,
    /// Driver-status side effect carried by this ride transition, e.g.
    /// AVAILABLE->EN_ROUTE on pickup dispatch, EN_ROUTE->BUSY on ride start.
    pub flip_driver: Option<DriverFlip>,
}

/// Applied atomically alongside the ride status change that triggers it.
#[derive(Debug, Clone)]
pub struct DriverFlip {
    pub driver_id: Uuid,
    pub to: crate::domain::DriverStatus,
    pub location: LatLng,
}

#[derive(Debug, Clone)]
pub struct LocationUpdateResult {
    pub old_fare_estimate: f64,
    pub new_fare: f64,
    pub fare_adjusted: bool,
}

#[derive(Debug, Clone)]
pub struct DriverSessionSummary {
    pub session_id: Uuid,
    pub duration_hours: f64,
    pub rides_completed: i64,
    pub earnings: f64,
}

#[derive(Debug, Clone)]
pub struct CompleteRideRequest {
    pub ride_id: Uuid,
    pub final_location: LatLng,
    pub actual_distance_km: f64,
    pub actual_duration_minutes: f64,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub role: crate::domain::UserRole,
    pub password_hash: String,
    /// Required when `role` is `Driver`; ignored otherwise.
    pub driver_profile: Option<NewDriverProfile>,
}

#[derive(Debug, Clone)]
pub struct NewDriverProfile {
    pub license: String,
    pub vehicle_type: String,
    pub vehicle_attrs: serde_json::Value,
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn create_ride(&self, req: CreateRideRequest) -> EngineResult<RideResponse>;

    async fn get_ride_context(&self, ride_id: Uuid) -> EngineResult<RideContext>;

    /// Within one transaction: read current status (CAS guard), assert it
    /// equals `expected_from`, apply `patch`, append `event`. Returns the
    /// ride row as it stands after commit.
    async fn transition_ride(
        &self,
        ride_id: Uuid,
        expected_from: RideStatus,
        to: RideStatus,
        patch: RidePatch,
        event: RideEventType,
        event_data: serde_json::Value,
    ) -> EngineResult<Ride>;

    async fn update_ride_location(
        &self,
        driver_id: Uuid,
        ride_id: Uuid,
        new_point: LatLng,
    ) -> EngineResult<LocationUpdateResult>;

    async fn driver_go_online(&self, driver_id: Uuid, loc: LatLng) -> EngineResult<Uuid>;

    async fn driver_go_offline(&self, driver_id: Uuid) -> EngineResult<DriverSessionSummary>;

    async fn driver_session_summary(&self, session_id: Uuid) -> EngineResult<DriverSessionSummary>;

    async fn driver_update_location(&self, driver_id: Uuid, loc: LatLng) -> EngineResult<Uuid>;

    /// Validates driver status BUSY and ride ownership, flips the driver to
    /// AVAILABLE, increments the open session's counters, writes the final
    /// location-history row, and completes the ride — all in one
    /// transaction. Returns the final fare.
    async fn driver_complete_ride(
        &self,
        driver_id: Uuid,
        req: CompleteRideRequest,
    ) -> EngineResult<f64>;

    async fn get_driver(&self, driver_id: Uuid) -> EngineResult<Driver>;

    async fn get_driver_session(&self, session_id: Uuid) -> EngineResult<DriverSession>;

    /// Account bookkeeping kept intentionally thin — real identity
    /// management is an external collaborator in production.
    async fn register_user(&self, user: NewUser) -> EngineResult<Uuid>;

    async fn find_user_by_email(&self, email: &str) -> EngineResult<User>;
}
