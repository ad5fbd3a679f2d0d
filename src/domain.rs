//! Shared data model: the types every other module speaks in terms of.
//! Kept free of persistence and transport concerns on purpose — the
//! state machine and the API layer both build on these.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserRole {
    Passenger,
    Driver,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserStatus {
    Active,
    Banned,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: UserRole,
    pub status: UserStatus,
    #[serde(skip_serializing)]
    pub password_hash: String,
}

/// Driver availability. Transitions enforced by [`crate::state_machine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum DriverStatus {
    #[serde(rename = "OFFLINE")]
    Offline,
    #[serde(rename = "AVAILABLE")]
    Available,
    #[serde(rename = "EN_ROUTE")]
    EnRoute,
    #[serde(rename = "BUSY")]
    Busy,
}

impl DriverStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            DriverStatus::Offline => "OFFLINE",
            DriverStatus::Available => "AVAILABLE",
            DriverStatus::EnRoute => "EN_ROUTE",
            DriverStatus::Busy => "BUSY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OFFLINE" => Some(DriverStatus::Offline),
            "AVAILABLE" => Some(DriverStatus::Available),
            "EN_ROUTE" => Some(DriverStatus::EnRoute),
            "BUSY" => Some(DriverStatus::Busy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Driver {
    pub id: Uuid,
    pub license: String,
    pub vehicle_type: String,
    pub vehicle_attrs: serde_json::Value,
    pub rating: f64,
    pub status: DriverStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DriverSession {
    pub id: Uuid,
    pub driver_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_rides: i64,
    pub total_earnings: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Passenger,
    Driver,
}

impl EntityType {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            EntityType::Passenger => "passenger",
            EntityType::Driver => "driver",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Coordinate {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub entity_type: EntityType,
    pub lat: f64,
    pub lng: f64,
    pub address: Option<String>,
    pub fare_amount: Option<f64>,
    pub distance_km: Option<f64>,
    pub duration_minutes: Option<f64>,
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum RideType {
    Economy,
    Premium,
    Xl,
}

impl RideType {
    /// Unknown types fall back to ECONOMY.
    pub fn parse_or_economy(s: &str) -> Self {
        match s {
            "PREMIUM" => RideType::Premium,
            "XL" => RideType::Xl,
            _ => RideType::Economy,
        }
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            RideType::Economy => "ECONOMY",
            RideType::Premium => "PREMIUM",
            RideType::Xl => "XL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum RideStatus {
    #[serde(rename = "REQUESTED")]
    Requested,
    #[serde(rename = "MATCHED")]
    Matched,
    #[serde(rename = "EN_ROUTE")]
    EnRoute,
    #[serde(rename = "ARRIVED")]
    Arrived,
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl RideStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            RideStatus::Requested => "REQUESTED",
            RideStatus::Matched => "MATCHED",
            RideStatus::EnRoute => "EN_ROUTE",
            RideStatus::Arrived => "ARRIVED",
            RideStatus::InProgress => "IN_PROGRESS",
            RideStatus::Completed => "COMPLETED",
            RideStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "REQUESTED" => RideStatus::Requested,
            "MATCHED" => RideStatus::Matched,
            "EN_ROUTE" => RideStatus::EnRoute,
            "ARRIVED" => RideStatus::Arrived,
            "IN_PROGRESS" => RideStatus::InProgress,
            "COMPLETED" => RideStatus::Completed,
            "CANCELLED" => RideStatus::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Ride {
    pub id: Uuid,
    pub ride_number: String,
    pub passenger_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub pickup_coordinate_id: Uuid,
    pub destination_coordinate_id: Uuid,
    pub ride_type: RideType,
    pub priority: i32,
    pub estimated_fare: f64,
    pub final_fare: Option<f64>,
    pub distance_km: Option<f64>,
    pub duration_minutes: Option<f64>,
    pub status: RideStatus,
    pub created_at: DateTime<Utc>,
    pub matched_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub arrived_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideEventType {
    RideRequested,
    DriverMatched,
    DriverArrived,
    RideStarted,
    RideCompleted,
    RideCancelled,
    LocationUpdated,
    FareAdjusted,
}

impl RideEventType {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            RideEventType::RideRequested => "RIDE_REQUESTED",
            RideEventType::DriverMatched => "DRIVER_MATCHED",
            RideEventType::DriverArrived => "DRIVER_ARRIVED",
            RideEventType::RideStarted => "RIDE_STARTED",
            RideEventType::RideCompleted => "RIDE_COMPLETED",
            RideEventType::RideCancelled => "RIDE_CANCELLED",
            RideEventType::LocationUpdated => "LOCATION_UPDATED",
            RideEventType::FareAdjusted => "FARE_ADJUSTED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RideEvent {
    pub id: Uuid,
    pub ride_id: Uuid,
    pub event_type: RideEventType,
    pub event_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LocationHistory {
    pub id: Uuid,
    pub driver_id: Uuid,
    pub ride_id: Option<Uuid>,
    pub lat: f64,
    pub lng: f64,
    pub recorded_at: DateTime<Utc>,
}

/// A single geographic point, reused for pickup/destination/mid-ride samples.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

/// The minimal context the orchestrator needs to apply a transition without
/// re-fetching the whole ride row.
#[derive(Debug, Clone)]
pub struct RideContext {
    pub ride_id: Uuid,
    pub status: RideStatus,
    pub driver_id: Option<Uuid>,
    pub passenger_id: Uuid,
    pub pickup: LatLng,
    pub destination: LatLng,
    pub ride_number: String,
    pub ride_type: RideType,
}
