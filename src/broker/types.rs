//! Wire types exchanged over the message bus. Field names and shapes follow
//! the external interface contracts; these are plain DTOs, never domain
//! types — the orchestrator translates between the two.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Published on `ride_topic` with routing key `ride.request.<ride_type>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideRequestRabbit {
    pub ride_id: Uuid,
    pub ride_number: String,
    pub pickup_location: Coordinates,
    pub destination_location: Coordinates,
    pub ride_type: String,
    pub estimated_fare: f64,
    pub max_distance_km: f64,
    pub timeout_seconds: u32,
    pub correlation_id: Uuid,
}

/// Minimal rider-facing description of the matched driver, echoed back to
/// the passenger over the WebSocket hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverInfo {
    pub driver_id: Uuid,
    pub name: String,
    pub rating: f64,
    pub vehicle: String,
}

/// Consumed from `driver_responses`, routing key `driver.response.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideResponseMatch {
    pub ride_id: Uuid,
    pub driver_id: Uuid,
    pub accepted: bool,
    pub estimated_arrival_minutes: Option<f64>,
    pub driver_location: Option<Coordinates>,
    pub driver_info: Option<DriverInfo>,
    pub correlation_id: Uuid,
    pub estimated_arrival: Option<DateTime<Utc>>,
}

/// Consumed from `ride_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideStatusUpdate {
    pub ride_id: Uuid,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub driver_id: Uuid,
    pub correlation_id: Uuid,
}

/// Consumed from `location_fanout`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverLocationUpdate {
    pub driver_id: Uuid,
    pub ride_id: Option<Uuid>,
    pub location: Coordinates,
    pub speed_kmh: Option<f64>,
    pub heading_degrees: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// One decoded frame handed from a consumer loop to the orchestrator.
/// Status and location frames are already acked by the consumer loop
/// (auto-ack queues); match responses carry their `Delivery` so the
/// orchestrator can ack only after the resulting transition commits.
#[derive(Debug)]
pub enum BrokerEvent {
    Status(RideStatusUpdate),
    Location(DriverLocationUpdate),
    MatchResponse(RideResponseMatch, lapin::message::Delivery),
}
