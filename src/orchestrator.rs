//! Binds broker consumer events and inbound HTTP commands to the ride state
//! machine, and fans out resulting transitions to the passenger/driver
//! WebSocket hubs.
//!
//! Depends on narrow capabilities (persistence, broker, the two hubs)
//! rather than any concrete implementation, so Orchestrator ↔ Hub ↔
//! Persistence cycles are resolved at construction instead of through
//! global state.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{
    BrokerEvent, BrokerGateway, Coordinates, DriverInfo, RideRequestRabbit, RideResponseMatch,
    RideStatusUpdate,
};
use crate::domain::{DriverStatus, LatLng, RideStatus, RideType};
use crate::error::{EngineError, EngineResult};
use crate::geo;
use crate::hub::Hub;
use crate::persistence::{CreateRideRequest, PersistenceGateway, RidePatch};

pub struct Orchestrator {
    persistence: Arc<dyn PersistenceGateway>,
    broker: Arc<dyn BrokerGateway>,
    passenger_hub: Hub,
    driver_hub: Hub,
}

impl Orchestrator {
    pub fn new(
        persistence: Arc<dyn PersistenceGateway>,
        broker: Arc<dyn BrokerGateway>,
        passenger_hub: Hub,
        driver_hub: Hub,
    ) -> Arc<Self> {
        Arc::new(Self {
            persistence,
            broker,
            passenger_hub,
            driver_hub,
        })
    }

    /// Drains the unified broker-event channel until the sender side is
    /// dropped (shutdown). Each event is handled independently; a failure
    /// in one never stops the loop — it's logged with enough context to
    /// correlate against the ride/driver and the loop continues.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<BrokerEvent>) {
        info!("orchestrator started");
        while let Some(event) = events.recv().await {
            match event {
                BrokerEvent::Status(update) => {
                    if let Err(e) = self.handle_status(update.clone()).await {
                        warn!(ride_id = %update.ride_id, status = %update.status, error = %e, "status update rejected");
                    }
                }
                BrokerEvent::Location(update) => {
                    if let Err(e) = self.handle_location(update.clone()).await {
                        warn!(driver_id = %update.driver_id, error = %e, "location update rejected");
                    }
                }
                BrokerEvent::MatchResponse(response, delivery) => {
                    let ride_id = response.ride_id;
                    if let Err(e) = self.handle_match_response(response).await {
                        warn!(ride_id = %ride_id, error = %e, "match response rejected");
                    }
                    if let Err(e) = self.broker.ack(delivery).await {
                        error!(ride_id = %ride_id, error = %e, "failed to ack match response");
                    }
                }
            }
        }
        info!("orchestrator event loop stopped: broker channel closed");
    }

    /// Passenger command: creates the ride, persists it, then publishes the
    /// offer to the driver-service work queue.
    pub async fn create_ride(&self, req: CreateRideRequest) -> EngineResult<crate::persistence::RideResponse> {
        let ride_type = req.ride_type;
        let response = self.persistence.create_ride(req).await?;

        let rate = geo::fare_rate(ride_type);
        let ctx = self.persistence.get_ride_context(response.ride_id).await?;
        let request = RideRequestRabbit {
            ride_id: response.ride_id,
            ride_number: response.ride_number.clone(),
            pickup_location: Coordinates {
                lat: ctx.pickup.lat,
                lng: ctx.pickup.lng,
                address: None,
            },
            destination_location: Coordinates {
                lat: ctx.destination.lat,
                lng: ctx.destination.lng,
                address: None,
            },
            ride_type: ride_type_str(ride_type).to_string(),
            estimated_fare: response.estimated_fare,
            max_distance_km: response.estimated_distance_km,
            timeout_seconds: 30,
            correlation_id: Uuid::new_v4(),
        };

        if let Err(e) = self.broker.publish_ride_request(rate.priority as u8, request).await {
            warn!(ride_id = %response.ride_id, error = %e, "failed to publish ride request");
        }

        Ok(response)
    }

    /// Passenger command: cancel before IN_PROGRESS. Informs the driver hub
    /// if a driver was already assigned.
    pub async fn cancel_ride(
        &self,
        ride_id: Uuid,
        passenger_id: Uuid,
        reason: Option<String>,
    ) -> EngineResult<()> {
        let ctx = self.persistence.get_ride_context(ride_id).await?;
        if ctx.passenger_id != passenger_id {
            return Err(EngineError::AuthFailed("not the owner of this ride".into()));
        }
        crate::state_machine::validate_passenger_cancel(ctx.status)?;

        let patch = RidePatch {
            set_cancelled_at: true,
            cancellation_reason: reason,
            ..Default::default()
        };
        let ride = self
            .persistence
            .transition_ride(
                ride_id,
                ctx.status,
                RideStatus::Cancelled,
                patch,
                crate::domain::RideEventType::RideCancelled,
                serde_json::json!({ "ride_number": ctx.ride_number }),
            )
            .await?;

        self.passenger_hub
            .push(
                passenger_id,
                ride_status_frame(&ride.ride_number, ride_id, RideStatus::Cancelled, None, None),
            )
            .await;
        if let Some(driver_id) = ctx.driver_id {
            self.driver_hub
                .push(
                    driver_id,
                    ride_status_frame(&ride.ride_number, ride_id, RideStatus::Cancelled, None, None),
                )
                .await;
        }
        Ok(())
    }

    async fn handle_status(&self, update: RideStatusUpdate) -> EngineResult<()> {
        let to = RideStatus::parse(&update.status)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown ride status {:?}", update.status)))?;
        let ctx = self.persistence.get_ride_context(update.ride_id).await?;

        let patch = match to {
            RideStatus::EnRoute => RidePatch {
                flip_driver: ctx.driver_id.map(|driver_id| crate::persistence::DriverFlip {
                    driver_id,
                    to: DriverStatus::EnRoute,
                    location: ctx.pickup,
                }),
                ..Default::default()
            },
            RideStatus::Arrived => RidePatch {
                set_arrived_at: true,
                ..Default::default()
            },
            RideStatus::InProgress => RidePatch {
                set_started_at: true,
                flip_driver: ctx.driver_id.map(|driver_id| crate::persistence::DriverFlip {
                    driver_id,
                    to: DriverStatus::Busy,
                    location: ctx.destination,
                }),
                ..Default::default()
            },
            other => {
                return Err(EngineError::InvalidTransition(format!(
                    "status event cannot drive transition to {other:?}"
                )))
            }
        };

        let event_type = match to {
            RideStatus::EnRoute => crate::domain::RideEventType::DriverMatched,
            RideStatus::Arrived => crate::domain::RideEventType::DriverArrived,
            RideStatus::InProgress => crate::domain::RideEventType::RideStarted,
            _ => unreachable!(),
        };

        let ride = self
            .persistence
            .transition_ride(
                update.ride_id,
                ctx.status,
                to,
                patch,
                event_type,
                serde_json::json!({ "driver_id": update.driver_id }),
            )
            .await?;

        self.passenger_hub
            .push(
                ctx.passenger_id,
                ride_status_frame(&ride.ride_number, update.ride_id, to, ctx.driver_id, None),
            )
            .await;
        Ok(())
    }

    async fn handle_location(&self, update: crate::broker::DriverLocationUpdate) -> EngineResult<()> {
        let point = LatLng {
            lat: update.location.lat,
            lng: update.location.lng,
        };

        if let Some(ride_id) = update.ride_id {
            let ctx = self.persistence.get_ride_context(ride_id).await?;
            let result = self
                .persistence
                .update_ride_location(update.driver_id, ride_id, point)
                .await?;

            self.passenger_hub
                .push(
                    ctx.passenger_id,
                    serde_json::json!({
                        "type": "location_update",
                        "driver_id": update.driver_id,
                        "ride_id": ride_id,
                        "location": { "lat": point.lat, "lng": point.lng },
                        "speed_kmh": update.speed_kmh,
                        "heading_degrees": update.heading_degrees,
                        "timestamp": update.timestamp,
                        "new_fare": result.new_fare,
                        "fare_adjusted": result.fare_adjusted,
                    }),
                )
                .await;
        } else {
            self.persistence.driver_update_location(update.driver_id, point).await?;
        }
        Ok(())
    }

    async fn handle_match_response(&self, response: RideResponseMatch) -> EngineResult<()> {
        if !response.accepted {
            return Ok(());
        }

        let ctx = self.persistence.get_ride_context(response.ride_id).await?;
        let driver = self.persistence.get_driver(response.driver_id).await?;

        let patch = RidePatch {
            driver_id: Some(response.driver_id),
            set_matched_at: true,
            ..Default::default()
        };
        let ride = self
            .persistence
            .transition_ride(
                response.ride_id,
                ctx.status,
                RideStatus::Matched,
                patch,
                crate::domain::RideEventType::DriverMatched,
                serde_json::json!({ "driver_id": response.driver_id }),
            )
            .await?;

        let driver_info = response.driver_info.unwrap_or(DriverInfo {
            driver_id: response.driver_id,
            name: String::new(),
            rating: driver.rating,
            vehicle: driver.vehicle_type.clone(),
        });

        self.passenger_hub
            .push(
                ctx.passenger_id,
                ride_status_frame(
                    &ride.ride_number,
                    response.ride_id,
                    RideStatus::Matched,
                    Some(response.driver_id),
                    Some(driver_info),
                ),
            )
            .await;
        Ok(())
    }
}

fn ride_type_str(ride_type: RideType) -> &'static str {
    match ride_type {
        RideType::Economy => "ECONOMY",
        RideType::Premium => "PREMIUM",
        RideType::Xl => "XL",
    }
}

fn ride_status_frame(
    ride_number: &str,
    ride_id: Uuid,
    status: RideStatus,
    driver_id: Option<Uuid>,
    driver_info: Option<DriverInfo>,
) -> serde_json::Value {
    serde_json::json!({
        "type": "ride_status_update",
        "ride_id": ride_id,
        "ride_number": ride_number,
        "status": status,
        "driver_info": driver_info.map(|d| serde_json::json!({
            "driver_id": d.driver_id,
            "name": d.name,
            "rating": d.rating,
            "vehicle": d.vehicle,
        })).or_else(|| driver_id.map(|id| serde_json::json!({ "driver_id": id }))),
        "correlation_id": Uuid::new_v4(),
    })
}
