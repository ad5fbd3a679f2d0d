//! SQLite-backed [`PersistenceGateway`]. Every mutating method opens one
//! transaction and either commits the state change and its event row
//! together or rolls back entirely.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use super::{
    CompleteRideRequest, CreateRideRequest, DriverSessionSummary, LocationUpdateResult, NewUser,
    PersistenceGateway, RidePatch, RideResponse,
};
use crate::domain::{
    Driver, DriverSession, DriverStatus, EntityType, LatLng, Ride, RideContext, RideEventType,
    RideStatus, RideType, User, UserRole, UserStatus,
};
use crate::error::{EngineError, EngineResult};
use crate::geo;
use crate::state_machine;

#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> EngineResult<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| EngineError::UpstreamUnavailable(format!("sqlite connect: {e}")))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| EngineError::Internal(format!("migration failed: {e}")))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(s: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::Internal(format!("bad timestamp {s:?}: {e}")))
}

fn parse_opt_ts(s: Option<String>) -> EngineResult<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}

/// Inserts a new current coordinate row for `(entity_id, entity_type)` and
/// flips the previous current row (if any) to `is_current = false`, within
/// the caller's transaction. Returns the new coordinate id.
async fn upsert_current_coordinate(
    tx: &mut Transaction<'_, Sqlite>,
    entity_id: Uuid,
    entity_type: EntityType,
    point: LatLng,
    address: Option<&str>,
    fare_amount: Option<f64>,
    distance_km: Option<f64>,
    duration_minutes: Option<f64>,
) -> EngineResult<Uuid> {
    sqlx::query(
        "UPDATE coordinates SET is_current = 0, updated_at = ?1
         WHERE entity_id = ?2 AND entity_type = ?3 AND is_current = 1",
    )
    .bind(now_str())
    .bind(entity_id.to_string())
    .bind(entity_type.as_db_str())
    .execute(&mut **tx)
    .await?;

    let new_id = Uuid::new_v4();
    let ts = now_str();
    sqlx::query(
        "INSERT INTO coordinates
            (id, entity_id, entity_type, lat, lng, address, fare_amount, distance_km, duration_minutes, is_current, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10, ?10)",
    )
    .bind(new_id.to_string())
    .bind(entity_id.to_string())
    .bind(entity_type.as_db_str())
    .bind(point.lat)
    .bind(point.lng)
    .bind(address)
    .bind(fare_amount)
    .bind(distance_km)
    .bind(duration_minutes)
    .bind(ts)
    .execute(&mut **tx)
    .await?;

    Ok(new_id)
}

async fn insert_not_current_coordinate(
    tx: &mut Transaction<'_, Sqlite>,
    entity_id: Uuid,
    entity_type: EntityType,
    point: LatLng,
    address: Option<&str>,
) -> EngineResult<Uuid> {
    let new_id = Uuid::new_v4();
    let ts = now_str();
    sqlx::query(
        "INSERT INTO coordinates
            (id, entity_id, entity_type, lat, lng, address, is_current, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)",
    )
    .bind(new_id.to_string())
    .bind(entity_id.to_string())
    .bind(entity_type.as_db_str())
    .bind(point.lat)
    .bind(point.lng)
    .bind(address)
    .bind(ts)
    .execute(&mut **tx)
    .await?;
    Ok(new_id)
}

async fn insert_ride_event(
    tx: &mut Transaction<'_, Sqlite>,
    ride_id: Uuid,
    event_type: RideEventType,
    event_data: &serde_json::Value,
) -> EngineResult<()> {
    sqlx::query(
        "INSERT INTO ride_events (id, ride_id, event_type, event_data, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(ride_id.to_string())
    .bind(event_type.as_db_str())
    .bind(event_data.to_string())
    .bind(now_str())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

struct RideRow {
    id: String,
    ride_number: String,
    passenger_id: String,
    driver_id: Option<String>,
    pickup_coordinate_id: String,
    destination_coordinate_id: String,
    ride_type: String,
    priority: i64,
    estimated_fare: f64,
    final_fare: Option<f64>,
    distance_km: Option<f64>,
    duration_minutes: Option<f64>,
    status: String,
    created_at: String,
    matched_at: Option<String>,
    started_at: Option<String>,
    arrived_at: Option<String>,
    completed_at: Option<String>,
    cancelled_at: Option<String>,
    cancellation_reason: Option<String>,
}

impl RideRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(RideRow {
            id: row.try_get("id")?,
            ride_number: row.try_get("ride_number")?,
            passenger_id: row.try_get("passenger_id")?,
            driver_id: row.try_get("driver_id")?,
            pickup_coordinate_id: row.try_get("pickup_coordinate_id")?,
            destination_coordinate_id: row.try_get("destination_coordinate_id")?,
            ride_type: row.try_get("ride_type")?,
            priority: row.try_get("priority")?,
            estimated_fare: row.try_get("estimated_fare")?,
            final_fare: row.try_get("final_fare")?,
            distance_km: row.try_get("distance_km")?,
            duration_minutes: row.try_get("duration_minutes")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            matched_at: row.try_get("matched_at")?,
            started_at: row.try_get("started_at")?,
            arrived_at: row.try_get("arrived_at")?,
            completed_at: row.try_get("completed_at")?,
            cancelled_at: row.try_get("cancelled_at")?,
            cancellation_reason: row.try_get("cancellation_reason")?,
        })
    }

    fn into_domain(self) -> EngineResult<Ride> {
        Ok(Ride {
            id: Uuid::parse_str(&self.id).map_err(|e| EngineError::Internal(e.to_string()))?,
            ride_number: self.ride_number,
            passenger_id: Uuid::parse_str(&self.passenger_id)
                .map_err(|e| EngineError::Internal(e.to_string()))?,
            driver_id: self
                .driver_id
                .map(|s| Uuid::parse_str(&s))
                .transpose()
                .map_err(|e| EngineError::Internal(e.to_string()))?,
            pickup_coordinate_id: Uuid::parse_str(&self.pickup_coordinate_id)
                .map_err(|e| EngineError::Internal(e.to_string()))?,
            destination_coordinate_id: Uuid::parse_str(&self.destination_coordinate_id)
                .map_err(|e| EngineError::Internal(e.to_string()))?,
            ride_type: RideType::parse_or_economy(&self.ride_type),
            priority: self.priority as i32,
            estimated_fare: self.estimated_fare,
            final_fare: self.final_fare,
            distance_km: self.distance_km,
            duration_minutes: self.duration_minutes,
            status: RideStatus::parse(&self.status)
                .ok_or_else(|| EngineError::Internal(format!("bad status {:?}", self.status)))?,
            created_at: parse_ts(&self.created_at)?,
            matched_at: parse_opt_ts(self.matched_at)?,
            started_at: parse_opt_ts(self.started_at)?,
            arrived_at: parse_opt_ts(self.arrived_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            cancelled_at: parse_opt_ts(self.cancelled_at)?,
            cancellation_reason: self.cancellation_reason,
        })
    }
}

async fn fetch_ride(
    tx: &mut Transaction<'_, Sqlite>,
    ride_id: Uuid,
) -> EngineResult<Ride> {
    let row = sqlx::query("SELECT * FROM rides WHERE id = ?1")
        .bind(ride_id.to_string())
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("ride {ride_id}")))?;
    RideRow::from_row(&row)?.into_domain()
}

#[async_trait]
impl PersistenceGateway for SqlitePersistence {
    async fn create_ride(&self, req: CreateRideRequest) -> EngineResult<RideResponse> {
        let estimate = geo::estimate_fare(req.pickup, req.destination, req.ride_type);
        let rate = geo::fare_rate(req.ride_type);

        let mut tx = self.pool.begin().await?;

        let pickup_id = upsert_current_coordinate(
            &mut tx,
            req.passenger_id,
            EntityType::Passenger,
            req.pickup,
            req.pickup_address.as_deref(),
            Some(estimate.fare),
            Some(estimate.distance_km),
            Some(estimate.duration_minutes),
        )
        .await?;

        let dest_id = insert_not_current_coordinate(
            &mut tx,
            req.passenger_id,
            EntityType::Passenger,
            req.destination,
            req.destination_address.as_deref(),
        )
        .await?;

        let today = Utc::now().format("%Y%m%d").to_string();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM rides WHERE substr(created_at, 1, 10) = substr(?1, 1, 10)",
        )
        .bind(now_str())
        .fetch_one(&mut *tx)
        .await?;
        let ride_number = format!("RIDE_{today}_{:03}", count + 1);

        let ride_id = Uuid::new_v4();
        let ts = now_str();
        sqlx::query(
            "INSERT INTO rides
                (id, ride_number, passenger_id, driver_id, pickup_coordinate_id, destination_coordinate_id,
                 ride_type, priority, estimated_fare, status, created_at)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?7, ?8, 'REQUESTED', ?9)",
        )
        .bind(ride_id.to_string())
        .bind(&ride_number)
        .bind(req.passenger_id.to_string())
        .bind(pickup_id.to_string())
        .bind(dest_id.to_string())
        .bind(req.ride_type.as_db_str())
        .bind(rate.priority)
        .bind(estimate.fare)
        .bind(&ts)
        .execute(&mut *tx)
        .await?;

        let event_data = serde_json::json!({
            "ride_number": ride_number,
            "ride_type": req.ride_type.as_db_str(),
            "estimated_fare": estimate.fare,
        });
        insert_ride_event(&mut tx, ride_id, RideEventType::RideRequested, &event_data).await?;

        tx.commit().await?;

        Ok(RideResponse {
            ride_id,
            ride_number,
            status: RideStatus::Requested,
            estimated_fare: estimate.fare,
            estimated_duration_minutes: estimate.duration_minutes as i64,
            estimated_distance_km: estimate.distance_km,
        })
    }

    async fn get_ride_context(&self, ride_id: Uuid) -> EngineResult<RideContext> {
        let row = sqlx::query(
            "SELECT r.status, r.driver_id, r.passenger_id, r.ride_number, r.ride_type,
                    p.lat AS p_lat, p.lng AS p_lng, d.lat AS d_lat, d.lng AS d_lng
             FROM rides r
             JOIN coordinates p ON p.id = r.pickup_coordinate_id
             JOIN coordinates d ON d.id = r.destination_coordinate_id
             WHERE r.id = ?1",
        )
        .bind(ride_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("ride {ride_id}")))?;

        let status: String = row.try_get("status")?;
        let driver_id: Option<String> = row.try_get("driver_id")?;
        let passenger_id: String = row.try_get("passenger_id")?;

        Ok(RideContext {
            ride_id,
            status: RideStatus::parse(&status)
                .ok_or_else(|| EngineError::Internal(format!("bad status {status:?}")))?,
            driver_id: driver_id
                .map(|s| Uuid::parse_str(&s))
                .transpose()
                .map_err(|e| EngineError::Internal(e.to_string()))?,
            passenger_id: Uuid::parse_str(&passenger_id)
                .map_err(|e| EngineError::Internal(e.to_string()))?,
            pickup: LatLng {
                lat: row.try_get("p_lat")?,
                lng: row.try_get("p_lng")?,
            },
            destination: LatLng {
                lat: row.try_get("d_lat")?,
                lng: row.try_get("d_lng")?,
            },
            ride_number: row.try_get("ride_number")?,
            ride_type: RideType::parse_or_economy(row.try_get::<String, _>("ride_type")?.as_str()),
        })
    }

    async fn transition_ride(
        &self,
        ride_id: Uuid,
        expected_from: RideStatus,
        to: RideStatus,
        patch: RidePatch,
        event: RideEventType,
        event_data: serde_json::Value,
    ) -> EngineResult<Ride> {
        state_machine::validate_ride_transition(expected_from, to)?;

        let mut tx = self.pool.begin().await?;

        let current_status: String =
            sqlx::query_scalar("SELECT status FROM rides WHERE id = ?1")
                .bind(ride_id.to_string())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("ride {ride_id}")))?;

        if current_status != expected_from.as_db_str() {
            return Err(EngineError::InvalidTransition(format!(
                "ride {ride_id} is {current_status}, expected {}",
                expected_from.as_db_str()
            )));
        }

        let ts = now_str();
        let mut qb = sqlx::QueryBuilder::new("UPDATE rides SET status = ");
        qb.push_bind(to.as_db_str());

        if let Some(driver_id) = patch.driver_id {
            qb.push(", driver_id = ").push_bind(driver_id.to_string());
        }
        if patch.set_matched_at {
            qb.push(", matched_at = ").push_bind(ts.clone());
        }
        if patch.set_started_at {
            qb.push(", started_at = ").push_bind(ts.clone());
        }
        if patch.set_arrived_at {
            qb.push(", arrived_at = ").push_bind(ts.clone());
        }
        if patch.set_completed_at {
            qb.push(", completed_at = ").push_bind(ts.clone());
        }
        if patch.set_cancelled_at {
            qb.push(", cancelled_at = ").push_bind(ts.clone());
        }
        if let Some(reason) = &patch.cancellation_reason {
            qb.push(", cancellation_reason = ").push_bind(reason.clone());
        }
        if let Some(fare) = patch.final_fare {
            qb.push(", final_fare = ").push_bind(fare);
        }
        if let Some(distance_km) = patch.distance_km {
            qb.push(", distance_km = ").push_bind(distance_km);
        }
        if let Some(duration_minutes) = patch.duration_minutes {
            qb.push(", duration_minutes = ").push_bind(duration_minutes);
        }

        qb.push(" WHERE id = ")
            .push_bind(ride_id.to_string())
            .push(" AND status = ")
            .push_bind(expected_from.as_db_str());

        let result = qb.build().execute(&mut *tx).await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::InvalidTransition(format!(
                "ride {ride_id} changed status concurrently"
            )));
        }

        insert_ride_event(&mut tx, ride_id, event, &event_data).await?;

        if let Some(flip) = &patch.flip_driver {
            let driver_status: String =
                sqlx::query_scalar("SELECT status FROM drivers WHERE id = ?1")
                    .bind(flip.driver_id.to_string())
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(format!("driver {}", flip.driver_id)))?;
            let current = DriverStatus::parse(&driver_status).ok_or_else(|| {
                EngineError::Internal(format!("unknown driver status {driver_status}"))
            })?;
            state_machine::validate_driver_transition(current, flip.to)?;

            sqlx::query("UPDATE drivers SET status = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(flip.to.as_db_str())
                .bind(ts.clone())
                .bind(flip.driver_id.to_string())
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "INSERT INTO location_history (id, driver_id, ride_id, lat, lng, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(flip.driver_id.to_string())
            .bind(ride_id.to_string())
            .bind(flip.location.lat)
            .bind(flip.location.lng)
            .bind(ts.clone())
            .execute(&mut *tx)
            .await?;
        }

        let ride = fetch_ride(&mut tx, ride_id).await?;
        tx.commit().await?;
        Ok(ride)
    }

    async fn update_ride_location(
        &self,
        driver_id: Uuid,
        ride_id: Uuid,
        new_point: LatLng,
    ) -> EngineResult<LocationUpdateResult> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT status, driver_id, passenger_id, ride_type, estimated_fare
             FROM rides WHERE id = ?1",
        )
        .bind(ride_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("ride {ride_id}")))?;

        let status: String = row.try_get("status")?;
        if status != RideStatus::InProgress.as_db_str() {
            return Err(EngineError::InvalidTransition(format!(
                "ride {ride_id} is {status}, not IN_PROGRESS"
            )));
        }
        let ride_driver_id: Option<String> = row.try_get("driver_id")?;
        if ride_driver_id.as_deref() != Some(driver_id.to_string().as_str()) {
            return Err(EngineError::AuthFailed(
                "driver is not assigned to this ride".into(),
            ));
        }
        let passenger_id: Uuid = Uuid::parse_str(&row.try_get::<String, _>("passenger_id")?)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        let ride_type = RideType::parse_or_economy(row.try_get::<String, _>("ride_type")?.as_str());
        let estimated_fare: f64 = row.try_get("estimated_fare")?;

        let prev = sqlx::query(
            "SELECT lat, lng, updated_at, fare_amount, distance_km, duration_minutes
             FROM coordinates WHERE entity_id = ?1 AND entity_type = 'passenger' AND is_current = 1",
        )
        .bind(passenger_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EngineError::NotFound("passenger has no current coordinate".into()))?;

        let prev_point = LatLng {
            lat: prev.try_get("lat")?,
            lng: prev.try_get("lng")?,
        };
        let prev_updated_at = parse_ts(&prev.try_get::<String, _>("updated_at")?)?;
        let prev_fare: f64 = prev.try_get::<Option<f64>, _>("fare_amount")?.unwrap_or(estimated_fare);
        let prev_distance: f64 = prev.try_get::<Option<f64>, _>("distance_km")?.unwrap_or(0.0);
        let prev_duration: f64 = prev.try_get::<Option<f64>, _>("duration_minutes")?.unwrap_or(0.0);

        let elapsed_minutes = (Utc::now() - prev_updated_at).num_milliseconds() as f64 / 60_000.0;
        let delta = geo::fare_delta(prev_point, new_point, ride_type, elapsed_minutes.max(0.0));
        let new_fare = prev_fare + delta;
        let new_distance = prev_distance + geo::haversine_km(prev_point, new_point);
        let new_duration = prev_duration + elapsed_minutes.max(0.0);

        upsert_current_coordinate(
            &mut tx,
            passenger_id,
            EntityType::Passenger,
            new_point,
            None,
            Some(new_fare),
            Some(new_distance),
            Some(new_duration),
        )
        .await?;

        sqlx::query("UPDATE rides SET final_fare = ?1, distance_km = ?2, duration_minutes = ?3 WHERE id = ?4")
            .bind(new_fare)
            .bind(new_distance)
            .bind(new_duration)
            .bind(ride_id.to_string())
            .execute(&mut *tx)
            .await?;

        insert_ride_event(
            &mut tx,
            ride_id,
            RideEventType::LocationUpdated,
            &serde_json::json!({ "lat": new_point.lat, "lng": new_point.lng, "new_fare": new_fare }),
        )
        .await?;

        let fare_adjusted = new_fare > estimated_fare;
        if fare_adjusted {
            insert_ride_event(
                &mut tx,
                ride_id,
                RideEventType::FareAdjusted,
                &serde_json::json!({ "delta": new_fare - estimated_fare }),
            )
            .await?;
        }

        tx.commit().await?;

        Ok(LocationUpdateResult {
            old_fare_estimate: estimated_fare,
            new_fare,
            fare_adjusted,
        })
    }

    async fn driver_go_online(&self, driver_id: Uuid, loc: LatLng) -> EngineResult<Uuid> {
        let mut tx = self.pool.begin().await?;

        let current: String = sqlx::query_scalar("SELECT status FROM drivers WHERE id = ?1")
            .bind(driver_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("driver {driver_id}")))?;
        let current = DriverStatus::parse(&current)
            .ok_or_else(|| EngineError::Internal(format!("bad driver status {current:?}")))?;
        state_machine::validate_driver_transition(current, DriverStatus::Available)?;

        sqlx::query("UPDATE drivers SET status = 'AVAILABLE', updated_at = ?1 WHERE id = ?2")
            .bind(now_str())
            .bind(driver_id.to_string())
            .execute(&mut *tx)
            .await?;

        let session_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO driver_sessions (id, driver_id, started_at) VALUES (?1, ?2, ?3)",
        )
        .bind(session_id.to_string())
        .bind(driver_id.to_string())
        .bind(now_str())
        .execute(&mut *tx)
        .await?;

        upsert_current_coordinate(
            &mut tx,
            driver_id,
            EntityType::Driver,
            loc,
            None,
            None,
            None,
            None,
        )
        .await?;

        sqlx::query(
            "INSERT INTO location_history (id, driver_id, lat, lng, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(driver_id.to_string())
        .bind(loc.lat)
        .bind(loc.lng)
        .bind(now_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(session_id)
    }

    async fn driver_go_offline(&self, driver_id: Uuid) -> EngineResult<DriverSessionSummary> {
        let mut tx = self.pool.begin().await?;

        let current: String = sqlx::query_scalar("SELECT status FROM drivers WHERE id = ?1")
            .bind(driver_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("driver {driver_id}")))?;
        let current = DriverStatus::parse(&current)
            .ok_or_else(|| EngineError::Internal(format!("bad driver status {current:?}")))?;
        state_machine::validate_driver_transition(current, DriverStatus::Offline)?;

        sqlx::query("UPDATE drivers SET status = 'OFFLINE', updated_at = ?1 WHERE id = ?2")
            .bind(now_str())
            .bind(driver_id.to_string())
            .execute(&mut *tx)
            .await?;

        let session_id: String = sqlx::query_scalar(
            "SELECT id FROM driver_sessions WHERE driver_id = ?1 AND ended_at IS NULL",
        )
        .bind(driver_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EngineError::Internal("driver has no open session".into()))?;

        sqlx::query("UPDATE driver_sessions SET ended_at = ?1 WHERE id = ?2")
            .bind(now_str())
            .bind(&session_id)
            .execute(&mut *tx)
            .await?;

        let session_id = Uuid::parse_str(&session_id).map_err(|e| EngineError::Internal(e.to_string()))?;
        let summary = fetch_session_summary(&mut tx, session_id).await?;
        tx.commit().await?;
        Ok(summary)
    }

    async fn driver_session_summary(&self, session_id: Uuid) -> EngineResult<DriverSessionSummary> {
        let mut tx = self.pool.begin().await?;
        let summary = fetch_session_summary(&mut tx, session_id).await?;
        tx.commit().await?;
        Ok(summary)
    }

    async fn driver_update_location(&self, driver_id: Uuid, loc: LatLng) -> EngineResult<Uuid> {
        let mut tx = self.pool.begin().await?;

        upsert_current_coordinate(
            &mut tx,
            driver_id,
            EntityType::Driver,
            loc,
            None,
            None,
            None,
            None,
        )
        .await?;

        let history_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO location_history (id, driver_id, lat, lng, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(history_id.to_string())
        .bind(driver_id.to_string())
        .bind(loc.lat)
        .bind(loc.lng)
        .bind(now_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(history_id)
    }

    async fn driver_complete_ride(
        &self,
        driver_id: Uuid,
        req: CompleteRideRequest,
    ) -> EngineResult<f64> {
        let mut tx = self.pool.begin().await?;

        let driver_status: String = sqlx::query_scalar("SELECT status FROM drivers WHERE id = ?1")
            .bind(driver_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("driver {driver_id}")))?;
        if driver_status != DriverStatus::Busy.as_db_str() {
            return Err(EngineError::InvalidTransition(
                "driver is not BUSY".into(),
            ));
        }

        let row = sqlx::query("SELECT status, driver_id, passenger_id FROM rides WHERE id = ?1")
            .bind(req.ride_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("ride {}", req.ride_id)))?;

        let ride_status: String = row.try_get("status")?;
        let ride_driver_id: Option<String> = row.try_get("driver_id")?;
        let passenger_id: Uuid = Uuid::parse_str(&row.try_get::<String, _>("passenger_id")?)
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        if ride_driver_id.as_deref() != Some(driver_id.to_string().as_str()) {
            return Err(EngineError::AuthFailed(
                "driver is not assigned to this ride".into(),
            ));
        }
        if ride_status != RideStatus::InProgress.as_db_str() {
            return Err(EngineError::InvalidTransition(format!(
                "ride is {ride_status}, not IN_PROGRESS"
            )));
        }

        let final_fare: f64 = sqlx::query_scalar(
            "SELECT fare_amount FROM coordinates WHERE entity_id = ?1 AND entity_type = 'passenger' AND is_current = 1",
        )
        .bind(passenger_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .flatten()
        .unwrap_or(0.0);

        sqlx::query("UPDATE drivers SET status = 'AVAILABLE', updated_at = ?1 WHERE id = ?2")
            .bind(now_str())
            .bind(driver_id.to_string())
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE rides SET status = 'COMPLETED', completed_at = ?1, final_fare = ?2, distance_km = ?3, duration_minutes = ?4
             WHERE id = ?5 AND status = 'IN_PROGRESS'",
        )
        .bind(now_str())
        .bind(final_fare)
        .bind(req.actual_distance_km)
        .bind(req.actual_duration_minutes)
        .bind(req.ride_id.to_string())
        .execute(&mut *tx)
        .await?;

        insert_ride_event(
            &mut tx,
            req.ride_id,
            RideEventType::RideCompleted,
            &serde_json::json!({ "final_fare": final_fare, "driver_id": driver_id }),
        )
        .await?;

        sqlx::query(
            "INSERT INTO location_history (id, driver_id, ride_id, lat, lng, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(driver_id.to_string())
        .bind(req.ride_id.to_string())
        .bind(req.final_location.lat)
        .bind(req.final_location.lng)
        .bind(now_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE driver_sessions SET total_rides = total_rides + 1, total_earnings = total_earnings + ?1
             WHERE driver_id = ?2 AND ended_at IS NULL",
        )
        .bind(final_fare)
        .bind(driver_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(final_fare)
    }

    async fn get_driver(&self, driver_id: Uuid) -> EngineResult<Driver> {
        let row = sqlx::query(
            "SELECT id, license, vehicle_type, vehicle_attrs, rating, status FROM drivers WHERE id = ?1",
        )
        .bind(driver_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("driver {driver_id}")))?;

        let vehicle_attrs: String = row.try_get("vehicle_attrs")?;
        let status: String = row.try_get("status")?;
        Ok(Driver {
            id: driver_id,
            license: row.try_get("license")?,
            vehicle_type: row.try_get("vehicle_type")?,
            vehicle_attrs: serde_json::from_str(&vehicle_attrs).unwrap_or(serde_json::Value::Null),
            rating: row.try_get("rating")?,
            status: DriverStatus::parse(&status)
                .ok_or_else(|| EngineError::Internal(format!("bad driver status {status:?}")))?,
        })
    }

    async fn get_driver_session(&self, session_id: Uuid) -> EngineResult<DriverSession> {
        let row = sqlx::query(
            "SELECT id, driver_id, started_at, ended_at, total_rides, total_earnings
             FROM driver_sessions WHERE id = ?1",
        )
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;

        Ok(DriverSession {
            id: session_id,
            driver_id: Uuid::parse_str(&row.try_get::<String, _>("driver_id")?)
                .map_err(|e| EngineError::Internal(e.to_string()))?,
            started_at: parse_ts(&row.try_get::<String, _>("started_at")?)?,
            ended_at: parse_opt_ts(row.try_get("ended_at")?)?,
            total_rides: row.try_get("total_rides")?,
            total_earnings: row.try_get("total_earnings")?,
        })
    }

    async fn register_user(&self, user: NewUser) -> EngineResult<Uuid> {
        if user.role == UserRole::Driver && user.driver_profile.is_none() {
            return Err(EngineError::InvalidInput(
                "driver registration requires a vehicle profile".into(),
            ));
        }

        let id = Uuid::new_v4();
        let role = match user.role {
            UserRole::Passenger => "PASSENGER",
            UserRole::Driver => "DRIVER",
            UserRole::Admin => "ADMIN",
        };

        let mut tx = self.pool.begin().await?;

        let insert_user = sqlx::query(
            "INSERT INTO users (id, name, email, role, status, password_hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'ACTIVE', ?5, ?6, ?6)",
        )
        .bind(id.to_string())
        .bind(&user.name)
        .bind(&user.email)
        .bind(role)
        .bind(&user.password_hash)
        .bind(now_str())
        .execute(&mut *tx)
        .await;

        if let Err(e) = insert_user {
            return Err(match e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    EngineError::Conflict(format!("email {} already registered", user.email))
                }
                other => EngineError::from(other),
            });
        }

        if let Some(profile) = &user.driver_profile {
            sqlx::query(
                "INSERT INTO drivers (id, license, vehicle_type, vehicle_attrs, rating, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 5.0, 'OFFLINE', ?5)",
            )
            .bind(id.to_string())
            .bind(&profile.license)
            .bind(&profile.vehicle_type)
            .bind(profile.vehicle_attrs.to_string())
            .bind(now_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    async fn find_user_by_email(&self, email: &str) -> EngineResult<User> {
        let row = sqlx::query(
            "SELECT id, name, email, role, status, password_hash FROM users WHERE email = ?1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("user {email}")))?;

        let role: String = row.try_get("role")?;
        let status: String = row.try_get("status")?;
        Ok(User {
            id: Uuid::parse_str(&row.try_get::<String, _>("id")?)
                .map_err(|e| EngineError::Internal(e.to_string()))?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            role: match role.as_str() {
                "DRIVER" => UserRole::Driver,
                "ADMIN" => UserRole::Admin,
                _ => UserRole::Passenger,
            },
            status: match status.as_str() {
                "BANNED" => UserStatus::Banned,
                _ => UserStatus::Active,
            },
            password_hash: row.try_get("password_hash")?,
        })
    }
}

async fn fetch_session_summary(
    tx: &mut Transaction<'_, Sqlite>,
    session_id: Uuid,
) -> EngineResult<DriverSessionSummary> {
    let row = sqlx::query(
        "SELECT started_at, ended_at, total_rides, total_earnings FROM driver_sessions WHERE id = ?1",
    )
    .bind(session_id.to_string())
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;

    let started_at = parse_ts(&row.try_get::<String, _>("started_at")?)?;
    let ended_at = parse_opt_ts(row.try_get("ended_at")?)?.unwrap_or_else(Utc::now);
    let duration_hours = (ended_at - started_at).num_seconds() as f64 / 3600.0;

    Ok(DriverSessionSummary {
        session_id,
        duration_hours,
        rides_completed: row.try_get("total_rides")?,
        earnings: row.try_get("total_earnings")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::NewDriverProfile;

    async fn setup() -> SqlitePersistence {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        SqlitePersistence::new(pool)
    }

    async fn register_passenger(db: &SqlitePersistence, email: &str) -> Uuid {
        db.register_user(NewUser {
            name: "Ada".into(),
            email: email.into(),
            role: UserRole::Passenger,
            password_hash: "hash".into(),
            driver_profile: None,
        })
        .await
        .unwrap()
    }

    async fn register_driver(db: &SqlitePersistence, email: &str) -> Uuid {
        db.register_user(NewUser {
            name: "Bob".into(),
            email: email.into(),
            role: UserRole::Driver,
            password_hash: "hash".into(),
            driver_profile: Some(NewDriverProfile {
                license: "LIC-1".into(),
                vehicle_type: "sedan".into(),
                vehicle_attrs: serde_json::json!({ "plate": "01ABC02" }),
            }),
        })
        .await
        .unwrap()
    }

    fn almaty() -> LatLng {
        LatLng { lat: 43.238949, lng: 76.889709 }
    }

    fn almaty_plus() -> LatLng {
        LatLng { lat: 43.255299, lng: 76.948932 }
    }

    #[tokio::test]
    async fn register_user_rejects_driver_without_vehicle_profile() {
        let db = setup().await;
        let err = db
            .register_user(NewUser {
                name: "No Vehicle".into(),
                email: "novehicle@example.com".into(),
                role: UserRole::Driver,
                password_hash: "hash".into(),
                driver_profile: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn duplicate_email_registration_conflicts() {
        let db = setup().await;
        register_passenger(&db, "dup@example.com").await;
        let err = db
            .register_user(NewUser {
                name: "Someone Else".into(),
                email: "dup@example.com".into(),
                role: UserRole::Passenger,
                password_hash: "hash".into(),
                driver_profile: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn create_ride_then_full_transition_chain_to_completed() {
        let db = setup().await;
        let passenger_id = register_passenger(&db, "passenger@example.com").await;
        let driver_id = register_driver(&db, "driver@example.com").await;
        db.driver_go_online(driver_id, almaty()).await.unwrap();

        let response = db
            .create_ride(CreateRideRequest {
                passenger_id,
                pickup: almaty(),
                pickup_address: Some("Dostyk Ave".into()),
                destination: almaty_plus(),
                destination_address: Some("Abay Ave".into()),
                ride_type: RideType::Economy,
            })
            .await
            .unwrap();
        assert_eq!(response.status, RideStatus::Requested);

        let matched = db
            .transition_ride(
                response.ride_id,
                RideStatus::Requested,
                RideStatus::Matched,
                RidePatch {
                    driver_id: Some(driver_id),
                    set_matched_at: true,
                    ..Default::default()
                },
                RideEventType::DriverMatched,
                serde_json::json!({ "driver_id": driver_id }),
            )
            .await
            .unwrap();
        assert_eq!(matched.status, RideStatus::Matched);
        assert_eq!(matched.driver_id, Some(driver_id));

        db.transition_ride(
            response.ride_id,
            RideStatus::Matched,
            RideStatus::EnRoute,
            RidePatch {
                flip_driver: Some(crate::persistence::DriverFlip {
                    driver_id,
                    to: DriverStatus::EnRoute,
                    location: almaty(),
                }),
                ..Default::default()
            },
            RideEventType::DriverMatched,
            serde_json::json!({}),
        )
        .await
        .unwrap();
        assert_eq!(db.get_driver(driver_id).await.unwrap().status, DriverStatus::EnRoute);

        db.transition_ride(
            response.ride_id,
            RideStatus::EnRoute,
            RideStatus::Arrived,
            RidePatch {
                set_arrived_at: true,
                ..Default::default()
            },
            RideEventType::DriverArrived,
            serde_json::json!({}),
        )
        .await
        .unwrap();

        db.transition_ride(
            response.ride_id,
            RideStatus::Arrived,
            RideStatus::InProgress,
            RidePatch {
                set_started_at: true,
                flip_driver: Some(crate::persistence::DriverFlip {
                    driver_id,
                    to: DriverStatus::Busy,
                    location: almaty_plus(),
                }),
                ..Default::default()
            },
            RideEventType::RideStarted,
            serde_json::json!({}),
        )
        .await
        .unwrap();
        assert_eq!(db.get_driver(driver_id).await.unwrap().status, DriverStatus::Busy);

        let final_fare = db
            .driver_complete_ride(
                driver_id,
                CompleteRideRequest {
                    ride_id: response.ride_id,
                    final_location: almaty_plus(),
                    actual_distance_km: 5.3,
                    actual_duration_minutes: 9.0,
                },
            )
            .await
            .unwrap();
        assert!(final_fare > 0.0);

        let driver = db.get_driver(driver_id).await.unwrap();
        assert_eq!(driver.status, DriverStatus::Available);
    }

    #[tokio::test]
    async fn transition_ride_rejects_stale_expected_status() {
        let db = setup().await;
        let passenger_id = register_passenger(&db, "stale@example.com").await;
        let response = db
            .create_ride(CreateRideRequest {
                passenger_id,
                pickup: almaty(),
                pickup_address: None,
                destination: almaty_plus(),
                destination_address: None,
                ride_type: RideType::Economy,
            })
            .await
            .unwrap();

        let err = db
            .transition_ride(
                response.ride_id,
                RideStatus::Matched,
                RideStatus::EnRoute,
                RidePatch::default(),
                RideEventType::DriverMatched,
                serde_json::json!({}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn driver_online_then_offline_produces_session_summary() {
        let db = setup().await;
        let driver_id = register_driver(&db, "sessions@example.com").await;

        let session_id = db.driver_go_online(driver_id, almaty()).await.unwrap();
        db.driver_update_location(driver_id, almaty_plus()).await.unwrap();

        let summary = db.driver_go_offline(driver_id).await.unwrap();
        assert_eq!(summary.session_id, session_id);
        assert_eq!(summary.rides_completed, 0);
    }

    #[tokio::test]
    async fn double_go_online_is_rejected_by_driver_state_machine() {
        let db = setup().await;
        let driver_id = register_driver(&db, "double-online@example.com").await;
        db.driver_go_online(driver_id, almaty()).await.unwrap();
        let err = db.driver_go_online(driver_id, almaty()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
    }
}
