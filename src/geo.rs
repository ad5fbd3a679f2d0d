//! Great-circle distance and the fare formula. Deliberately free of
//! routing/ETA/surge-pricing concerns.

use crate::domain::{LatLng, RideType};

const EARTH_RADIUS_KM: f64 = 6371.0;
const AVG_SPEED_KMH: f64 = 40.0;

/// Haversine great-circle distance in kilometers.
pub fn haversine_km(a: LatLng, b: LatLng) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + (d_lng / 2.0).sin().powi(2) * lat1.cos() * lat2.cos();
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// Duration in minutes at the fixed average speed used for estimation.
pub fn duration_minutes(distance_km: f64) -> f64 {
    distance_km / AVG_SPEED_KMH * 60.0
}

#[derive(Debug, Clone, Copy)]
pub struct FareRate {
    pub base: f64,
    pub per_km: f64,
    pub per_min: f64,
    pub priority: i32,
}

/// Unknown ride types already fall back to ECONOMY in
/// [`RideType::parse_or_economy`], so this is total.
pub fn fare_rate(ride_type: RideType) -> FareRate {
    match ride_type {
        RideType::Economy => FareRate {
            base: 500.0,
            per_km: 100.0,
            per_min: 50.0,
            priority: 1,
        },
        RideType::Premium => FareRate {
            base: 800.0,
            per_km: 120.0,
            per_min: 60.0,
            priority: 5,
        },
        RideType::Xl => FareRate {
            base: 1000.0,
            per_km: 150.0,
            per_min: 75.0,
            priority: 10,
        },
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FareEstimate {
    pub distance_km: f64,
    pub duration_minutes: f64,
    pub fare: f64,
}

/// Estimate distance/duration/fare for a ride request.
pub fn estimate_fare(pickup: LatLng, destination: LatLng, ride_type: RideType) -> FareEstimate {
    let distance_km = haversine_km(pickup, destination);
    let duration_minutes = duration_minutes(distance_km);
    let rate = fare_rate(ride_type);
    let fare = rate.base + distance_km * rate.per_km + duration_minutes * rate.per_min;
    FareEstimate {
        distance_km,
        duration_minutes,
        fare,
    }
}

/// Mid-ride fare delta, applied on top of the running fare as a driver's
/// location updates move the passenger further along the route.
///
/// `elapsed_minutes` is the wall-clock time since the previous current
/// coordinate was recorded.
pub fn fare_delta(
    previous: LatLng,
    current: LatLng,
    ride_type: RideType,
    elapsed_minutes: f64,
) -> f64 {
    let rate = fare_rate(ride_type);
    let delta_distance_km = haversine_km(previous, current);
    delta_distance_km * rate.per_km + elapsed_minutes * rate.per_min
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(lat: f64, lng: f64) -> LatLng {
        LatLng { lat, lng }
    }

    #[test]
    fn haversine_identity_is_zero() {
        let a = pt(43.238949, 76.889709);
        assert_eq!(haversine_km(a, a), 0.0);
    }

    #[test]
    fn haversine_is_symmetric() {
        let a = pt(43.238949, 76.889709);
        let b = pt(43.255299, 76.948932);
        assert_eq!(haversine_km(a, b), haversine_km(b, a));
    }

    #[test]
    fn haversine_matches_expected_distance_for_almaty_sample() {
        let a = pt(43.238949, 76.889709);
        let b = pt(43.255299, 76.948932);
        let d = haversine_km(a, b);
        assert!((d - 5.31).abs() < 0.05, "distance was {d}");
    }

    #[test]
    fn fare_of_identical_points_is_base_fare() {
        let a = pt(43.238949, 76.889709);
        for rt in [RideType::Economy, RideType::Premium, RideType::Xl] {
            let est = estimate_fare(a, a, rt);
            assert_eq!(est.fare, fare_rate(rt).base);
        }
    }

    #[test]
    fn economy_estimate_for_a_five_kilometer_ride() {
        let pickup = pt(43.238949, 76.889709);
        let dest = pt(43.255299, 76.948932);
        let est = estimate_fare(pickup, dest, RideType::Economy);
        assert!((est.distance_km - 5.31).abs() < 0.05);
        assert!((est.duration_minutes - 8.0).abs() < 0.5);
        assert!((est.fare - 1431.0).abs() < 5.0);
    }

    #[test]
    fn unknown_ride_type_falls_back_to_economy() {
        assert_eq!(RideType::parse_or_economy("SCOOTER"), RideType::Economy);
    }

    #[test]
    fn mid_ride_fare_delta_combines_distance_and_time() {
        let old = pt(43.25, 76.90);
        let mut new = old;
        // Construct a point ~2.5km away; iterate longitude until close enough,
        // since degrees-per-km vary with latitude.
        new.lng += 2.5 / (111.32 * old.lat.to_radians().cos());
        let delta = fare_delta(old, new, RideType::Economy, 3.0);
        assert!((delta - 400.0).abs() < 10.0, "delta was {delta}");
    }
}
