//! The authoritative ride/driver transition policy.
//!
//! This module is intentionally pure — it knows the transition table and
//! the driver-status table, but it never touches the database. The
//! transactional compare-and-swap guard that actually serializes concurrent
//! attempts lives in [`crate::persistence`]; this module is what that guard
//! consults before writing.

use crate::domain::{DriverStatus, RideStatus};
use crate::error::EngineError;

/// Returns `Ok(())` if `to` is a legal next state from `from`.
pub fn validate_ride_transition(from: RideStatus, to: RideStatus) -> Result<(), EngineError> {
    use RideStatus::*;

    let allowed = match (from, to) {
        (Requested, Matched) => true,
        (Requested, Cancelled) => true,
        (Matched, EnRoute) => true,
        (Matched, Cancelled) => true,
        (EnRoute, Arrived) => true,
        (Arrived, InProgress) => true,
        (InProgress, Completed) => true,
        // Mid-ride location updates are a self-transition: IN_PROGRESS -> IN_PROGRESS.
        (InProgress, InProgress) => true,
        _ => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition(format!(
            "cannot go from {:?} to {:?}",
            from, to
        )))
    }
}

/// A passenger may cancel any non-terminal ride before it enters IN_PROGRESS.
pub fn validate_passenger_cancel(current: RideStatus) -> Result<(), EngineError> {
    use RideStatus::*;
    match current {
        Requested | Matched => Ok(()),
        other => Err(EngineError::InvalidTransition(format!(
            "cannot cancel a ride in status {:?}",
            other
        ))),
    }
}

/// Driver status transitions.
pub fn validate_driver_transition(from: DriverStatus, to: DriverStatus) -> Result<(), EngineError> {
    use DriverStatus::*;
    let allowed = matches!(
        (from, to),
        (Offline, Available) | (Available, Offline) | (Available, EnRoute) | (EnRoute, Busy) | (Busy, Available)
    );
    if allowed {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition(format!(
            "driver cannot go from {:?} to {:?}",
            from, to
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RideStatus::*;

    #[test]
    fn happy_path_is_fully_reachable() {
        assert!(validate_ride_transition(Requested, Matched).is_ok());
        assert!(validate_ride_transition(Matched, EnRoute).is_ok());
        assert!(validate_ride_transition(EnRoute, Arrived).is_ok());
        assert!(validate_ride_transition(Arrived, InProgress).is_ok());
        assert!(validate_ride_transition(InProgress, Completed).is_ok());
    }

    #[test]
    fn stale_in_progress_after_completed_is_rejected() {
        // A duplicate/late IN_PROGRESS after COMPLETED must fail.
        assert!(validate_ride_transition(Completed, InProgress).is_err());
    }

    #[test]
    fn cancellation_allowed_only_before_in_progress() {
        assert!(validate_passenger_cancel(Requested).is_ok());
        assert!(validate_passenger_cancel(Matched).is_ok());
        assert!(validate_passenger_cancel(InProgress).is_err());
        assert!(validate_passenger_cancel(Completed).is_err());
    }

    #[test]
    fn reachable_state_set_has_exactly_seven_values() {
        // Every state should be reachable from REQUESTED via some chain;
        // nothing outside these seven values participates at all
        // (enforced by the type system, not runtime checks).
        let reachable = [
            Requested, Matched, EnRoute, Arrived, InProgress, Completed, Cancelled,
        ];
        assert_eq!(reachable.len(), 7);
    }

    #[test]
    fn duplicate_transition_is_rejected_not_double_applied() {
        // Submitting MATCHED twice: first call transitions REQUESTED->MATCHED,
        // the second call sees current=MATCHED and must fail.
        assert!(validate_ride_transition(Requested, Matched).is_ok());
        assert!(validate_ride_transition(Matched, Matched).is_err());
    }

    #[test]
    fn driver_transitions_follow_the_offline_available_enroute_busy_cycle() {
        use DriverStatus::*;
        assert!(validate_driver_transition(Offline, Available).is_ok());
        assert!(validate_driver_transition(Available, EnRoute).is_ok());
        assert!(validate_driver_transition(EnRoute, Busy).is_ok());
        assert!(validate_driver_transition(Busy, Available).is_ok());
        assert!(validate_driver_transition(Available, Offline).is_ok());
        assert!(validate_driver_transition(Offline, Busy).is_err());
        assert!(validate_driver_transition(EnRoute, Available).is_err());
    }
}
