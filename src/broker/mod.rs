//! Broker gateway: durable pub/sub over a topic-based message bus, with
//! auto-reconnect and typed consumer events forwarded to the orchestrator.

mod rabbit;
pub mod types;

pub use rabbit::RabbitBroker;
pub use types::{BrokerEvent, Coordinates, DriverLocationUpdate, DriverInfo, RideRequestRabbit, RideResponseMatch, RideStatusUpdate};

use async_trait::async_trait;

use crate::error::EngineResult;

/// The capability the orchestrator depends on for publishing and acking.
/// `RabbitBroker` is the only implementation; the trait exists so the
/// orchestrator's construction and tests don't need a live broker.
///
/// The receiving half of the consumer-event channel is not part of this
/// trait: it is returned once, directly, from [`RabbitBroker::connect`],
/// since an `mpsc::Receiver` cannot be duplicated behind `&self`.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Publishes a ride offer on `ride_topic` with routing key
    /// `ride.request.<ride_type>` and the given AMQP priority.
    async fn publish_ride_request(
        &self,
        priority: u8,
        request: RideRequestRabbit,
    ) -> EngineResult<()>;

    /// Publishes a driver-originated status notification on `ride_topic`
    /// with routing key `ride.status.<status>`. The driver-service HTTP
    /// surface funnels through here rather than calling transitions
    /// directly, so a status change looks identical to the orchestrator
    /// whether it arrived over HTTP or over the bus.
    async fn publish_ride_status(&self, update: RideStatusUpdate) -> EngineResult<()>;

    /// Acks a manual-ack delivery (match responses) after the caller's
    /// transition has committed.
    async fn ack(&self, delivery: lapin::message::Delivery) -> EngineResult<()>;
}
