use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use super::types::{BrokerEvent, DriverLocationUpdate, RideRequestRabbit, RideResponseMatch, RideStatusUpdate};
use super::BrokerGateway;
use crate::error::{EngineError, EngineResult};
use crate::metrics::ReconnectTracker;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);
const EVENT_CHANNEL_DEPTH: usize = 256;

/// Lapin-backed [`BrokerGateway`]. Holds a swappable publish channel so a
/// reconnect can replace it under concurrent publishers without them seeing
/// a torn connection.
pub struct RabbitBroker {
    amqp_url: String,
    channel: RwLock<lapin::Channel>,
    reconnects: ReconnectTracker,
}

impl RabbitBroker {
    /// Connects, declares the full topology, starts the three consumer
    /// loops (status, location, match-response), and spawns the background
    /// reconnect watcher. Returns the gateway plus the receiving half of the
    /// event channel the orchestrator reads from.
    pub async fn connect(amqp_url: &str) -> EngineResult<(Arc<Self>, mpsc::Receiver<BrokerEvent>)> {
        let (conn, channel, closed) = dial(amqp_url).await?;
        declare_topology(&channel).await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);

        let broker = Arc::new(Self {
            amqp_url: amqp_url.to_string(),
            channel: RwLock::new(channel.clone()),
            reconnects: ReconnectTracker::new(),
        });

        spawn_consumers(channel, tx.clone()).await?;
        spawn_reconnect_watcher(broker.clone(), conn, closed, tx);

        Ok((broker, rx))
    }
}

/// Fires once when lapin's internal reactor observes the connection drop,
/// whether from a network error or a clean server-initiated close.
struct CloseSignal(tokio::sync::oneshot::Receiver<()>);

impl CloseSignal {
    async fn wait(self) {
        let _ = self.0.await;
    }
}

async fn dial(amqp_url: &str) -> EngineResult<(Connection, lapin::Channel, CloseSignal)> {
    let conn = Connection::connect(amqp_url, ConnectionProperties::default())
        .await
        .map_err(|e| EngineError::UpstreamUnavailable(format!("amqp connect: {e}")))?;

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    let close_tx = std::sync::Mutex::new(Some(close_tx));
    conn.on_error(move |_err| {
        if let Some(tx) = close_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    });

    let channel = conn
        .create_channel()
        .await
        .map_err(|e| EngineError::UpstreamUnavailable(format!("amqp channel: {e}")))?;
    Ok((conn, channel, CloseSignal(close_rx)))
}

async fn declare_topology(channel: &lapin::Channel) -> EngineResult<()> {
    channel
        .exchange_declare(
            "ride_topic",
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| EngineError::UpstreamUnavailable(format!("declare ride_topic: {e}")))?;

    channel
        .exchange_declare(
            "driver_topic",
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| EngineError::UpstreamUnavailable(format!("declare driver_topic: {e}")))?;

    channel
        .exchange_declare(
            "location_fanout",
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| EngineError::UpstreamUnavailable(format!("declare location_fanout: {e}")))?;

    channel
        .exchange_declare(
            "notifications_fanout",
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| EngineError::UpstreamUnavailable(format!("declare notifications_fanout: {e}")))?;

    channel
        .queue_declare(
            "ride_requests",
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| EngineError::UpstreamUnavailable(format!("declare ride_requests: {e}")))?;
    channel
        .queue_bind(
            "ride_requests",
            "ride_topic",
            "ride.request.*",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| EngineError::UpstreamUnavailable(format!("bind ride_requests: {e}")))?;

    let ride_status = channel
        .queue_declare(
            "ride_status",
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| EngineError::UpstreamUnavailable(format!("declare ride_status: {e}")))?;
    channel
        .queue_bind(
            ride_status.name().as_str(),
            "ride_topic",
            "ride.status.*",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| EngineError::UpstreamUnavailable(format!("bind ride_status: {e}")))?;

    let driver_responses = channel
        .queue_declare(
            "driver_responses",
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| EngineError::UpstreamUnavailable(format!("declare driver_responses: {e}")))?;
    channel
        .queue_bind(
            driver_responses.name().as_str(),
            "driver_topic",
            "driver.response.*",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| EngineError::UpstreamUnavailable(format!("bind driver_responses: {e}")))?;

    let location_queue = channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| EngineError::UpstreamUnavailable(format!("declare location queue: {e}")))?;
    channel
        .queue_bind(
            location_queue.name().as_str(),
            "location_fanout",
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| EngineError::UpstreamUnavailable(format!("bind location queue: {e}")))?;

    Ok(())
}

async fn spawn_consumers(channel: lapin::Channel, tx: mpsc::Sender<BrokerEvent>) -> EngineResult<()> {
    spawn_status_consumer(&channel, tx.clone()).await?;
    spawn_location_consumer(&channel, tx.clone()).await?;
    spawn_match_response_consumer(&channel, tx).await?;
    Ok(())
}

async fn spawn_status_consumer(channel: &lapin::Channel, tx: mpsc::Sender<BrokerEvent>) -> EngineResult<()> {
    let mut consumer = channel
        .basic_consume(
            "ride_status",
            "ride-engine.status",
            BasicConsumeOptions {
                no_ack: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| EngineError::UpstreamUnavailable(format!("consume ride_status: {e}")))?;

    tokio::spawn(async move {
        while let Some(delivery) = consumer.next().await {
            let Ok(delivery) = delivery else { continue };
            match serde_json::from_slice::<RideStatusUpdate>(&delivery.data) {
                Ok(update) => {
                    if tx.send(BrokerEvent::Status(update)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "dropping malformed ride_status frame"),
            }
        }
    });
    Ok(())
}

async fn spawn_location_consumer(channel: &lapin::Channel, tx: mpsc::Sender<BrokerEvent>) -> EngineResult<()> {
    let queues = channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| EngineError::UpstreamUnavailable(format!("declare location consumer queue: {e}")))?;

    let mut consumer = channel
        .basic_consume(
            queues.name().as_str(),
            "ride-engine.location",
            BasicConsumeOptions {
                no_ack: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| EngineError::UpstreamUnavailable(format!("consume location queue: {e}")))?;

    tokio::spawn(async move {
        while let Some(delivery) = consumer.next().await {
            let Ok(delivery) = delivery else { continue };
            match serde_json::from_slice::<DriverLocationUpdate>(&delivery.data) {
                Ok(update) => {
                    if tx.send(BrokerEvent::Location(update)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "dropping malformed location frame"),
            }
        }
    });
    Ok(())
}

async fn spawn_match_response_consumer(
    channel: &lapin::Channel,
    tx: mpsc::Sender<BrokerEvent>,
) -> EngineResult<()> {
    let mut consumer = channel
        .basic_consume(
            "driver_responses",
            "ride-engine.match-response",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| EngineError::UpstreamUnavailable(format!("consume driver_responses: {e}")))?;

    tokio::spawn(async move {
        while let Some(delivery) = consumer.next().await {
            let Ok(delivery) = delivery else { continue };
            match serde_json::from_slice::<RideResponseMatch>(&delivery.data) {
                Ok(matched) => {
                    if tx.send(BrokerEvent::MatchResponse(matched, delivery)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "dropping malformed match-response frame");
                    let _ = delivery.ack(BasicAckOptions::default()).await;
                }
            }
        }
    });
    Ok(())
}

/// Watches the connection for a close notification and reconnects with a
/// fixed 3-second backoff, redeclaring the whole topology and re-spawning
/// consumers each time. In-flight unacked messages the bus redelivers after
/// a reconnect are safe: the ride state machine's transition guard absorbs
/// duplicates.
fn spawn_reconnect_watcher(
    broker: Arc<RabbitBroker>,
    conn: Connection,
    closed: CloseSignal,
    tx: mpsc::Sender<BrokerEvent>,
) {
    tokio::spawn(async move {
        // Kept alive only so the connection isn't dropped out from under the
        // channels it owns; replaced wholesale on every reconnect.
        let mut conn = conn;
        let mut closed = closed;
        loop {
            closed.wait().await;
            if tx.is_closed() {
                return;
            }
            warn!("rabbitMQ not working");

            loop {
                info!("trying to connect to rabbitmq");
                match dial(&broker.amqp_url).await {
                    Ok((new_conn, new_channel, new_closed)) => match declare_topology(&new_channel).await {
                        Ok(()) => match spawn_consumers(new_channel.clone(), tx.clone()).await {
                            Ok(()) => {
                                *broker.channel.write().await = new_channel;
                                conn = new_conn;
                                closed = new_closed;
                                broker.reconnects.record_reconnect().await;
                                let stats = broker.reconnects.stats().await;
                                info!(
                                    total_reconnects = stats.total_reconnects,
                                    reconnects_last_hour = stats.reconnects_last_hour,
                                    "connected to rabbitmq"
                                );
                                break;
                            }
                            Err(e) => error!(error = %e, "failed to re-attach consumers"),
                        },
                        Err(e) => error!(error = %e, "failed to redeclare topology"),
                    },
                    Err(e) => error!(error = %e, "failed to reconnect to rabbitmq"),
                }
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        }
    });
}

#[async_trait]
impl BrokerGateway for RabbitBroker {
    async fn publish_ride_request(&self, priority: u8, request: RideRequestRabbit) -> EngineResult<()> {
        let body = serde_json::to_vec(&request)?;
        let routing_key = format!("ride.request.{}", request.ride_type.to_lowercase());
        let channel = self.channel.read().await;
        channel
            .basic_publish(
                "ride_topic",
                &routing_key,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_content_type(ShortString::from("application/json"))
                    .with_priority(priority),
            )
            .await
            .map_err(|e| EngineError::UpstreamUnavailable(format!("publish ride request: {e}")))?;
        Ok(())
    }

    async fn publish_ride_status(&self, update: RideStatusUpdate) -> EngineResult<()> {
        let body = serde_json::to_vec(&update)?;
        let routing_key = format!("ride.status.{}", update.status.to_lowercase());
        let channel = self.channel.read().await;
        channel
            .basic_publish(
                "ride_topic",
                &routing_key,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_content_type(ShortString::from("application/json")),
            )
            .await
            .map_err(|e| EngineError::UpstreamUnavailable(format!("publish ride status: {e}")))?;
        Ok(())
    }

    async fn ack(&self, delivery: lapin::message::Delivery) -> EngineResult<()> {
        delivery
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| EngineError::UpstreamUnavailable(format!("ack: {e}")))
    }
}
