use std::env;
use std::sync::Arc;

use axum::http::{header, Method};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use utoipa_swagger_ui::SwaggerUi;

use ride_engine::api::{self, AppState};
use ride_engine::auth::TokenVerifier;
use ride_engine::broker::RabbitBroker;
use ride_engine::config::Config;
use ride_engine::hub::{Hub, HubKind};
use ride_engine::orchestrator::Orchestrator;
use ride_engine::persistence::SqlitePersistence;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ride_engine=debug,tower_http=debug,axum::rejection=trace".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = env::var("RIDE_ENGINE_CONFIG").unwrap_or_else(|_| "config.yml".into());
    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "failed to load configuration");
        e
    })?;

    let secret = env::var("MY_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let auth = Arc::new(TokenVerifier::new(secret.into_bytes()));

    info!(url = %config.database.sqlite_url(), "connecting to persistence store");
    let persistence = Arc::new(SqlitePersistence::connect(&config.database.sqlite_url()).await?);

    info!(host = %config.rabbitmq.host, port = config.rabbitmq.port, "connecting to broker");
    let (broker, broker_events) = RabbitBroker::connect(&config.rabbitmq.amqp_url()).await?;

    let passenger_hub = Hub::new(HubKind::Passenger, auth.clone());
    let driver_hub = Hub::new(HubKind::Driver, auth.clone());

    let orchestrator = Orchestrator::new(
        persistence.clone(),
        broker.clone(),
        passenger_hub.clone(),
        driver_hub.clone(),
    );
    tokio::spawn(orchestrator.clone().run(broker_events));

    let state = AppState {
        persistence,
        broker,
        orchestrator,
        passenger_hub,
        driver_hub,
        auth,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    let (router, openapi) = api::router(state);
    let app = router
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = format!("0.0.0.0:{}", config.websocket.port);
    info!(%addr, "starting ride orchestration engine");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
