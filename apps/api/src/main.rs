use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{self, TraceLayer};
use tracing::{info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use appointment_cell::services::BookingService;
use appointment_cell::store::build_appointment_store;
use sequence_cell::build_sequence_store;
use shared_config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting clinic booking API server");

    let config = Arc::new(AppConfig::from_env());

    let store = build_appointment_store(&config);
    let sequences = build_sequence_store(&config)
        .await
        .context("failed to initialise sequence store")?;
    let bookings = Arc::new(BookingService::new(store, sequences, &config));

    if config.backfill_interval_secs > 0 {
        spawn_backfill_task(Arc::clone(&bookings), config.backfill_interval_secs);
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router::create_router(Arc::clone(&config), bookings)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

/// Periodically repairs queue-number drift for every doctor.
fn spawn_backfill_task(bookings: Arc<BookingService>, every_secs: u64) {
    info!("Queue backfill scheduled every {}s", every_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(every_secs));
        loop {
            interval.tick().await;
            match bookings.backfill_all_doctors().await {
                Ok(reports) => {
                    let repaired = reports.iter().filter(|r| !r.is_clean()).count();
                    info!(
                        "Queue backfill pass finished: {} doctors checked, {} repaired",
                        reports.len(),
                        repaired
                    );
                }
                Err(e) => warn!("Queue backfill pass failed: {}", e),
            }
        }
    });
}
