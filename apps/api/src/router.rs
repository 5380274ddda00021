use std::sync::Arc;

use axum::{routing::get, Router};

use appointment_cell::router::appointment_routes;
use appointment_cell::services::BookingService;
use shared_config::AppConfig;

pub fn create_router(config: Arc<AppConfig>, bookings: Arc<BookingService>) -> Router {
    Router::new()
        .route("/", get(|| async { "Clinic booking API is running!" }))
        .nest("/appointments", appointment_routes(config, bookings))
}
