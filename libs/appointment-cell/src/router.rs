// libs/appointment-cell/src/router.rs
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers::{self, AppointmentState};
use crate::services::BookingService;

pub fn appointment_routes(config: Arc<AppConfig>, bookings: Arc<BookingService>) -> Router {
    let state = AppointmentState {
        config: Arc::clone(&config),
        bookings,
    };

    // All appointment operations require authentication
    Router::new()
        .route("/", post(handlers::create_appointment))
        .route(
            "/{appointment_id}",
            get(handlers::get_appointment).delete(handlers::delete_appointment),
        )
        .route("/{appointment_id}/accept", post(handlers::accept_appointment))
        .route("/{appointment_id}/cancel", post(handlers::cancel_appointment))
        .route("/{appointment_id}/complete", post(handlers::complete_appointment))
        .route("/{appointment_id}/qr", put(handlers::store_qr_artifact))
        // Appointment listings
        .route("/doctors/{doctor_id}", get(handlers::get_doctor_appointments))
        .route("/patients/{patient_id}", get(handlers::get_patient_appointments))
        // Maintenance (admin only)
        .route("/admin/renumber", post(handlers::renumber_booking_numbers))
        .route(
            "/admin/doctors/{doctor_id}/backfill",
            post(handlers::backfill_doctor_queue),
        )
        .layer(middleware::from_fn_with_state(state.config.clone(), auth_middleware))
        .with_state(state)
}
