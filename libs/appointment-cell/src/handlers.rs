// libs/appointment-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::auth::{Role, User};
use shared_models::error::AppError;
use shared_utils::extractor::require_role;

use crate::models::{
    is_specialty_queue_id, AcceptBookingRequest, Appointment, BookingError, BookingOrigin,
    CompleteBookingRequest, CreateBookingRequest, StoreQrRequest,
};
use crate::services::BookingService;

#[derive(Clone)]
pub struct AppointmentState {
    pub config: Arc<AppConfig>,
    pub bookings: Arc<BookingService>,
}

impl From<BookingError> for AppError {
    fn from(err: BookingError) -> Self {
        match err {
            BookingError::SlotConflict => AppError::SlotConflict(err.to_string()),
            BookingError::DuplicateDailyBooking => AppError::Conflict(err.to_string()),
            BookingError::InvalidStatusTransition { .. } => AppError::Conflict(err.to_string()),
            BookingError::NotFound(_) => AppError::NotFound(err.to_string()),
            BookingError::Validation(msg) => AppError::BadRequest(msg),
            BookingError::Storage(msg) => AppError::Internal(msg),
        }
    }
}

// ==============================================================================
// ACCESS RULES
// ==============================================================================

fn is_owner(user: &User, appointment: &Appointment) -> bool {
    appointment.patient_id.to_string() == user.id
}

/// The appointment's own doctor; any doctor for a specialty-queue booking.
fn is_treating_doctor(user: &User, appointment: &Appointment) -> bool {
    match user.doctor_id() {
        Some(doctor_id) => {
            doctor_id == appointment.doctor_id || is_specialty_queue_id(&appointment.doctor_id)
        }
        None => false,
    }
}

fn ensure_can_view(user: &User, appointment: &Appointment) -> Result<(), AppError> {
    if user.is_admin() || is_owner(user, appointment) || is_treating_doctor(user, appointment) {
        return Ok(());
    }
    Err(AppError::Forbidden("Not authorized to access this appointment".to_string()))
}

// ==============================================================================
// BOOKING HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn create_appointment(
    State(state): State<AppointmentState>,
    Extension(user): Extension<User>,
    Json(mut request): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let role = require_role(&user, &[Role::Patient, Role::Doctor, Role::Admin])?;

    request.origin = match role {
        Role::Patient => {
            if request.patient_id.to_string() != user.id {
                return Err(AppError::Forbidden(
                    "Patients can only book for themselves".to_string(),
                ));
            }
            BookingOrigin::Patient
        }
        Role::Doctor => {
            if user.doctor_id().as_deref() != Some(request.doctor.doctor_id.as_str()) {
                return Err(AppError::Forbidden(
                    "Doctors can only book into their own schedule".to_string(),
                ));
            }
            BookingOrigin::Doctor
        }
        Role::Admin => BookingOrigin::Admin,
    };

    let appointment = state.bookings.create_booking(request).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "appointment": appointment,
            "message": "Appointment booked successfully"
        })),
    ))
}

#[axum::debug_handler]
pub async fn get_appointment(
    State(state): State<AppointmentState>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let appointment = state.bookings.find_appointment(appointment_id).await?;
    ensure_can_view(&user, &appointment)?;

    let appointment = state.bookings.with_booking_number(appointment).await;
    Ok(Json(json!({ "appointment": appointment })))
}

#[axum::debug_handler]
pub async fn accept_appointment(
    State(state): State<AppointmentState>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
    body: Option<Json<AcceptBookingRequest>>,
) -> Result<Json<Value>, AppError> {
    let role = require_role(&user, &[Role::Doctor, Role::Admin])?;
    let request = body.map(|Json(request)| request).unwrap_or_default();

    if role == Role::Doctor {
        let appointment = state.bookings.find_appointment(appointment_id).await?;
        if !is_treating_doctor(&user, &appointment) {
            return Err(AppError::Forbidden(
                "Not authorized to accept this appointment".to_string(),
            ));
        }
        if let Some(doctor) = &request.doctor {
            if user.doctor_id().as_deref() != Some(doctor.doctor_id.as_str()) {
                return Err(AppError::Forbidden(
                    "Doctors can only accept bookings for themselves".to_string(),
                ));
            }
        }
    }

    let appointment = state
        .bookings
        .accept_pending_booking(appointment_id, request.doctor)
        .await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment confirmed"
    })))
}

#[axum::debug_handler]
pub async fn cancel_appointment(
    State(state): State<AppointmentState>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let appointment = state.bookings.find_appointment(appointment_id).await?;
    ensure_can_view(&user, &appointment)?;

    let appointment = state.bookings.cancel_booking(appointment_id).await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment cancelled"
    })))
}

#[axum::debug_handler]
pub async fn complete_appointment(
    State(state): State<AppointmentState>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
    body: Option<Json<CompleteBookingRequest>>,
) -> Result<Json<Value>, AppError> {
    require_role(&user, &[Role::Doctor, Role::Admin])?;
    let appointment = state.bookings.find_appointment(appointment_id).await?;
    if !user.is_admin() && user.doctor_id().as_deref() != Some(appointment.doctor_id.as_str()) {
        return Err(AppError::Forbidden(
            "Only the treating doctor can complete this appointment".to_string(),
        ));
    }

    let request = body.map(|Json(request)| request).unwrap_or_default();
    let appointment = state.bookings.complete_booking(appointment_id, request).await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment completed"
    })))
}

#[axum::debug_handler]
pub async fn delete_appointment(
    State(state): State<AppointmentState>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    require_role(&user, &[Role::Admin])?;
    state.bookings.delete_booking(appointment_id).await?;

    Ok(Json(json!({
        "success": true,
        "message": "Appointment deleted"
    })))
}

#[axum::debug_handler]
pub async fn store_qr_artifact(
    State(state): State<AppointmentState>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<StoreQrRequest>,
) -> Result<Json<Value>, AppError> {
    let appointment = state.bookings.find_appointment(appointment_id).await?;
    ensure_can_view(&user, &appointment)?;

    let appointment = state.bookings.store_qr_artifact(appointment_id, request).await?;
    Ok(Json(json!({ "appointment": appointment })))
}

// ==============================================================================
// LISTINGS
// ==============================================================================

#[axum::debug_handler]
pub async fn get_doctor_appointments(
    State(state): State<AppointmentState>,
    Path(doctor_id): Path<String>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    if !user.is_admin() && user.doctor_id().as_deref() != Some(doctor_id.as_str()) {
        return Err(AppError::Forbidden(
            "Not authorized to view this doctor's appointments".to_string(),
        ));
    }

    let appointments = state.bookings.list_doctor_appointments(&doctor_id).await?;
    Ok(Json(json!({
        "appointments": appointments,
        "total": appointments.len()
    })))
}

#[axum::debug_handler]
pub async fn get_patient_appointments(
    State(state): State<AppointmentState>,
    Path(patient_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    if !user.is_admin() && patient_id.to_string() != user.id {
        return Err(AppError::Forbidden(
            "Not authorized to view this patient's appointments".to_string(),
        ));
    }

    let appointments = state.bookings.list_patient_appointments(patient_id).await?;
    Ok(Json(json!({
        "appointments": appointments,
        "total": appointments.len()
    })))
}

// ==============================================================================
// MAINTENANCE
// ==============================================================================

#[axum::debug_handler]
pub async fn renumber_booking_numbers(
    State(state): State<AppointmentState>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    require_role(&user, &[Role::Admin])?;
    let max = state.bookings.renumber_all_booking_numbers().await?;

    Ok(Json(json!({
        "success": true,
        "max_booking_number": max
    })))
}

#[axum::debug_handler]
pub async fn backfill_doctor_queue(
    State(state): State<AppointmentState>,
    Path(doctor_id): Path<String>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    require_role(&user, &[Role::Admin])?;
    let report = state.bookings.ensure_doctor_queue_backfill(&doctor_id).await?;

    Ok(Json(json!({
        "success": true,
        "report": report
    })))
}
