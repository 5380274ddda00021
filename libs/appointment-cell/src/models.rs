// libs/appointment-cell/src/models.rs
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use sequence_cell::SequenceError;

use crate::store::{Constraint, StoreError};

// ==============================================================================
// CORE APPOINTMENT MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Appointment {
    pub id: Uuid,
    pub patient_id: Uuid,
    /// Canonical doctor identifier; `specialty:{slug}` for specialty-queue bookings.
    pub doctor_id: String,
    /// `None` while the booking sits in a specialty queue.
    pub doctor_profile_id: Option<Uuid>,
    pub doctor_name: Option<String>,
    pub doctor_role: Option<String>,
    pub specialty: Option<String>,
    pub specialty_slug: Option<String>,
    pub date: String,
    pub canonical_date: String,
    pub time: String,
    pub canonical_time: String,
    pub status: AppointmentStatus,
    pub system_booking_number: Option<String>,
    pub doctor_queue_number: Option<i64>,
    pub notes: Option<String>,
    pub doctor_note: Option<String>,
    #[serde(default)]
    pub prescriptions: Vec<String>,
    pub qr_payload: Option<String>,
    pub qr_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    /// Pending and confirmed bookings hold their slot.
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_doctor_linked(&self) -> bool {
        self.doctor_profile_id.is_some()
    }

    pub fn slot(&self) -> SlotKey {
        SlotKey {
            doctor_id: self.doctor_id.clone(),
            canonical_date: self.canonical_date.clone(),
            canonical_time: self.canonical_time.clone(),
        }
    }

    pub fn has_valid_booking_number(&self) -> bool {
        self.system_booking_number
            .as_deref()
            .is_some_and(is_valid_booking_number)
    }

    /// Input the QR collaborator encodes. Any change here makes a cached code stale.
    pub fn qr_payload_source(&self) -> String {
        json!({
            "id": self.id,
            "system_booking_number": self.system_booking_number,
            "doctor_queue_number": self.doctor_queue_number,
            "doctor_id": self.doctor_id,
            "date": self.canonical_date,
            "time": self.canonical_time,
            "status": self.status,
        })
        .to_string()
    }

    /// True when a cached QR code exists and was rendered from the current fields.
    pub fn has_fresh_qr(&self) -> bool {
        self.qr_code.is_some()
            && self.qr_payload.as_deref() == Some(self.qr_payload_source().as_str())
    }

    pub fn clear_qr_cache(&mut self) {
        self.qr_payload = None;
        self.qr_code = None;
    }
}

/// A booking number is a non-empty string of ASCII digits.
pub fn is_valid_booking_number(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

/// The tuple a booking occupies exclusively while active.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub doctor_id: String,
    pub canonical_date: String,
    pub canonical_time: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, AppointmentStatus::Pending | AppointmentStatus::Confirmed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AppointmentStatus::Completed | AppointmentStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==============================================================================
// DOCTOR IDENTITY
// ==============================================================================

/// Prefix of the doctor id used by bookings waiting in a specialty queue.
pub const SPECIALTY_QUEUE_PREFIX: &str = "specialty:";

pub fn is_specialty_queue_id(doctor_id: &str) -> bool {
    doctor_id.starts_with(SPECIALTY_QUEUE_PREFIX)
}

/// Doctor fields denormalized onto a booking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DoctorIdentity {
    pub doctor_id: String,
    pub profile_id: Option<Uuid>,
    pub name: Option<String>,
    pub role: Option<String>,
    pub specialty: Option<String>,
    pub specialty_slug: Option<String>,
    /// Patient bookings against this doctor skip the pending state.
    #[serde(default)]
    pub auto_confirm: bool,
}

impl DoctorIdentity {
    /// A doctor backed by a profile; queue numbers are drawn for it.
    pub fn doctor(doctor_id: impl Into<String>, profile_id: Uuid) -> Self {
        Self {
            doctor_id: doctor_id.into(),
            profile_id: Some(profile_id),
            ..Self::default()
        }
    }

    /// A specialty queue that any doctor of the specialty may accept from.
    /// Queue bookings hold no slot until a doctor accepts them, so several
    /// patients may wait for the same specialty time.
    pub fn specialty_queue(specialty: &str, slug: &str) -> Self {
        Self {
            doctor_id: format!("{}{}", SPECIALTY_QUEUE_PREFIX, slug),
            profile_id: None,
            specialty: Some(specialty.to_string()),
            specialty_slug: Some(slug.to_string()),
            ..Self::default()
        }
    }

    pub fn is_linked(&self) -> bool {
        self.profile_id.is_some()
    }
}

/// Who initiated a booking. Set from the caller's token, never from the body.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BookingOrigin {
    #[default]
    Patient,
    Doctor,
    Admin,
}

// ==============================================================================
// REQUEST/RESPONSE MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBookingRequest {
    pub patient_id: Uuid,
    pub doctor: DoctorIdentity,
    pub date: String,
    pub time: String,
    pub notes: Option<String>,
    #[serde(skip_deserializing, default)]
    pub origin: BookingOrigin,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcceptBookingRequest {
    /// Binds a specialty-queue booking (or reassigns one) to this doctor.
    pub doctor: Option<DoctorIdentity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompleteBookingRequest {
    pub doctor_note: Option<String>,
    #[serde(default)]
    pub prescriptions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreQrRequest {
    pub qr_payload: String,
    pub qr_code: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackfillReport {
    pub doctor_id: String,
    pub groups_checked: usize,
    pub groups_repaired: usize,
    /// Rows whose queue number changed.
    pub renumbered: usize,
}

impl BackfillReport {
    pub fn is_clean(&self) -> bool {
        self.groups_repaired == 0
    }
}

// ==============================================================================
// ERRORS
// ==============================================================================

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("This slot is already booked, please choose another time")]
    SlotConflict,

    #[error("Patient already has a booking with this doctor on that date")]
    DuplicateDailyBooking,

    #[error("Appointment not found: {0}")]
    NotFound(Uuid),

    #[error("Appointment cannot move from {from} to {to}")]
    InvalidStatusTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage failure: {0}")]
    Storage(String),
}

impl From<StoreError> for BookingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UniqueViolation(Constraint::ActiveSlot) => BookingError::SlotConflict,
            StoreError::UniqueViolation(Constraint::PatientDailyBooking) => {
                BookingError::DuplicateDailyBooking
            }
            StoreError::NotFound(id) => BookingError::NotFound(id),
            other => BookingError::Storage(other.to_string()),
        }
    }
}

impl From<SequenceError> for BookingError {
    fn from(err: SequenceError) -> Self {
        BookingError::Storage(err.to_string())
    }
}
