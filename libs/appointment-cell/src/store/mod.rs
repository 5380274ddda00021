// libs/appointment-cell/src/store/mod.rs
pub mod memory;
pub mod supabase;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use shared_config::{AppConfig, StoreBackend};
use shared_database::{DatabaseError, SupabaseClient};

use crate::models::{Appointment, SlotKey};

pub use self::memory::InMemoryAppointmentStore;
pub use self::supabase::SupabaseAppointmentStore;

/// Storage-level unique constraints the booking core relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// `(doctor_id, canonical_date, canonical_time)` among pending/confirmed rows.
    ActiveSlot,
    /// `(patient_id, doctor_id, canonical_date)` among non-cancelled rows.
    PatientDailyBooking,
    /// `system_booking_number` among rows that have one.
    BookingNumber,
}

impl Constraint {
    pub fn name(&self) -> &'static str {
        match self {
            Constraint::ActiveSlot => "appointments_active_slot_key",
            Constraint::PatientDailyBooking => "appointments_patient_daily_key",
            Constraint::BookingNumber => "appointments_booking_number_key",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            Constraint::ActiveSlot,
            Constraint::PatientDailyBooking,
            Constraint::BookingNumber,
        ]
        .into_iter()
        .find(|c| c.name() == name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unique constraint {} violated", .0.name())]
    UniqueViolation(Constraint),

    #[error("Appointment {0} not found")]
    NotFound(Uuid),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl From<DatabaseError> for StoreError {
    fn from(err: DatabaseError) -> Self {
        match err.violated_constraint().and_then(Constraint::from_name) {
            Some(constraint) => StoreError::UniqueViolation(constraint),
            None => StoreError::Backend(err.to_string()),
        }
    }
}

/// Change to the cached QR artifact carried by a [`DerivedPatch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub enum QrUpdate {
    #[default]
    Keep,
    Clear,
    Set { payload: String, code: String },
}

/// Writes to the derived fields only: numbers and QR cache. Never touches status
/// or slot columns, so it cannot trip the slot constraint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivedPatch {
    pub system_booking_number: Option<Option<String>>,
    pub doctor_queue_number: Option<Option<i64>>,
    pub qr: QrUpdate,
}

impl DerivedPatch {
    pub fn booking_number(number: String) -> Self {
        Self {
            system_booking_number: Some(Some(number)),
            qr: QrUpdate::Clear,
            ..Self::default()
        }
    }

    pub fn queue_number(number: i64) -> Self {
        Self {
            doctor_queue_number: Some(Some(number)),
            qr: QrUpdate::Clear,
            ..Self::default()
        }
    }

    pub fn apply(&self, appointment: &mut Appointment) {
        if let Some(number) = &self.system_booking_number {
            appointment.system_booking_number = number.clone();
        }
        if let Some(number) = self.doctor_queue_number {
            appointment.doctor_queue_number = number;
        }
        match &self.qr {
            QrUpdate::Keep => {}
            QrUpdate::Clear => appointment.clear_qr_cache(),
            QrUpdate::Set { payload, code } => {
                appointment.qr_payload = Some(payload.clone());
                appointment.qr_code = Some(code.clone());
            }
        }
    }
}

/// Precondition on the stored derived columns, checked by
/// [`AppointmentStore::patch_derived_if`] in the same step as the write.
/// `None` leaves a column unchecked; `Some(v)` requires the stored value to be `v`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivedExpectation {
    pub system_booking_number: Option<Option<String>>,
    pub doctor_queue_number: Option<Option<i64>>,
}

impl DerivedExpectation {
    /// The booking number is still what the caller last read.
    pub fn booking_number(current: Option<String>) -> Self {
        Self {
            system_booking_number: Some(current),
            ..Self::default()
        }
    }

    /// No queue number has been stored yet.
    pub fn unqueued() -> Self {
        Self {
            doctor_queue_number: Some(None),
            ..Self::default()
        }
    }

    pub fn holds_for(&self, appointment: &Appointment) -> bool {
        self.system_booking_number
            .as_ref()
            .map_or(true, |expected| appointment.system_booking_number == *expected)
            && self
                .doctor_queue_number
                .map_or(true, |expected| appointment.doctor_queue_number == expected)
    }
}

/// Queue-number statistics for one queue group of a doctor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueGroupStats {
    /// `None` when the whole doctor is one group.
    pub canonical_date: Option<String>,
    pub total: i64,
    pub assigned: i64,
    /// Count of distinct assigned numbers; catches duplicates such as `[1,3,3]`.
    #[serde(rename = "distinct_count")]
    pub distinct: i64,
    #[serde(rename = "min_number")]
    pub min: Option<i64>,
    #[serde(rename = "max_number")]
    pub max: Option<i64>,
}

impl QueueGroupStats {
    /// Drift when not every row has a number, or the numbers are not exactly 1..=total.
    pub fn has_drift(&self) -> bool {
        self.assigned != self.total
            || self.distinct != self.total
            || self.max != Some(self.total)
            || self.min != Some(1)
    }
}

/// Persistence for appointments.
///
/// `insert` and `update` must enforce every [`Constraint`] atomically at write
/// time and report a violation as [`StoreError::UniqueViolation`].
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn insert(&self, appointment: &Appointment) -> Result<Appointment, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Appointment>, StoreError>;

    /// Writes the record's own columns from `appointment`. Booking and queue
    /// numbers are left as stored; they change only through derived patches. The
    /// QR cache is cleared when `appointment` carries none and kept otherwise.
    async fn update(&self, appointment: &Appointment) -> Result<Appointment, StoreError>;

    async fn patch_derived(&self, id: Uuid, patch: &DerivedPatch) -> Result<Appointment, StoreError>;

    /// Like `patch_derived`, but only while the stored row still satisfies
    /// `expected`. `Ok(None)` means another writer changed those columns first.
    async fn patch_derived_if(
        &self,
        id: Uuid,
        patch: &DerivedPatch,
        expected: &DerivedExpectation,
    ) -> Result<Option<Appointment>, StoreError>;

    /// Returns `false` when no row had that id.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    /// An active appointment holding `slot`, other than `exclude`.
    async fn find_active_in_slot(
        &self,
        slot: &SlotKey,
        exclude: Option<Uuid>,
    ) -> Result<Option<Appointment>, StoreError>;

    /// A non-cancelled appointment of the patient with the doctor on that date,
    /// other than `exclude`.
    async fn find_patient_day_booking(
        &self,
        patient_id: Uuid,
        doctor_id: &str,
        canonical_date: &str,
        exclude: Option<Uuid>,
    ) -> Result<Option<Appointment>, StoreError>;

    /// The doctor's appointments ordered by `created_at` ascending, optionally
    /// restricted to one canonical date.
    async fn list_by_doctor(
        &self,
        doctor_id: &str,
        canonical_date: Option<&str>,
    ) -> Result<Vec<Appointment>, StoreError>;

    async fn list_by_patient(&self, patient_id: Uuid) -> Result<Vec<Appointment>, StoreError>;

    /// Every appointment ordered by `created_at` ascending.
    async fn list_all(&self) -> Result<Vec<Appointment>, StoreError>;

    async fn queue_stats(
        &self,
        doctor_id: &str,
        per_date: bool,
    ) -> Result<Vec<QueueGroupStats>, StoreError>;

    /// Distinct doctor ids of doctor-linked appointments.
    async fn doctor_ids(&self) -> Result<Vec<String>, StoreError>;
}

/// Builds the store selected by `BOOKING_STORE`.
pub fn build_appointment_store(config: &AppConfig) -> Arc<dyn AppointmentStore> {
    let store: Arc<dyn AppointmentStore> = match config.store_backend {
        StoreBackend::Memory => Arc::new(InMemoryAppointmentStore::new()),
        StoreBackend::Supabase => {
            Arc::new(SupabaseAppointmentStore::new(Arc::new(SupabaseClient::new(config))))
        }
    };
    info!("Appointment store ready ({:?} backend)", config.store_backend);
    store
}
