// libs/appointment-cell/src/services/slot_guard.rs
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::models::{Appointment, BookingError, SlotKey};
use crate::store::{AppointmentStore, StoreError};

/// Keeps a slot to one active booking.
///
/// The lookups here only produce an early, friendly rejection. Two requests can
/// both pass them; the store's unique constraint then lets exactly one write
/// through, and `insert`/`update` translate the loser's violation into the same
/// domain error.
pub struct SlotConflictGuard {
    store: Arc<dyn AppointmentStore>,
}

impl SlotConflictGuard {
    pub fn new(store: Arc<dyn AppointmentStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self), fields(doctor_id = %slot.doctor_id))]
    pub async fn try_reserve_slot(
        &self,
        slot: &SlotKey,
        exclude: Option<Uuid>,
    ) -> Result<(), BookingError> {
        if let Some(holder) = self.store.find_active_in_slot(slot, exclude).await? {
            info!(
                "Slot {} {} already held by appointment {}",
                slot.canonical_date, slot.canonical_time, holder.id
            );
            return Err(BookingError::SlotConflict);
        }
        debug!("Slot {} {} is free", slot.canonical_date, slot.canonical_time);
        Ok(())
    }

    pub async fn check_patient_daily(
        &self,
        patient_id: Uuid,
        doctor_id: &str,
        canonical_date: &str,
        exclude: Option<Uuid>,
    ) -> Result<(), BookingError> {
        let existing = self
            .store
            .find_patient_day_booking(patient_id, doctor_id, canonical_date, exclude)
            .await?;
        if let Some(existing) = existing {
            info!(
                "Patient {} already booked {} with {} on {}",
                patient_id, existing.id, doctor_id, canonical_date
            );
            return Err(BookingError::DuplicateDailyBooking);
        }
        Ok(())
    }

    pub async fn insert(&self, appointment: &Appointment) -> Result<Appointment, BookingError> {
        self.store
            .insert(appointment)
            .await
            .map_err(|e| Self::translate(appointment, e))
    }

    pub async fn update(&self, appointment: &Appointment) -> Result<Appointment, BookingError> {
        self.store
            .update(appointment)
            .await
            .map_err(|e| Self::translate(appointment, e))
    }

    fn translate(appointment: &Appointment, err: StoreError) -> BookingError {
        if let StoreError::UniqueViolation(constraint) = &err {
            // A concurrent write won after our pre-check passed.
            warn!(
                "Write of appointment {} lost a race on {}",
                appointment.id,
                constraint.name()
            );
        }
        err.into()
    }
}
