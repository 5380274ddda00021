// libs/appointment-cell/src/services/booking_number.rs
use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use sequence_cell::SequenceStore;

use crate::models::{Appointment, BookingError};
use crate::store::{AppointmentStore, DerivedExpectation, DerivedPatch, QrUpdate};

/// Key of the single global booking-number counter.
pub const SYSTEM_BOOKING_NUMBER_KEY: &str = "systemBookingNumber";

/// Hands out system booking numbers. A valid number, once stored, is never replaced
/// outside of [`BookingNumberManager::renumber_all`].
pub struct BookingNumberManager {
    store: Arc<dyn AppointmentStore>,
    sequences: Arc<dyn SequenceStore>,
}

impl BookingNumberManager {
    pub fn new(store: Arc<dyn AppointmentStore>, sequences: Arc<dyn SequenceStore>) -> Self {
        Self { store, sequences }
    }

    /// Idempotent: returns the appointment unchanged when it already carries a
    /// valid number, including one stored since the caller's copy was read.
    ///
    /// The write only lands while the stored column still holds what was read, so
    /// concurrent callers all end up returning the one number that was stored.
    #[instrument(skip(self, appointment), fields(appointment_id = %appointment.id))]
    pub async fn ensure(&self, appointment: Appointment) -> Result<Appointment, BookingError> {
        if appointment.has_valid_booking_number() {
            return Ok(appointment);
        }

        let current = self.load(appointment.id).await?;
        if current.has_valid_booking_number() {
            return Ok(current);
        }

        if let Some(invalid) = &current.system_booking_number {
            warn!("Replacing malformed booking number {:?}", invalid);
        }

        let next = self.sequences.next_value(SYSTEM_BOOKING_NUMBER_KEY).await?;
        let patch = DerivedPatch::booking_number(next.to_string());
        let expected = DerivedExpectation::booking_number(current.system_booking_number.clone());
        let patched = self
            .store
            .patch_derived_if(current.id, &patch, &expected)
            .await?;

        match patched {
            Some(patched) => {
                info!("Assigned booking number {} to appointment {}", next, patched.id);
                Ok(patched)
            }
            None => {
                // Another caller numbered the row first; `next` stays unused.
                let stored = self.load(current.id).await?;
                warn!(
                    "Booking number {} skipped, appointment {} already has {:?}",
                    next, stored.id, stored.system_booking_number
                );
                Ok(stored)
            }
        }
    }

    /// Renumbers every appointment 1..N by creation time and resyncs the counter
    /// to N. Returns N. Must run with booking traffic paused.
    #[instrument(skip(self))]
    pub async fn renumber_all(&self) -> Result<i64, BookingError> {
        let appointments = self.store.list_all().await?;

        let changed: Vec<(Uuid, String)> = appointments
            .iter()
            .enumerate()
            .filter_map(|(index, appointment)| {
                let target = (index + 1).to_string();
                (appointment.system_booking_number.as_deref() != Some(target.as_str()))
                    .then_some((appointment.id, target))
            })
            .collect();

        // Release the old numbers first so no intermediate state holds one twice.
        let release = DerivedPatch {
            system_booking_number: Some(None),
            qr: QrUpdate::Clear,
            ..DerivedPatch::default()
        };
        for (id, _) in &changed {
            self.store.patch_derived(*id, &release).await?;
        }
        for (id, target) in &changed {
            self.store
                .patch_derived(*id, &DerivedPatch::booking_number(target.clone()))
                .await?;
        }

        let max = appointments.len() as i64;
        self.sequences.resync(SYSTEM_BOOKING_NUMBER_KEY, max).await?;

        warn!(
            "Renumbered booking numbers: {} of {} appointment(s) changed, counter now {}",
            changed.len(),
            max,
            max
        );
        Ok(max)
    }

    async fn load(&self, id: Uuid) -> Result<Appointment, BookingError> {
        self.store.get(id).await?.ok_or(BookingError::NotFound(id))
    }
}
