// libs/appointment-cell/src/services/queue_number.rs
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use sequence_cell::SequenceStore;
use shared_config::QueueScope;

use crate::models::{is_specialty_queue_id, Appointment, BackfillReport, BookingError};
use crate::store::{AppointmentStore, DerivedExpectation, DerivedPatch};

pub const DOCTOR_QUEUE_KEY_PREFIX: &str = "doctorQueueNumber";

/// Doctor queue numbers: the per-doctor "turn" a doctor sees.
///
/// The scope is fixed at construction and every counter key goes through
/// [`DoctorQueueManager::scope_key`], so assignment and backfill always agree on
/// which counter a booking belongs to.
pub struct DoctorQueueManager {
    store: Arc<dyn AppointmentStore>,
    sequences: Arc<dyn SequenceStore>,
    scope: QueueScope,
}

impl DoctorQueueManager {
    pub fn new(
        store: Arc<dyn AppointmentStore>,
        sequences: Arc<dyn SequenceStore>,
        scope: QueueScope,
    ) -> Self {
        Self { store, sequences, scope }
    }

    pub fn scope(&self) -> QueueScope {
        self.scope
    }

    pub fn scope_key(&self, doctor_id: &str, canonical_date: &str) -> String {
        match self.scope {
            QueueScope::PerDoctor => format!("{}:{}", DOCTOR_QUEUE_KEY_PREFIX, doctor_id),
            QueueScope::PerDoctorDate => {
                format!("{}:{}:{}", DOCTOR_QUEUE_KEY_PREFIX, doctor_id, canonical_date)
            }
        }
    }

    pub async fn assign_queue_number(
        &self,
        doctor_id: &str,
        scope_key: &str,
    ) -> Result<i64, BookingError> {
        let number = self.sequences.next_value(scope_key).await?;
        debug!("Doctor {} queue number {} from {}", doctor_id, number, scope_key);
        Ok(number)
    }

    /// Draws a queue number for a doctor-linked appointment and stores it, unless
    /// the stored row got a number in the meantime.
    pub async fn assign_to(&self, appointment: &Appointment) -> Result<Appointment, BookingError> {
        if !appointment.is_doctor_linked() {
            return Ok(appointment.clone());
        }

        let key = self.scope_key(&appointment.doctor_id, &appointment.canonical_date);
        let number = self.assign_queue_number(&appointment.doctor_id, &key).await?;
        let patched = self
            .store
            .patch_derived_if(
                appointment.id,
                &DerivedPatch::queue_number(number),
                &DerivedExpectation::unqueued(),
            )
            .await?;

        match patched {
            Some(patched) => {
                info!("Appointment {} is number {} in {}", patched.id, number, key);
                Ok(patched)
            }
            None => {
                warn!("Queue number {} from {} skipped for {}", number, key, appointment.id);
                self.store
                    .get(appointment.id)
                    .await?
                    .ok_or(BookingError::NotFound(appointment.id))
            }
        }
    }

    /// Re-densifies the doctor's queue numbers to 1..N per scope group when drift
    /// is detected, keeping creation order. Not atomic against concurrent bookings
    /// for the same doctor; a racing booking is corrected on the next run.
    #[instrument(skip(self))]
    pub async fn ensure_backfill(&self, doctor_id: &str) -> Result<BackfillReport, BookingError> {
        let mut report = BackfillReport {
            doctor_id: doctor_id.to_string(),
            ..BackfillReport::default()
        };
        if is_specialty_queue_id(doctor_id) {
            return Ok(report);
        }

        let per_date = self.scope == QueueScope::PerDoctorDate;
        let groups = self.store.queue_stats(doctor_id, per_date).await?;
        report.groups_checked = groups.len();

        for group in groups.iter().filter(|group| group.has_drift()) {
            warn!(
                "Queue drift for doctor {} ({:?}): total={} assigned={} distinct={} min={:?} max={:?}",
                doctor_id,
                group.canonical_date,
                group.total,
                group.assigned,
                group.distinct,
                group.min,
                group.max
            );

            let rows = self
                .store
                .list_by_doctor(doctor_id, group.canonical_date.as_deref())
                .await?;

            for (index, row) in rows.iter().enumerate() {
                let target = index as i64 + 1;
                if row.doctor_queue_number != Some(target) {
                    self.store
                        .patch_derived(row.id, &DerivedPatch::queue_number(target))
                        .await?;
                    report.renumbered += 1;
                }
            }

            let date = group.canonical_date.as_deref().unwrap_or_default();
            let key = self.scope_key(doctor_id, date);
            self.sequences.resync(&key, rows.len() as i64).await?;
            report.groups_repaired += 1;
        }

        if report.groups_repaired > 0 {
            info!(
                "Backfilled doctor {}: {} group(s), {} appointment(s) renumbered",
                doctor_id, report.groups_repaired, report.renumbered
            );
        }
        Ok(report)
    }
}
