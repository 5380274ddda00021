use std::collections::{BTreeMap, BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{
    AppointmentStore, Constraint, DerivedExpectation, DerivedPatch, QueueGroupStats, StoreError,
};
use crate::models::{Appointment, AppointmentStatus, SlotKey};

/// Process-local store. Every write checks the unique constraints while holding
/// the lock, so the check and the write are one atomic step.
#[derive(Default)]
pub struct InMemoryAppointmentStore {
    rows: Mutex<Vec<Appointment>>,
}

impl InMemoryAppointmentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn violated_constraint(rows: &[Appointment], candidate: &Appointment) -> Option<Constraint> {
    let others = || rows.iter().filter(|row| row.id != candidate.id);

    // Specialty-queue rows have no doctor yet and never hold a slot.
    if candidate.is_active() && candidate.is_doctor_linked() {
        let slot = candidate.slot();
        if others().any(|row| row.is_active() && row.is_doctor_linked() && row.slot() == slot) {
            return Some(Constraint::ActiveSlot);
        }
    }

    if candidate.status != AppointmentStatus::Cancelled
        && others().any(|row| {
            row.status != AppointmentStatus::Cancelled
                && row.patient_id == candidate.patient_id
                && row.doctor_id == candidate.doctor_id
                && row.canonical_date == candidate.canonical_date
        })
    {
        return Some(Constraint::PatientDailyBooking);
    }

    if let Some(number) = &candidate.system_booking_number {
        if others().any(|row| row.system_booking_number.as_ref() == Some(number)) {
            return Some(Constraint::BookingNumber);
        }
    }

    None
}

fn sorted_by_creation(mut rows: Vec<Appointment>) -> Vec<Appointment> {
    // Stable: rows created in the same instant keep insertion order.
    rows.sort_by_key(|row| row.created_at);
    rows
}

#[async_trait]
impl AppointmentStore for InMemoryAppointmentStore {
    async fn insert(&self, appointment: &Appointment) -> Result<Appointment, StoreError> {
        let mut rows = self.rows.lock().await;
        if rows.iter().any(|row| row.id == appointment.id) {
            return Err(StoreError::Backend(format!("Duplicate id {}", appointment.id)));
        }
        if let Some(constraint) = violated_constraint(&rows, appointment) {
            debug!("Insert of {} rejected by {}", appointment.id, constraint.name());
            return Err(StoreError::UniqueViolation(constraint));
        }
        rows.push(appointment.clone());
        Ok(appointment.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Appointment>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows.iter().find(|row| row.id == id).cloned())
    }

    async fn update(&self, appointment: &Appointment) -> Result<Appointment, StoreError> {
        let mut rows = self.rows.lock().await;
        let index = rows
            .iter()
            .position(|row| row.id == appointment.id)
            .ok_or(StoreError::NotFound(appointment.id))?;

        let stored = &rows[index];
        let mut merged = appointment.clone();
        merged.system_booking_number = stored.system_booking_number.clone();
        merged.doctor_queue_number = stored.doctor_queue_number;
        if appointment.qr_payload.is_some() || appointment.qr_code.is_some() {
            merged.qr_payload = stored.qr_payload.clone();
            merged.qr_code = stored.qr_code.clone();
        }
        merged.created_at = stored.created_at;

        if let Some(constraint) = violated_constraint(&rows, &merged) {
            debug!("Update of {} rejected by {}", appointment.id, constraint.name());
            return Err(StoreError::UniqueViolation(constraint));
        }
        merged.updated_at = Utc::now();
        rows[index] = merged.clone();
        Ok(merged)
    }

    async fn patch_derived(&self, id: Uuid, patch: &DerivedPatch) -> Result<Appointment, StoreError> {
        self.patch_derived_if(id, patch, &DerivedExpectation::default())
            .await?
            .ok_or(StoreError::NotFound(id))
    }

    async fn patch_derived_if(
        &self,
        id: Uuid,
        patch: &DerivedPatch,
        expected: &DerivedExpectation,
    ) -> Result<Option<Appointment>, StoreError> {
        let mut rows = self.rows.lock().await;
        let index = rows
            .iter()
            .position(|row| row.id == id)
            .ok_or(StoreError::NotFound(id))?;
        if !expected.holds_for(&rows[index]) {
            debug!("Derived patch of {} skipped, row changed underneath", id);
            return Ok(None);
        }

        let mut patched = rows[index].clone();
        patch.apply(&mut patched);
        if let Some(constraint) = violated_constraint(&rows, &patched) {
            return Err(StoreError::UniqueViolation(constraint));
        }
        patched.updated_at = Utc::now();
        rows[index] = patched.clone();
        Ok(Some(patched))
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|row| row.id != id);
        Ok(rows.len() != before)
    }

    async fn find_active_in_slot(
        &self,
        slot: &SlotKey,
        exclude: Option<Uuid>,
    ) -> Result<Option<Appointment>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .find(|row| {
                Some(row.id) != exclude
                    && row.is_active()
                    && row.is_doctor_linked()
                    && row.slot() == *slot
            })
            .cloned())
    }

    async fn find_patient_day_booking(
        &self,
        patient_id: Uuid,
        doctor_id: &str,
        canonical_date: &str,
        exclude: Option<Uuid>,
    ) -> Result<Option<Appointment>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .find(|row| {
                Some(row.id) != exclude
                    && row.status != AppointmentStatus::Cancelled
                    && row.patient_id == patient_id
                    && row.doctor_id == doctor_id
                    && row.canonical_date == canonical_date
            })
            .cloned())
    }

    async fn list_by_doctor(
        &self,
        doctor_id: &str,
        canonical_date: Option<&str>,
    ) -> Result<Vec<Appointment>, StoreError> {
        let rows = self.rows.lock().await;
        let matching = rows
            .iter()
            .filter(|row| row.doctor_id == doctor_id)
            .filter(|row| canonical_date.map_or(true, |date| row.canonical_date == date))
            .cloned()
            .collect();
        Ok(sorted_by_creation(matching))
    }

    async fn list_by_patient(&self, patient_id: Uuid) -> Result<Vec<Appointment>, StoreError> {
        let rows = self.rows.lock().await;
        let matching = rows
            .iter()
            .filter(|row| row.patient_id == patient_id)
            .cloned()
            .collect();
        Ok(sorted_by_creation(matching))
    }

    async fn list_all(&self) -> Result<Vec<Appointment>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(sorted_by_creation(rows.clone()))
    }

    async fn queue_stats(
        &self,
        doctor_id: &str,
        per_date: bool,
    ) -> Result<Vec<QueueGroupStats>, StoreError> {
        let rows = self.rows.lock().await;

        let mut groups: BTreeMap<Option<String>, Vec<Option<i64>>> = BTreeMap::new();
        for row in rows.iter().filter(|row| row.doctor_id == doctor_id) {
            let key = per_date.then(|| row.canonical_date.clone());
            groups.entry(key).or_default().push(row.doctor_queue_number);
        }

        Ok(groups
            .into_iter()
            .map(|(canonical_date, numbers)| {
                let assigned: Vec<i64> = numbers.iter().flatten().copied().collect();
                QueueGroupStats {
                    canonical_date,
                    total: numbers.len() as i64,
                    assigned: assigned.len() as i64,
                    distinct: assigned.iter().collect::<HashSet<_>>().len() as i64,
                    min: assigned.iter().min().copied(),
                    max: assigned.iter().max().copied(),
                }
            })
            .collect())
    }

    async fn doctor_ids(&self) -> Result<Vec<String>, StoreError> {
        let rows = self.rows.lock().await;
        let ids: BTreeSet<String> = rows
            .iter()
            .filter(|row| row.is_doctor_linked())
            .map(|row| row.doctor_id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }
}
