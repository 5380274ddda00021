// libs/appointment-cell/src/services/booking.rs
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use sequence_cell::SequenceStore;
use shared_config::AppConfig;

use crate::canonical::{canonical_date, canonical_time};
use crate::models::{
    Appointment, AppointmentStatus, BackfillReport, BookingError, CompleteBookingRequest,
    CreateBookingRequest, DoctorIdentity, SlotKey, StoreQrRequest,
};
use crate::services::booking_number::BookingNumberManager;
use crate::services::lifecycle::BookingLifecycleService;
use crate::services::queue_number::DoctorQueueManager;
use crate::services::slot_guard::SlotConflictGuard;
use crate::store::{AppointmentStore, DerivedPatch, QrUpdate};

/// Entry point of the booking core. Holds explicitly constructed store and
/// allocator handles; nothing here is process-global.
pub struct BookingService {
    store: Arc<dyn AppointmentStore>,
    slot_guard: SlotConflictGuard,
    booking_numbers: BookingNumberManager,
    queue: DoctorQueueManager,
    lifecycle: BookingLifecycleService,
    backfill_on_read: bool,
}

impl BookingService {
    pub fn new(
        store: Arc<dyn AppointmentStore>,
        sequences: Arc<dyn SequenceStore>,
        config: &AppConfig,
    ) -> Self {
        Self {
            slot_guard: SlotConflictGuard::new(Arc::clone(&store)),
            booking_numbers: BookingNumberManager::new(Arc::clone(&store), Arc::clone(&sequences)),
            queue: DoctorQueueManager::new(Arc::clone(&store), sequences, config.queue_scope),
            lifecycle: BookingLifecycleService::new(),
            backfill_on_read: config.backfill_on_read,
            store,
        }
    }

    pub fn queue(&self) -> &DoctorQueueManager {
        &self.queue
    }

    // ==============================================================================
    // BOOKING LIFECYCLE
    // ==============================================================================

    /// Creates a booking in its slot. Numbers are drawn only after the row is
    /// stored, so a lost slot race never consumes a booking number.
    #[instrument(skip(self, request), fields(patient_id = %request.patient_id, doctor_id = %request.doctor.doctor_id))]
    pub async fn create_booking(&self, request: CreateBookingRequest) -> Result<Appointment, BookingError> {
        Self::validate_doctor(&request.doctor)?;

        let date = canonical_date(&request.date)?;
        let time = canonical_time(&request.time)?;
        let slot = SlotKey {
            doctor_id: request.doctor.doctor_id.clone(),
            canonical_date: date.clone(),
            canonical_time: time.clone(),
        };

        self.slot_guard.try_reserve_slot(&slot, None).await?;
        self.slot_guard
            .check_patient_daily(request.patient_id, &slot.doctor_id, &date, None)
            .await?;

        let status = self.lifecycle.initial_status(&request.doctor, request.origin);
        let now = Utc::now();
        let doctor = request.doctor;
        let appointment = Appointment {
            id: Uuid::new_v4(),
            patient_id: request.patient_id,
            doctor_id: doctor.doctor_id,
            doctor_profile_id: doctor.profile_id,
            doctor_name: doctor.name,
            doctor_role: doctor.role,
            specialty: doctor.specialty,
            specialty_slug: doctor.specialty_slug,
            date: request.date,
            canonical_date: date,
            time: request.time,
            canonical_time: time,
            status,
            system_booking_number: None,
            doctor_queue_number: None,
            notes: request.notes,
            doctor_note: None,
            prescriptions: Vec::new(),
            qr_payload: None,
            qr_code: None,
            created_at: now,
            updated_at: now,
        };

        let stored = self.slot_guard.insert(&appointment).await?;
        info!("Appointment {} created as {}", stored.id, stored.status);

        Ok(self.assign_numbers(stored).await)
    }

    /// Confirms a pending booking, optionally binding it to the accepting doctor.
    /// The slot is checked again because it may have been taken since booking.
    #[instrument(skip(self, doctor))]
    pub async fn accept_pending_booking(
        &self,
        appointment_id: Uuid,
        doctor: Option<DoctorIdentity>,
    ) -> Result<Appointment, BookingError> {
        let mut appointment = self.load(appointment_id).await?;
        self.lifecycle
            .validate_status_transition(&appointment.status, &AppointmentStatus::Confirmed)?;

        let previous_doctor = appointment.doctor_id.clone();
        if let Some(doctor) = doctor {
            if !doctor.is_linked() {
                return Err(BookingError::Validation(
                    "Accepting doctor must have a doctor profile".to_string(),
                ));
            }
            Self::validate_doctor(&doctor)?;
            Self::bind_doctor(&mut appointment, doctor);
        }
        if !appointment.is_doctor_linked() {
            return Err(BookingError::Validation(
                "A doctor must accept a specialty-queue booking before it is confirmed".to_string(),
            ));
        }

        let rebound = appointment.doctor_id != previous_doctor;

        self.slot_guard
            .try_reserve_slot(&appointment.slot(), Some(appointment.id))
            .await?;
        if rebound {
            self.slot_guard
                .check_patient_daily(
                    appointment.patient_id,
                    &appointment.doctor_id,
                    &appointment.canonical_date,
                    Some(appointment.id),
                )
                .await?;
        }

        self.lifecycle
            .transition(&mut appointment, AppointmentStatus::Confirmed)?;
        let mut stored = self.slot_guard.update(&appointment).await?;
        if rebound && stored.doctor_queue_number.is_some() {
            // The old number belongs to another doctor's queue.
            let release = DerivedPatch {
                doctor_queue_number: Some(None),
                qr: QrUpdate::Clear,
                ..DerivedPatch::default()
            };
            stored = self.store.patch_derived(stored.id, &release).await?;
        }
        info!("Appointment {} confirmed by {}", stored.id, stored.doctor_id);

        Ok(self.assign_numbers(stored).await)
    }

    /// Cancels a booking. Its numbers stay; only the QR cache is dropped.
    #[instrument(skip(self))]
    pub async fn cancel_booking(&self, appointment_id: Uuid) -> Result<Appointment, BookingError> {
        let mut appointment = self.load(appointment_id).await?;
        self.lifecycle
            .transition(&mut appointment, AppointmentStatus::Cancelled)?;
        let stored = self.slot_guard.update(&appointment).await?;
        info!(
            "Appointment {} cancelled (booking number {:?} retired)",
            stored.id, stored.system_booking_number
        );
        Ok(stored)
    }

    #[instrument(skip(self, request))]
    pub async fn complete_booking(
        &self,
        appointment_id: Uuid,
        request: CompleteBookingRequest,
    ) -> Result<Appointment, BookingError> {
        let mut appointment = self.load(appointment_id).await?;
        self.lifecycle
            .transition(&mut appointment, AppointmentStatus::Completed)?;
        if request.doctor_note.is_some() {
            appointment.doctor_note = request.doctor_note;
        }
        if !request.prescriptions.is_empty() {
            appointment.prescriptions = request.prescriptions;
        }
        let stored = self.slot_guard.update(&appointment).await?;
        info!("Appointment {} completed", stored.id);
        Ok(stored)
    }

    /// Hard delete. Counters are not rewound, so the booking number stays retired.
    #[instrument(skip(self))]
    pub async fn delete_booking(&self, appointment_id: Uuid) -> Result<(), BookingError> {
        if !self.store.delete(appointment_id).await? {
            return Err(BookingError::NotFound(appointment_id));
        }
        warn!("Appointment {} deleted", appointment_id);
        Ok(())
    }

    // ==============================================================================
    // READS
    // ==============================================================================

    pub async fn get_appointment(&self, appointment_id: Uuid) -> Result<Appointment, BookingError> {
        let appointment = self.load(appointment_id).await?;
        Ok(self.ensure_best_effort(appointment).await)
    }

    /// Plain read with no numbering side effects, for access checks.
    pub async fn find_appointment(&self, appointment_id: Uuid) -> Result<Appointment, BookingError> {
        self.load(appointment_id).await
    }

    /// Fills in a missing booking number, returning the record as-is on failure.
    pub async fn with_booking_number(&self, appointment: Appointment) -> Appointment {
        self.ensure_best_effort(appointment).await
    }

    /// Lists a doctor's appointments in creation order, healing queue drift first
    /// when read-time backfill is enabled.
    #[instrument(skip(self))]
    pub async fn list_doctor_appointments(&self, doctor_id: &str) -> Result<Vec<Appointment>, BookingError> {
        if self.backfill_on_read {
            if let Err(e) = self.ensure_doctor_queue_backfill(doctor_id).await {
                warn!("Queue backfill for {} failed, listing as-is: {}", doctor_id, e);
            }
        }
        let appointments = self.store.list_by_doctor(doctor_id, None).await?;
        Ok(self.ensure_all_best_effort(appointments).await)
    }

    pub async fn list_patient_appointments(&self, patient_id: Uuid) -> Result<Vec<Appointment>, BookingError> {
        let appointments = self.store.list_by_patient(patient_id).await?;
        Ok(self.ensure_all_best_effort(appointments).await)
    }

    // ==============================================================================
    // NUMBERING
    // ==============================================================================

    /// Safe on every read; never replaces a valid number.
    pub async fn ensure_booking_number(&self, appointment: Appointment) -> Result<Appointment, BookingError> {
        self.booking_numbers.ensure(appointment).await
    }

    pub async fn ensure_doctor_queue_backfill(&self, doctor_id: &str) -> Result<BackfillReport, BookingError> {
        self.queue.ensure_backfill(doctor_id).await
    }

    /// Backfills every doctor that has doctor-linked bookings. A failing doctor is
    /// logged and skipped.
    pub async fn backfill_all_doctors(&self) -> Result<Vec<BackfillReport>, BookingError> {
        let doctor_ids = self.store.doctor_ids().await?;
        let mut reports = Vec::with_capacity(doctor_ids.len());
        for doctor_id in doctor_ids {
            match self.queue.ensure_backfill(&doctor_id).await {
                Ok(report) => reports.push(report),
                Err(e) => error!("Queue backfill for {} failed: {}", doctor_id, e),
            }
        }
        Ok(reports)
    }

    /// Maintenance only; run with booking traffic paused.
    pub async fn renumber_all_booking_numbers(&self) -> Result<i64, BookingError> {
        self.booking_numbers.renumber_all().await
    }

    // ==============================================================================
    // QR ARTIFACT
    // ==============================================================================

    /// Caches a rendered QR code. Rejected when `qr_payload` no longer matches the
    /// appointment's current payload fields.
    pub async fn store_qr_artifact(
        &self,
        appointment_id: Uuid,
        request: StoreQrRequest,
    ) -> Result<Appointment, BookingError> {
        let appointment = self.load(appointment_id).await?;
        if request.qr_payload != appointment.qr_payload_source() {
            return Err(BookingError::Validation(
                "QR payload does not match the current appointment".to_string(),
            ));
        }
        let patch = DerivedPatch {
            qr: QrUpdate::Set {
                payload: request.qr_payload,
                code: request.qr_code,
            },
            ..DerivedPatch::default()
        };
        Ok(self.store.patch_derived(appointment_id, &patch).await?)
    }

    // ==============================================================================
    // HELPERS
    // ==============================================================================

    async fn load(&self, appointment_id: Uuid) -> Result<Appointment, BookingError> {
        self.store
            .get(appointment_id)
            .await?
            .ok_or(BookingError::NotFound(appointment_id))
    }

    fn validate_doctor(doctor: &DoctorIdentity) -> Result<(), BookingError> {
        if doctor.doctor_id.trim().is_empty() {
            return Err(BookingError::Validation("doctor_id is required".to_string()));
        }
        if !doctor.is_linked() && doctor.specialty_slug.is_none() {
            return Err(BookingError::Validation(
                "Booking needs a doctor profile or a specialty queue".to_string(),
            ));
        }
        Ok(())
    }

    fn bind_doctor(appointment: &mut Appointment, doctor: DoctorIdentity) {
        appointment.doctor_id = doctor.doctor_id;
        appointment.doctor_profile_id = doctor.profile_id;
        appointment.doctor_name = doctor.name;
        appointment.doctor_role = doctor.role;
        if doctor.specialty.is_some() {
            appointment.specialty = doctor.specialty;
        }
        if doctor.specialty_slug.is_some() {
            appointment.specialty_slug = doctor.specialty_slug;
        }
    }

    /// Draws the booking number and, for doctor-linked bookings, the queue number.
    /// Failures leave the record numberless; reads repair the booking number.
    async fn assign_numbers(&self, appointment: Appointment) -> Appointment {
        let appointment = match self.booking_numbers.ensure(appointment.clone()).await {
            Ok(numbered) => numbered,
            Err(e) => {
                error!("Booking number assignment failed for {}: {}", appointment.id, e);
                appointment
            }
        };

        if !appointment.is_doctor_linked() || appointment.doctor_queue_number.is_some() {
            return appointment;
        }
        match self.queue.assign_to(&appointment).await {
            Ok(queued) => queued,
            Err(e) => {
                error!("Queue number assignment failed for {}: {}", appointment.id, e);
                appointment
            }
        }
    }

    async fn ensure_best_effort(&self, appointment: Appointment) -> Appointment {
        match self.booking_numbers.ensure(appointment.clone()).await {
            Ok(numbered) => numbered,
            Err(e) => {
                error!("Booking number repair failed for {}: {}", appointment.id, e);
                appointment
            }
        }
    }

    async fn ensure_all_best_effort(&self, appointments: Vec<Appointment>) -> Vec<Appointment> {
        join_all(appointments.into_iter().map(|a| self.ensure_best_effort(a))).await
    }
}
