// libs/appointment-cell/src/services/lifecycle.rs
use chrono::Utc;
use tracing::{debug, warn};

use crate::models::{Appointment, AppointmentStatus, BookingError, BookingOrigin, DoctorIdentity};

pub struct BookingLifecycleService;

impl Default for BookingLifecycleService {
    fn default() -> Self {
        Self::new()
    }
}

impl BookingLifecycleService {
    pub fn new() -> Self {
        Self
    }

    /// Status a new booking starts in.
    pub fn initial_status(&self, doctor: &DoctorIdentity, origin: BookingOrigin) -> AppointmentStatus {
        if !doctor.is_linked() {
            // Specialty queue: waits for a doctor to accept it.
            return AppointmentStatus::Pending;
        }
        match origin {
            BookingOrigin::Doctor | BookingOrigin::Admin => AppointmentStatus::Confirmed,
            BookingOrigin::Patient if doctor.auto_confirm => AppointmentStatus::Confirmed,
            BookingOrigin::Patient => AppointmentStatus::Pending,
        }
    }

    pub fn get_valid_transitions(&self, current_status: &AppointmentStatus) -> &'static [AppointmentStatus] {
        match current_status {
            AppointmentStatus::Pending => &[AppointmentStatus::Confirmed, AppointmentStatus::Cancelled],
            AppointmentStatus::Confirmed => &[AppointmentStatus::Completed, AppointmentStatus::Cancelled],
            // Terminal states - no transitions allowed
            AppointmentStatus::Completed | AppointmentStatus::Cancelled => &[],
        }
    }

    pub fn validate_status_transition(
        &self,
        current_status: &AppointmentStatus,
        new_status: &AppointmentStatus,
    ) -> Result<(), BookingError> {
        if !self.get_valid_transitions(current_status).contains(new_status) {
            warn!("Invalid status transition attempted: {} -> {}", current_status, new_status);
            return Err(BookingError::InvalidStatusTransition {
                from: *current_status,
                to: *new_status,
            });
        }
        debug!("Status transition validated: {} -> {}", current_status, new_status);
        Ok(())
    }

    /// Applies a validated transition. Status feeds the QR payload, so the cached
    /// code is dropped; booking and queue numbers are left alone.
    pub fn transition(
        &self,
        appointment: &mut Appointment,
        new_status: AppointmentStatus,
    ) -> Result<(), BookingError> {
        self.validate_status_transition(&appointment.status, &new_status)?;
        appointment.status = new_status;
        appointment.clear_qr_cache();
        appointment.updated_at = Utc::now();
        Ok(())
    }
}
