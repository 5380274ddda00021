pub mod booking;
pub mod booking_number;
pub mod lifecycle;
pub mod queue_number;
pub mod slot_guard;

pub use booking::BookingService;
pub use booking_number::{BookingNumberManager, SYSTEM_BOOKING_NUMBER_KEY};
pub use lifecycle::BookingLifecycleService;
pub use queue_number::{DoctorQueueManager, DOCTOR_QUEUE_KEY_PREFIX};
pub use slot_guard::SlotConflictGuard;
