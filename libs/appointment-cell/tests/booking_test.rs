use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use uuid::Uuid;

use appointment_cell::models::{
    Appointment, AppointmentStatus, BookingError, BookingOrigin, CompleteBookingRequest,
    CreateBookingRequest, DoctorIdentity, StoreQrRequest,
};
use appointment_cell::services::{BookingService, SYSTEM_BOOKING_NUMBER_KEY};
use appointment_cell::store::{AppointmentStore, DerivedPatch, InMemoryAppointmentStore};
use sequence_cell::{InMemorySequenceStore, SequenceError, SequenceStore};
use shared_config::{AppConfig, QueueScope};

/// Counts allocator calls, can be told to fail the next `n` increments and can
/// hold each increment back so concurrent callers overlap.
struct CountingSequenceStore {
    inner: InMemorySequenceStore,
    calls: AtomicUsize,
    failures_left: AtomicUsize,
    delay_ms: AtomicU64,
}

impl CountingSequenceStore {
    fn new() -> Self {
        Self {
            inner: InMemorySequenceStore::new(),
            calls: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    fn slow_down(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl SequenceStore for CountingSequenceStore {
    async fn next_value(&self, key: &str) -> Result<i64, SequenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SequenceError::Pool("connection refused".to_string()));
        }
        let value = self.inner.next_value(key).await?;
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(value)
    }

    async fn resync(&self, key: &str, value: i64) -> Result<(), SequenceError> {
        self.inner.resync(key, value).await
    }

    async fn current(&self, key: &str) -> Result<Option<i64>, SequenceError> {
        self.inner.current(key).await
    }
}

struct Harness {
    store: Arc<InMemoryAppointmentStore>,
    sequences: Arc<CountingSequenceStore>,
    service: BookingService,
}

fn harness_with(config: AppConfig) -> Harness {
    let store = Arc::new(InMemoryAppointmentStore::new());
    let sequences = Arc::new(CountingSequenceStore::new());
    let service = BookingService::new(store.clone(), sequences.clone(), &config);
    Harness { store, sequences, service }
}

fn harness() -> Harness {
    harness_with(AppConfig::default())
}

fn doctor(id: &str) -> DoctorIdentity {
    DoctorIdentity {
        name: Some(format!("Dr. {}", id)),
        role: Some("doctor".to_string()),
        specialty: Some("General Practice".to_string()),
        specialty_slug: Some("general-practice".to_string()),
        ..DoctorIdentity::doctor(id, Uuid::new_v4())
    }
}

fn request(patient_id: Uuid, doctor: &DoctorIdentity, date: &str, time: &str) -> CreateBookingRequest {
    CreateBookingRequest {
        patient_id,
        doctor: doctor.clone(),
        date: date.to_string(),
        time: time.to_string(),
        notes: None,
        origin: BookingOrigin::Doctor,
    }
}

#[tokio::test]
async fn test_cancelled_slot_can_be_rebooked_with_a_new_number() {
    let h = harness();
    let d = doctor("doc-d");
    let (p, q) = (Uuid::new_v4(), Uuid::new_v4());

    let first = h
        .service
        .create_booking(request(p, &d, "2025-06-01", "09:00"))
        .await
        .unwrap();
    assert_eq!(first.system_booking_number.as_deref(), Some("1"));

    let clash = h
        .service
        .create_booking(request(q, &d, "2025-06-01", "09:00"))
        .await;
    assert_matches!(clash, Err(BookingError::SlotConflict));

    h.service.cancel_booking(first.id).await.unwrap();

    let retry = h
        .service
        .create_booking(request(q, &d, "2025-06-01", "09:00"))
        .await
        .unwrap();
    assert_eq!(retry.system_booking_number.as_deref(), Some("2"));
    assert_eq!(retry.status, AppointmentStatus::Confirmed);
}

#[tokio::test]
async fn test_equivalent_date_and_time_spellings_share_a_slot() {
    let h = harness();
    let d = doctor("doc-d");

    h.service
        .create_booking(request(Uuid::new_v4(), &d, "2025-06-01", "2:30 PM"))
        .await
        .unwrap();

    let clash = h
        .service
        .create_booking(request(Uuid::new_v4(), &d, "June 1, 2025", "14:30"))
        .await;
    assert_matches!(clash, Err(BookingError::SlotConflict));
}

#[tokio::test]
async fn test_concurrent_identical_bookings_yield_one_winner() {
    let h = Arc::new(harness());
    let d = doctor("doc-d");

    let attempts = (0..8).map(|_| {
        let h = h.clone();
        let req = request(Uuid::new_v4(), &d, "2025-06-01", "10:00");
        tokio::spawn(async move { h.service.create_booking(req).await })
    });
    let results: Vec<_> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(BookingError::SlotConflict)))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(conflicts, 7);

    // Losers never reached number assignment.
    assert_eq!(
        h.sequences.current(SYSTEM_BOOKING_NUMBER_KEY).await.unwrap(),
        Some(1)
    );
}

#[tokio::test]
async fn test_booking_numbers_are_unique_and_never_reused() {
    let h = harness();
    let d = doctor("doc-d");

    let mut retired = Vec::new();
    for hour in 8..12 {
        let appt = h
            .service
            .create_booking(request(Uuid::new_v4(), &d, "2025-06-02", &format!("{:02}:00", hour)))
            .await
            .unwrap();
        retired.push(appt);
    }
    h.service.cancel_booking(retired[0].id).await.unwrap();
    h.service.delete_booking(retired[1].id).await.unwrap();

    let mut seen: HashSet<String> = retired
        .iter()
        .filter_map(|a| a.system_booking_number.clone())
        .collect();
    assert_eq!(seen.len(), 4);

    for hour in 12..18 {
        let appt = h
            .service
            .create_booking(request(Uuid::new_v4(), &d, "2025-06-02", &format!("{:02}:00", hour)))
            .await
            .unwrap();
        let number = appt.system_booking_number.unwrap();
        assert!(seen.insert(number.clone()), "booking number {} reused", number);
    }
}

#[tokio::test]
async fn test_patient_cannot_double_book_a_doctor_on_one_day() {
    let h = harness();
    let d = doctor("doc-d");
    let p = Uuid::new_v4();

    let first = h
        .service
        .create_booking(request(p, &d, "2025-06-03", "09:00"))
        .await
        .unwrap();
    assert_matches!(
        h.service.create_booking(request(p, &d, "2025-06-03", "11:00")).await,
        Err(BookingError::DuplicateDailyBooking)
    );

    // Another doctor, or the same doctor after cancelling, is fine.
    h.service
        .create_booking(request(p, &doctor("doc-e"), "2025-06-03", "11:00"))
        .await
        .unwrap();
    h.service.cancel_booking(first.id).await.unwrap();
    h.service
        .create_booking(request(p, &d, "2025-06-03", "11:00"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_ensure_booking_number_is_idempotent() {
    let h = harness();
    let appt = h
        .service
        .create_booking(request(Uuid::new_v4(), &doctor("doc-d"), "2025-06-04", "09:00"))
        .await
        .unwrap();
    let calls_after_create = h.sequences.calls();

    let once = h.service.ensure_booking_number(appt.clone()).await.unwrap();
    let twice = h.service.ensure_booking_number(once.clone()).await.unwrap();

    assert_eq!(once.system_booking_number, appt.system_booking_number);
    assert_eq!(twice.system_booking_number, appt.system_booking_number);
    assert_eq!(h.sequences.calls(), calls_after_create);
}

#[tokio::test]
async fn test_ensure_on_stale_copy_does_not_allocate_again() {
    let h = harness();
    h.sequences.fail_next(1);
    let appt = h
        .service
        .create_booking(request(Uuid::new_v4(), &doctor("doc-d"), "2025-06-04", "10:00"))
        .await
        .unwrap();
    assert_eq!(appt.system_booking_number, None, "allocator failure leaves it numberless");

    let repaired = h.service.ensure_booking_number(appt.clone()).await.unwrap();
    let number = repaired.system_booking_number.clone().unwrap();
    let calls = h.sequences.calls();

    // The caller still holds the numberless copy; the stored number wins.
    let again = h.service.ensure_booking_number(appt).await.unwrap();
    assert_eq!(again.system_booking_number.as_deref(), Some(number.as_str()));
    assert_eq!(h.sequences.calls(), calls);
}

#[tokio::test]
async fn test_reads_repair_missing_booking_numbers() {
    let h = harness();
    h.sequences.fail_next(1);
    let appt = h
        .service
        .create_booking(request(Uuid::new_v4(), &doctor("doc-d"), "2025-06-05", "09:00"))
        .await
        .unwrap();
    assert!(appt.system_booking_number.is_none());
    assert_eq!(appt.doctor_queue_number, Some(1), "queue number drawn independently");

    let read = h.service.get_appointment(appt.id).await.unwrap();
    assert!(read.has_valid_booking_number());
}

#[tokio::test]
async fn test_backfill_repairs_duplicate_queue_numbers_in_creation_order() {
    let h = harness();
    let d = doctor("doc-d");

    let mut ids = Vec::new();
    for time in ["09:00", "09:30", "10:00"] {
        let appt = h
            .service
            .create_booking(request(Uuid::new_v4(), &d, "2025-06-06", time))
            .await
            .unwrap();
        ids.push(appt.id);
    }

    // A prior fault left the queue as [1,3,3].
    h.store
        .patch_derived(ids[1], &DerivedPatch::queue_number(3))
        .await
        .unwrap();

    let report = h.service.ensure_doctor_queue_backfill("doc-d").await.unwrap();
    assert_eq!(report.groups_repaired, 1);
    assert_eq!(report.renumbered, 1);

    let listed = h.store.list_by_doctor("doc-d", None).await.unwrap();
    let order: Vec<Uuid> = listed.iter().map(|a| a.id).collect();
    let numbers: Vec<Option<i64>> = listed.iter().map(|a| a.doctor_queue_number).collect();
    assert_eq!(order, ids);
    assert_eq!(numbers, vec![Some(1), Some(2), Some(3)]);

    assert_eq!(
        h.sequences.current("doctorQueueNumber:doc-d").await.unwrap(),
        Some(3)
    );
}

#[tokio::test]
async fn test_backfill_densifies_after_gaps_and_clears_changed_qr() {
    let h = harness();
    let d = doctor("doc-d");

    let mut appts = Vec::new();
    for time in ["09:00", "09:30", "10:00", "10:30"] {
        appts.push(
            h.service
                .create_booking(request(Uuid::new_v4(), &d, "2025-06-07", time))
                .await
                .unwrap(),
        );
    }
    for appt in &appts {
        h.service
            .store_qr_artifact(
                appt.id,
                StoreQrRequest {
                    qr_payload: appt.qr_payload_source(),
                    qr_code: "qr".to_string(),
                },
            )
            .await
            .unwrap();
    }

    // Unnumbered row plus a number past N.
    h.store
        .patch_derived(
            appts[1].id,
            &DerivedPatch {
                doctor_queue_number: Some(None),
                ..DerivedPatch::default()
            },
        )
        .await
        .unwrap();
    h.store
        .patch_derived(appts[3].id, &DerivedPatch::queue_number(9))
        .await
        .unwrap();

    h.service.ensure_doctor_queue_backfill("doc-d").await.unwrap();

    let listed = h.store.list_by_doctor("doc-d", None).await.unwrap();
    let numbers: Vec<i64> = listed.iter().filter_map(|a| a.doctor_queue_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    assert!(listed[0].has_fresh_qr(), "unchanged row keeps its QR");
    assert!(listed[2].has_fresh_qr());
    assert!(listed[1].qr_code.is_none());
    assert!(listed[3].qr_code.is_none());

    let clean = h.service.ensure_doctor_queue_backfill("doc-d").await.unwrap();
    assert!(clean.is_clean());
}

#[tokio::test]
async fn test_listing_a_doctor_heals_the_queue_first() {
    let h = harness();
    let d = doctor("doc-d");
    let first = h
        .service
        .create_booking(request(Uuid::new_v4(), &d, "2025-06-08", "09:00"))
        .await
        .unwrap();
    h.service
        .create_booking(request(Uuid::new_v4(), &d, "2025-06-08", "09:30"))
        .await
        .unwrap();
    h.store
        .patch_derived(first.id, &DerivedPatch::queue_number(2))
        .await
        .unwrap();

    let listed = h.service.list_doctor_appointments("doc-d").await.unwrap();
    let numbers: Vec<Option<i64>> = listed.iter().map(|a| a.doctor_queue_number).collect();
    assert_eq!(numbers, vec![Some(1), Some(2)]);
}

#[tokio::test]
async fn test_per_date_scope_numbers_each_day_separately() {
    let h = harness_with(AppConfig {
        queue_scope: QueueScope::PerDoctorDate,
        ..AppConfig::default()
    });
    let d = doctor("doc-d");

    let a = h
        .service
        .create_booking(request(Uuid::new_v4(), &d, "2025-06-09", "09:00"))
        .await
        .unwrap();
    let b = h
        .service
        .create_booking(request(Uuid::new_v4(), &d, "2025-06-10", "09:00"))
        .await
        .unwrap();
    let c = h
        .service
        .create_booking(request(Uuid::new_v4(), &d, "2025-06-10", "09:30"))
        .await
        .unwrap();

    assert_eq!(a.doctor_queue_number, Some(1));
    assert_eq!(b.doctor_queue_number, Some(1));
    assert_eq!(c.doctor_queue_number, Some(2));
    assert_eq!(
        h.service.queue().scope_key("doc-d", "2025-06-10"),
        "doctorQueueNumber:doc-d:2025-06-10"
    );

    let report = h.service.ensure_doctor_queue_backfill("doc-d").await.unwrap();
    assert_eq!(report.groups_checked, 2);
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_patient_booking_waits_for_acceptance() {
    let h = harness();
    let d = doctor("doc-d");
    let mut req = request(Uuid::new_v4(), &d, "2025-06-11", "09:00");
    req.origin = BookingOrigin::Patient;

    let pending = h.service.create_booking(req).await.unwrap();
    assert_eq!(pending.status, AppointmentStatus::Pending);
    assert!(pending.has_valid_booking_number());

    let confirmed = h.service.accept_pending_booking(pending.id, None).await.unwrap();
    assert_eq!(confirmed.status, AppointmentStatus::Confirmed);
    assert_eq!(confirmed.system_booking_number, pending.system_booking_number);
    assert_eq!(confirmed.doctor_queue_number, pending.doctor_queue_number);

    assert_matches!(
        h.service.accept_pending_booking(pending.id, None).await,
        Err(BookingError::InvalidStatusTransition { .. })
    );
}

#[tokio::test]
async fn test_accepting_into_a_taken_slot_conflicts() {
    let h = harness();
    let d = doctor("doc-d");
    let queue = DoctorIdentity::specialty_queue("General Practice", "general-practice");

    let mut req = request(Uuid::new_v4(), &queue, "2025-06-12", "09:00");
    req.origin = BookingOrigin::Patient;
    let queued = h.service.create_booking(req).await.unwrap();
    assert_eq!(queued.status, AppointmentStatus::Pending);
    assert_eq!(queued.doctor_queue_number, None);

    // Meanwhile the doctor books that slot directly.
    h.service
        .create_booking(request(Uuid::new_v4(), &d, "2025-06-12", "09:00"))
        .await
        .unwrap();

    assert_matches!(
        h.service.accept_pending_booking(queued.id, Some(d.clone())).await,
        Err(BookingError::SlotConflict)
    );
    let unchanged = h.service.get_appointment(queued.id).await.unwrap();
    assert_eq!(unchanged.status, AppointmentStatus::Pending);
    assert_eq!(unchanged.doctor_id, "specialty:general-practice");
}

#[tokio::test]
async fn test_accepting_a_queue_booking_binds_the_doctor() {
    let h = harness();
    let d = doctor("doc-d");
    let queue = DoctorIdentity::specialty_queue("General Practice", "general-practice");

    let mut req = request(Uuid::new_v4(), &queue, "2025-06-13", "09:00");
    req.origin = BookingOrigin::Patient;
    let queued = h.service.create_booking(req).await.unwrap();

    assert_matches!(
        h.service.accept_pending_booking(queued.id, None).await,
        Err(BookingError::Validation(_))
    );

    let accepted = h
        .service
        .accept_pending_booking(queued.id, Some(d.clone()))
        .await
        .unwrap();
    assert_eq!(accepted.doctor_id, "doc-d");
    assert_eq!(accepted.doctor_profile_id, d.profile_id);
    assert_eq!(accepted.doctor_queue_number, Some(1));
    assert_eq!(accepted.system_booking_number, queued.system_booking_number);
}

#[tokio::test]
async fn test_cancel_keeps_numbers_and_drops_qr() {
    let h = harness();
    let appt = h
        .service
        .create_booking(request(Uuid::new_v4(), &doctor("doc-d"), "2025-06-14", "09:00"))
        .await
        .unwrap();
    h.service
        .store_qr_artifact(
            appt.id,
            StoreQrRequest {
                qr_payload: appt.qr_payload_source(),
                qr_code: "qr".to_string(),
            },
        )
        .await
        .unwrap();

    let cancelled = h.service.cancel_booking(appt.id).await.unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
    assert_eq!(cancelled.system_booking_number, appt.system_booking_number);
    assert_eq!(cancelled.doctor_queue_number, appt.doctor_queue_number);
    assert!(cancelled.qr_payload.is_none() && cancelled.qr_code.is_none());

    assert_matches!(
        h.service.cancel_booking(appt.id).await,
        Err(BookingError::InvalidStatusTransition { .. })
    );
}

#[tokio::test]
async fn test_stale_qr_payload_is_rejected() {
    let h = harness();
    let appt = h
        .service
        .create_booking(request(Uuid::new_v4(), &doctor("doc-d"), "2025-06-15", "09:00"))
        .await
        .unwrap();

    let mut stale = appt.clone();
    stale.status = AppointmentStatus::Pending;
    assert_matches!(
        h.service
            .store_qr_artifact(
                appt.id,
                StoreQrRequest {
                    qr_payload: stale.qr_payload_source(),
                    qr_code: "qr".to_string(),
                },
            )
            .await,
        Err(BookingError::Validation(_))
    );
}

#[tokio::test]
async fn test_complete_records_doctor_note() {
    let h = harness();
    let appt = h
        .service
        .create_booking(request(Uuid::new_v4(), &doctor("doc-d"), "2025-06-16", "09:00"))
        .await
        .unwrap();

    let done = h
        .service
        .complete_booking(
            appt.id,
            CompleteBookingRequest {
                doctor_note: Some("Rest for two days".to_string()),
                prescriptions: vec!["Paracetamol 500mg".to_string()],
            },
        )
        .await
        .unwrap();
    assert_eq!(done.status, AppointmentStatus::Completed);
    assert_eq!(done.doctor_note.as_deref(), Some("Rest for two days"));
    assert_eq!(done.prescriptions.len(), 1);

    // Completed frees the slot for a new booking.
    h.service
        .create_booking(request(Uuid::new_v4(), &doctor("doc-d"), "2025-06-16", "09:00"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_missing_appointments_are_not_found() {
    let h = harness();
    let missing = Uuid::new_v4();
    assert_matches!(h.service.get_appointment(missing).await, Err(BookingError::NotFound(id)) if id == missing);
    assert_matches!(h.service.cancel_booking(missing).await, Err(BookingError::NotFound(_)));
    assert_matches!(h.service.delete_booking(missing).await, Err(BookingError::NotFound(_)));
    assert_matches!(
        h.service.accept_pending_booking(missing, None).await,
        Err(BookingError::NotFound(_))
    );
}

#[tokio::test]
async fn test_renumber_all_restarts_from_one_in_creation_order() {
    let h = harness();
    let d = doctor("doc-d");

    let mut ids = Vec::new();
    for time in ["09:00", "10:00", "11:00"] {
        let appt = h
            .service
            .create_booking(request(Uuid::new_v4(), &d, "2025-06-17", time))
            .await
            .unwrap();
        ids.push(appt.id);
    }
    // Legacy numbers out of order.
    h.sequences.resync(SYSTEM_BOOKING_NUMBER_KEY, 500).await.unwrap();
    // The store refuses a number another row holds.
    h.store
        .patch_derived(ids[0], &DerivedPatch::booking_number("3".to_string()))
        .await
        .unwrap_err();
    h.store
        .patch_derived(ids[0], &DerivedPatch::booking_number("400".to_string()))
        .await
        .unwrap();

    let max = h.service.renumber_all_booking_numbers().await.unwrap();
    assert_eq!(max, 3);

    let all = h.store.list_all().await.unwrap();
    let numbers: Vec<Option<&str>> = all.iter().map(|a| a.system_booking_number.as_deref()).collect();
    assert_eq!(numbers, vec![Some("1"), Some("2"), Some("3")]);
    assert_eq!(
        h.sequences.current(SYSTEM_BOOKING_NUMBER_KEY).await.unwrap(),
        Some(3)
    );

    let next = h
        .service
        .create_booking(request(Uuid::new_v4(), &d, "2025-06-17", "12:00"))
        .await
        .unwrap();
    assert_eq!(next.system_booking_number.as_deref(), Some("4"));
}

#[tokio::test]
async fn test_invalid_requests_are_rejected_before_storage() {
    let h = harness();
    let d = doctor("doc-d");

    assert_matches!(
        h.service.create_booking(request(Uuid::new_v4(), &d, "someday", "09:00")).await,
        Err(BookingError::Validation(_))
    );
    assert_matches!(
        h.service.create_booking(request(Uuid::new_v4(), &d, "2025-06-18", "noon")).await,
        Err(BookingError::Validation(_))
    );

    let orphan = DoctorIdentity {
        doctor_id: "doc-x".to_string(),
        ..DoctorIdentity::default()
    };
    assert_matches!(
        h.service.create_booking(request(Uuid::new_v4(), &orphan, "2025-06-18", "09:00")).await,
        Err(BookingError::Validation(_))
    );
    assert_eq!(h.sequences.calls(), 0);
}

#[tokio::test]
async fn test_backfill_all_doctors_covers_every_linked_doctor() {
    let h = harness();
    for id in ["doc-a", "doc-b"] {
        h.service
            .create_booking(request(Uuid::new_v4(), &doctor(id), "2025-06-19", "09:00"))
            .await
            .unwrap();
    }
    let queue = DoctorIdentity::specialty_queue("Dermatology", "dermatology");
    h.service
        .create_booking(request(Uuid::new_v4(), &queue, "2025-06-19", "09:00"))
        .await
        .unwrap();

    let reports = h.service.backfill_all_doctors().await.unwrap();
    let doctors: Vec<&str> = reports.iter().map(|r| r.doctor_id.as_str()).collect();
    assert_eq!(doctors, vec!["doc-a", "doc-b"]);
    assert!(reports.iter().all(|r| r.is_clean()));
}

async fn numberless_booking(h: &Harness, time: &str) -> Appointment {
    h.sequences.fail_next(1);
    let appt = h
        .service
        .create_booking(request(Uuid::new_v4(), &doctor("doc-d"), "2025-06-20", time))
        .await
        .unwrap();
    assert_eq!(appt.system_booking_number, None);
    appt
}

#[tokio::test]
async fn test_concurrent_ensure_agrees_on_one_number() {
    let h = harness();
    let appt = numberless_booking(&h, "09:00").await;
    h.sequences.slow_down(Duration::from_millis(20));

    let (a, b) = tokio::join!(
        h.service.ensure_booking_number(appt.clone()),
        h.service.ensure_booking_number(appt.clone())
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    let stored = h.store.get(appt.id).await.unwrap().unwrap();

    assert!(stored.has_valid_booking_number());
    assert_eq!(a.system_booking_number, stored.system_booking_number);
    assert_eq!(b.system_booking_number, stored.system_booking_number);
}

#[tokio::test]
async fn test_listing_during_create_returns_the_stored_number() {
    let h = harness();
    let p = Uuid::new_v4();
    h.sequences.slow_down(Duration::from_millis(20));

    let (created, listed) = tokio::join!(
        h.service
            .create_booking(request(p, &doctor("doc-d"), "2025-06-20", "10:00")),
        async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            h.service.list_patient_appointments(p).await
        }
    );
    let created = created.unwrap();
    let listed = listed.unwrap();
    let stored = h.store.get(created.id).await.unwrap().unwrap();

    assert!(stored.has_valid_booking_number());
    assert_eq!(created.system_booking_number, stored.system_booking_number);
    if let Some(row) = listed.iter().find(|a| a.id == created.id) {
        assert_eq!(row.system_booking_number, stored.system_booking_number);
    }
}

#[tokio::test]
async fn test_cancel_during_read_repair_keeps_the_number() {
    let h = harness();
    let appt = numberless_booking(&h, "11:00").await;
    h.sequences.slow_down(Duration::from_millis(20));

    let (read, cancelled) = tokio::join!(
        h.service.get_appointment(appt.id),
        async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            h.service.cancel_booking(appt.id).await
        }
    );
    let read = read.unwrap();
    cancelled.unwrap();

    let stored = h.store.get(appt.id).await.unwrap().unwrap();
    assert_eq!(stored.status, AppointmentStatus::Cancelled);
    assert!(stored.has_valid_booking_number(), "cancel must not erase the repair");
    assert_eq!(stored.system_booking_number, read.system_booking_number);
}

#[tokio::test]
async fn test_update_from_stale_copy_keeps_stored_numbers() {
    let h = harness();
    let appt = h
        .service
        .create_booking(request(Uuid::new_v4(), &doctor("doc-d"), "2025-06-21", "09:00"))
        .await
        .unwrap();

    let mut stale = appt.clone();
    h.store
        .patch_derived(appt.id, &DerivedPatch::booking_number("42".to_string()))
        .await
        .unwrap();

    stale.status = AppointmentStatus::Cancelled;
    stale.system_booking_number = None;
    stale.doctor_queue_number = None;
    let updated = h.store.update(&stale).await.unwrap();

    assert_eq!(updated.status, AppointmentStatus::Cancelled);
    assert_eq!(updated.system_booking_number.as_deref(), Some("42"));
    assert_eq!(updated.doctor_queue_number, appt.doctor_queue_number);
}

#[tokio::test]
async fn test_specialty_queue_bookings_share_a_time_until_accepted() {
    let h = harness();
    let d = doctor("doc-d");
    let queue = DoctorIdentity::specialty_queue("General Practice", "general-practice");

    let mut queued = Vec::new();
    for _ in 0..2 {
        let mut req = request(Uuid::new_v4(), &queue, "2025-06-22", "09:00");
        req.origin = BookingOrigin::Patient;
        queued.push(h.service.create_booking(req).await.unwrap());
    }

    h.service
        .accept_pending_booking(queued[0].id, Some(d.clone()))
        .await
        .unwrap();
    assert_matches!(
        h.service.accept_pending_booking(queued[1].id, Some(d.clone())).await,
        Err(BookingError::SlotConflict)
    );
}
