use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use urlencoding::encode;
use uuid::Uuid;

use shared_database::SupabaseClient;

use super::{
    AppointmentStore, DerivedExpectation, DerivedPatch, QrUpdate, QueueGroupStats, StoreError,
};
use crate::models::{Appointment, SlotKey};

const TABLE: &str = "/rest/v1/appointments";

/// Matches PostgREST's default `max-rows`; a shorter page ends a scan.
const DEFAULT_PAGE_SIZE: usize = 1000;

/// Appointments in Postgres through PostgREST. The unique indexes from
/// `migrations/001_booking_core.sql` are the constraint enforcement.
pub struct SupabaseAppointmentStore {
    supabase: Arc<SupabaseClient>,
    page_size: usize,
}

impl SupabaseAppointmentStore {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self {
            supabase,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Page size for full scans; must not exceed the server's `max-rows`.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn representation_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Prefer", HeaderValue::from_static("return=representation"));
        headers
    }

    async fn select(&self, query: &str) -> Result<Vec<Appointment>, StoreError> {
        let path = format!("{}?{}", TABLE, query);
        let rows: Vec<Appointment> = self
            .supabase
            .request(Method::GET, &path, None, None)
            .await?;
        Ok(rows)
    }

    /// Reads every matching row, one `limit`/`offset` page at a time, so the
    /// server's row cap never truncates a scan. `query` must carry a total order.
    async fn select_all(&self, query: &str) -> Result<Vec<Appointment>, StoreError> {
        let mut rows = Vec::new();
        loop {
            let page = self
                .select(&format!(
                    "{}&limit={}&offset={}",
                    query,
                    self.page_size,
                    rows.len()
                ))
                .await?;
            let last = page.len() < self.page_size;
            rows.extend(page);
            if last {
                break;
            }
        }
        debug!("Scanned {} appointment(s) for {}", rows.len(), query);
        Ok(rows)
    }

    /// PATCHes the row `id` further filtered by `conditions`; returns what matched.
    async fn patch_rows(
        &self,
        id: Uuid,
        conditions: &str,
        body: Value,
    ) -> Result<Vec<Appointment>, StoreError> {
        let path = format!("{}?id=eq.{}{}", TABLE, id, conditions);
        let rows: Vec<Appointment> = self
            .supabase
            .request_with_headers(
                Method::PATCH,
                &path,
                None,
                Some(body),
                Some(Self::representation_headers()),
            )
            .await?;
        Ok(rows)
    }
}

fn creation_order() -> &'static str {
    // `id` breaks ties so pages never overlap.
    "order=created_at.asc,id.asc"
}

fn expectation_filter(expected: &DerivedExpectation) -> String {
    let mut filter = String::new();
    match &expected.system_booking_number {
        None => {}
        Some(None) => filter.push_str("&system_booking_number=is.null"),
        Some(Some(number)) => {
            filter.push_str(&format!("&system_booking_number=eq.{}", encode(number)))
        }
    }
    match expected.doctor_queue_number {
        None => {}
        Some(None) => filter.push_str("&doctor_queue_number=is.null"),
        Some(Some(number)) => filter.push_str(&format!("&doctor_queue_number=eq.{}", number)),
    }
    filter
}

fn exclude_filter(exclude: Option<Uuid>) -> String {
    exclude
        .map(|id| format!("&id=neq.{}", id))
        .unwrap_or_default()
}

/// Columns a lifecycle update writes. Numbers are never among them, and the QR
/// cache can only be cleared here.
fn mutable_columns(appointment: &Appointment) -> Value {
    let mut body = json!({
        "doctor_id": appointment.doctor_id,
        "doctor_profile_id": appointment.doctor_profile_id,
        "doctor_name": appointment.doctor_name,
        "doctor_role": appointment.doctor_role,
        "specialty": appointment.specialty,
        "specialty_slug": appointment.specialty_slug,
        "date": appointment.date,
        "canonical_date": appointment.canonical_date,
        "time": appointment.time,
        "canonical_time": appointment.canonical_time,
        "status": appointment.status,
        "notes": appointment.notes,
        "doctor_note": appointment.doctor_note,
        "prescriptions": appointment.prescriptions,
        "updated_at": chrono::Utc::now(),
    });
    if appointment.qr_payload.is_none() && appointment.qr_code.is_none() {
        body["qr_payload"] = Value::Null;
        body["qr_code"] = Value::Null;
    }
    body
}

fn derived_columns(patch: &DerivedPatch) -> Value {
    let mut body = Map::new();
    if let Some(number) = &patch.system_booking_number {
        body.insert("system_booking_number".to_string(), json!(number));
    }
    if let Some(number) = &patch.doctor_queue_number {
        body.insert("doctor_queue_number".to_string(), json!(number));
    }
    match &patch.qr {
        QrUpdate::Keep => {}
        QrUpdate::Clear => {
            body.insert("qr_payload".to_string(), Value::Null);
            body.insert("qr_code".to_string(), Value::Null);
        }
        QrUpdate::Set { payload, code } => {
            body.insert("qr_payload".to_string(), json!(payload));
            body.insert("qr_code".to_string(), json!(code));
        }
    }
    body.insert("updated_at".to_string(), json!(chrono::Utc::now()));
    Value::Object(body)
}

#[async_trait]
impl AppointmentStore for SupabaseAppointmentStore {
    async fn insert(&self, appointment: &Appointment) -> Result<Appointment, StoreError> {
        let body = serde_json::to_value(appointment)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let rows: Vec<Appointment> = self
            .supabase
            .request_with_headers(
                Method::POST,
                TABLE,
                None,
                Some(body),
                Some(Self::representation_headers()),
            )
            .await?;

        rows.into_iter().next().ok_or_else(|| {
            warn!("Insert of appointment {} returned no representation", appointment.id);
            StoreError::Backend("Insert returned no row".to_string())
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<Appointment>, StoreError> {
        let rows = self.select(&format!("id=eq.{}", id)).await?;
        Ok(rows.into_iter().next())
    }

    async fn update(&self, appointment: &Appointment) -> Result<Appointment, StoreError> {
        self.patch_rows(appointment.id, "", mutable_columns(appointment))
            .await?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound(appointment.id))
    }

    async fn patch_derived(&self, id: Uuid, patch: &DerivedPatch) -> Result<Appointment, StoreError> {
        self.patch_rows(id, "", derived_columns(patch))
            .await?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound(id))
    }

    async fn patch_derived_if(
        &self,
        id: Uuid,
        patch: &DerivedPatch,
        expected: &DerivedExpectation,
    ) -> Result<Option<Appointment>, StoreError> {
        let rows = self
            .patch_rows(id, &expectation_filter(expected), derived_columns(patch))
            .await?;
        if let Some(patched) = rows.into_iter().next() {
            return Ok(Some(patched));
        }
        // Nothing matched: either the row is gone or its columns moved on.
        match self.get(id).await? {
            Some(_) => {
                debug!("Derived patch of {} skipped, row changed underneath", id);
                Ok(None)
            }
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let path = format!("{}?id=eq.{}", TABLE, id);
        let rows: Vec<Appointment> = self
            .supabase
            .request_with_headers(
                Method::DELETE,
                &path,
                None,
                None,
                Some(Self::representation_headers()),
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn find_active_in_slot(
        &self,
        slot: &SlotKey,
        exclude: Option<Uuid>,
    ) -> Result<Option<Appointment>, StoreError> {
        let query = format!(
            "doctor_id=eq.{}&canonical_date=eq.{}&canonical_time=eq.{}&status=in.(pending,confirmed)&doctor_profile_id=not.is.null{}&limit=1",
            encode(&slot.doctor_id),
            encode(&slot.canonical_date),
            encode(&slot.canonical_time),
            exclude_filter(exclude),
        );
        Ok(self.select(&query).await?.into_iter().next())
    }

    async fn find_patient_day_booking(
        &self,
        patient_id: Uuid,
        doctor_id: &str,
        canonical_date: &str,
        exclude: Option<Uuid>,
    ) -> Result<Option<Appointment>, StoreError> {
        let query = format!(
            "patient_id=eq.{}&doctor_id=eq.{}&canonical_date=eq.{}&status=neq.cancelled{}&limit=1",
            patient_id,
            encode(doctor_id),
            encode(canonical_date),
            exclude_filter(exclude),
        );
        Ok(self.select(&query).await?.into_iter().next())
    }

    async fn list_by_doctor(
        &self,
        doctor_id: &str,
        canonical_date: Option<&str>,
    ) -> Result<Vec<Appointment>, StoreError> {
        let date_filter = canonical_date
            .map(|date| format!("&canonical_date=eq.{}", encode(date)))
            .unwrap_or_default();
        let query = format!(
            "doctor_id=eq.{}{}&{}",
            encode(doctor_id),
            date_filter,
            creation_order()
        );
        self.select_all(&query).await
    }

    async fn list_by_patient(&self, patient_id: Uuid) -> Result<Vec<Appointment>, StoreError> {
        self.select_all(&format!("patient_id=eq.{}&{}", patient_id, creation_order()))
            .await
    }

    async fn list_all(&self) -> Result<Vec<Appointment>, StoreError> {
        self.select_all(creation_order()).await
    }

    async fn queue_stats(
        &self,
        doctor_id: &str,
        per_date: bool,
    ) -> Result<Vec<QueueGroupStats>, StoreError> {
        let stats: Vec<QueueGroupStats> = self
            .supabase
            .rpc(
                "doctor_queue_stats",
                json!({ "p_doctor_id": doctor_id, "p_per_date": per_date }),
                None,
            )
            .await?;
        debug!("Queue stats for {}: {} group(s)", doctor_id, stats.len());
        Ok(stats)
    }

    async fn doctor_ids(&self) -> Result<Vec<String>, StoreError> {
        // One array value, so the row cap does not apply.
        let ids: Option<Vec<String>> = self
            .supabase
            .rpc("booked_doctor_ids", json!({}), None)
            .await?;
        Ok(ids.unwrap_or_default())
    }
}
