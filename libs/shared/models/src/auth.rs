use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub exp: Option<u64>,
    pub email: Option<String>,
    pub role: Option<String>,
    pub app_metadata: Option<serde_json::Value>,
    pub user_metadata: Option<serde_json::Value>,
    pub aud: Option<String>,
    pub iat: Option<u64>,
}

/// Clinic role carried in the token's `role` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Patient,
    Doctor,
    Admin,
}

impl Role {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "patient" => Some(Role::Patient),
            "doctor" => Some(Role::Doctor),
            "admin" | "super_admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub role: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn clinic_role(&self) -> Option<Role> {
        self.role.as_deref().and_then(Role::parse)
    }

    pub fn is_admin(&self) -> bool {
        self.clinic_role() == Some(Role::Admin)
    }

    pub fn is_doctor(&self) -> bool {
        self.clinic_role() == Some(Role::Doctor)
    }

    /// Doctor identifier for doctor accounts: `metadata.doctor_id`, else the user id.
    pub fn doctor_id(&self) -> Option<String> {
        if !self.is_doctor() {
            return None;
        }
        let from_metadata = self
            .metadata
            .as_ref()
            .and_then(|m| m.get("doctor_id"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Some(from_metadata.unwrap_or_else(|| self.id.clone()))
    }
}
