use reqwest::{
    Client,
    header::{HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION},
    Method, StatusCode,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use shared_config::AppConfig;

/// Postgres SQLSTATE for `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Unique constraint {constraint} violated: {message}")]
    UniqueViolation { constraint: String, message: String },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid response payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl DatabaseError {
    /// Name of the violated unique constraint, if this is a unique violation.
    pub fn violated_constraint(&self) -> Option<&str> {
        match self {
            DatabaseError::UniqueViolation { constraint, .. } => Some(constraint),
            _ => None,
        }
    }

    fn from_response(status: StatusCode, body: &str) -> Self {
        let parsed: Option<Value> = serde_json::from_str(body).ok();
        let code = parsed
            .as_ref()
            .and_then(|v| v.get("code"))
            .and_then(Value::as_str);
        let message = parsed
            .as_ref()
            .and_then(|v| v.get("message"))
            .and_then(Value::as_str)
            .unwrap_or(body)
            .to_string();

        if code == Some(UNIQUE_VIOLATION) {
            let constraint = constraint_name(&message).unwrap_or_default();
            return DatabaseError::UniqueViolation { constraint, message };
        }

        match status.as_u16() {
            401 | 403 => DatabaseError::Auth(message),
            404 => DatabaseError::NotFound(message),
            other => DatabaseError::Api { status: other, message },
        }
    }
}

/// Extracts `name` from `duplicate key value violates unique constraint "name"`.
fn constraint_name(message: &str) -> Option<String> {
    let start = message.find('"')? + 1;
    let len = message[start..].find('"')?;
    Some(message[start..start + len].to_string())
}

pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
    /// Sent when a call carries no caller token (store and background jobs).
    service_token: Option<String>,
}

impl SupabaseClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.supabase_url.trim_end_matches('/').to_string(),
            anon_key: config.supabase_anon_key.clone(),
            service_token: config.supabase_service_key.clone(),
        }
    }

    fn get_headers(&self, auth_token: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();

        match HeaderValue::from_str(&self.anon_key) {
            Ok(value) => {
                headers.insert("apikey", value);
            }
            Err(_) => warn!("Supabase anon key is not a valid header value"),
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = auth_token.or(self.service_token.as_deref()) {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }

        headers
    }

    pub async fn request<T>(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Option<Value>,
    ) -> Result<T, DatabaseError>
    where
        T: DeserializeOwned,
    {
        self.request_with_headers(method, path, auth_token, body, None).await
    }

    pub async fn request_with_headers<T>(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Option<Value>,
        extra_headers: Option<HeaderMap>,
    ) -> Result<T, DatabaseError>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making {} request to {}", method, url);

        let mut headers = self.get_headers(auth_token);
        if let Some(extra) = extra_headers {
            headers.extend(extra);
        }

        let mut req = self.client.request(method, &url).headers(headers);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            let err = DatabaseError::from_response(status, &error_text);
            match err {
                DatabaseError::UniqueViolation { .. } => {
                    debug!("Unique violation ({}): {}", status, error_text)
                }
                _ => error!("API error ({}): {}", status, error_text),
            }
            return Err(err);
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            // `Prefer: return=minimal` and 204 responses carry no body.
            return Ok(serde_json::from_value(Value::Null)?);
        }

        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Calls a Postgres function exposed at `/rest/v1/rpc/{function}`.
    pub async fn rpc<T>(
        &self,
        function: &str,
        args: Value,
        auth_token: Option<&str>,
    ) -> Result<T, DatabaseError>
    where
        T: DeserializeOwned,
    {
        let path = format!("/rest/v1/rpc/{}", function);
        self.request(Method::POST, &path, auth_token, Some(args)).await
    }
}
