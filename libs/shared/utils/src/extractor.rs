use std::sync::Arc;

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};
use headers::{authorization::Bearer, Authorization, HeaderMapExt};

use shared_config::AppConfig;
use shared_models::auth::{Role, User};
use shared_models::error::AppError;

use crate::jwt::validate_token;

/// Validates the bearer token and stores the caller as an `Extension<User>`.
pub async fn auth_middleware(
    State(config): State<Arc<AppConfig>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let auth = request
        .headers()
        .typed_get::<Authorization<Bearer>>()
        .ok_or_else(|| AppError::Auth("Missing or malformed bearer token".to_string()))?;

    let user = validate_token(auth.token(), &config.supabase_jwt_secret)
        .map_err(|e| AppError::Auth(e.to_string()))?;

    request.extensions_mut().insert(user);

    Ok(next.run(request).await)
}

/// Rejects callers whose role is not in `allowed`.
pub fn require_role(user: &User, allowed: &[Role]) -> Result<Role, AppError> {
    match user.clinic_role() {
        Some(role) if allowed.contains(&role) => Ok(role),
        _ => Err(AppError::Forbidden(format!(
            "Role {} may not perform this action",
            user.role.as_deref().unwrap_or("unknown")
        ))),
    }
}
