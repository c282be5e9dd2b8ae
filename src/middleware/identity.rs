use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};

use crate::error::AppError;
use crate::models::{Identity, UserRole};
use crate::AppState;

/// External authentication boundary: something upstream has already verified
/// the caller and vouches for a `(user_id, role)` pair per request.
pub trait IdentityProvider: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AppError>;
}

/// Trusts identity headers set by an authenticating reverse proxy.
pub struct ProxyHeaderIdentity;

impl IdentityProvider for ProxyHeaderIdentity {
    fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AppError> {
        let user_id = headers
            .get("X-Auth-User")
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::Unauthorized("Missing identity".to_string()))?;

        let role = headers
            .get("X-Auth-Role")
            .and_then(|v| v.to_str().ok())
            .map(UserRole::from_str)
            .unwrap_or(UserRole::User);

        Ok(Identity {
            user_id: user_id.to_string(),
            role,
        })
    }
}

/// Identity middleware for routes that require an authenticated caller
pub async fn identity_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let identity = state.identity.authenticate(request.headers())?;
    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extracts_user_and_role() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Auth-User", HeaderValue::from_static("u-42"));
        headers.insert("X-Auth-Role", HeaderValue::from_static("admin"));

        let identity = ProxyHeaderIdentity.authenticate(&headers).unwrap();
        assert_eq!(identity.user_id, "u-42");
        assert!(identity.is_admin());
    }

    #[test]
    fn missing_user_is_unauthorized() {
        let headers = HeaderMap::new();
        let err = ProxyHeaderIdentity.authenticate(&headers).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[test]
    fn role_defaults_to_user() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Auth-User", HeaderValue::from_static("u-7"));

        let identity = ProxyHeaderIdentity.authenticate(&headers).unwrap();
        assert_eq!(identity.role, UserRole::User);
    }
}
