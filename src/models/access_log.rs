use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Outcome of an access attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessOutcome {
    Granted,
    DeniedExpired,
    DeniedQuotaExhausted,
    DeniedPassword,
}

impl AccessOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessOutcome::Granted => "granted",
            AccessOutcome::DeniedExpired => "denied_expired",
            AccessOutcome::DeniedQuotaExhausted => "denied_quota_exhausted",
            AccessOutcome::DeniedPassword => "denied_password",
        }
    }

}

/// Append-only audit record. Never mutated or deleted individually.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AccessLogEntry {
    pub id: String,
    pub file_id: String,
    pub ip: String,
    pub user_agent: Option<String>,
    pub accessed_by: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub outcome: String,
    pub viewed_at: String,
}

/// Best-effort IP geolocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoLocation {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

/// Per-request context carried into the access path for auditing
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub ip: String,
    pub user_agent: Option<String>,
    pub accessed_by: Option<String>,
    pub location: Option<GeoLocation>,
}
