use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::config::GeoIpConfig;
use crate::db::Database;
use crate::error::Result;
use crate::models::{AccessLogEntry, AccessOutcome, GeoLocation, RequestMeta};

/// Append-only audit trail for access attempts
pub struct AccessLogService;

#[derive(Debug, Deserialize)]
struct GeoIpResponse {
    status: Option<String>,
    country: Option<String>,
    #[serde(rename = "regionName")]
    region_name: Option<String>,
    city: Option<String>,
}

impl AccessLogService {
    /// Record one access attempt. Entries are immutable once written.
    pub async fn record(
        db: &Database,
        file_id: &str,
        meta: &RequestMeta,
        outcome: AccessOutcome,
    ) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let location = meta.location.clone().unwrap_or_default();

        sqlx::query(
            r#"
            INSERT INTO access_logs (id, file_id, ip, user_agent, accessed_by, country, region, city, outcome, viewed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(file_id)
        .bind(&meta.ip)
        .bind(&meta.user_agent)
        .bind(&meta.accessed_by)
        .bind(&location.country)
        .bind(&location.region)
        .bind(&location.city)
        .bind(outcome.as_str())
        .bind(&now)
        .execute(db.pool())
        .await?;

        Ok(())
    }

    /// Best-effort IP geolocation. Failures never block the access attempt.
    pub async fn lookup_location(config: &GeoIpConfig, ip: &str) -> Option<GeoLocation> {
        if !config.enabled || ip.is_empty() {
            return None;
        }

        let url = format!("{}/{}", config.endpoint.trim_end_matches('/'), ip);
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.timeout_ms))
            .build()
            .ok()?;

        match client.get(&url).send().await {
            Ok(resp) => match resp.json::<GeoIpResponse>().await {
                Ok(geo) => {
                    if geo.status.as_deref() == Some("fail") {
                        return None;
                    }
                    Some(GeoLocation {
                        country: geo.country,
                        region: geo.region_name,
                        city: geo.city,
                    })
                }
                Err(e) => {
                    tracing::debug!("Geolocation response parse failed for {}: {}", ip, e);
                    None
                }
            },
            Err(e) => {
                tracing::debug!("Geolocation lookup failed for {}: {}", ip, e);
                None
            }
        }
    }

    /// List entries for a file, newest first. Ownership is checked by the caller.
    pub async fn list_for_file(db: &Database, file_id: &str) -> Result<Vec<AccessLogEntry>> {
        let entries = sqlx::query_as(
            "SELECT * FROM access_logs WHERE file_id = ? ORDER BY viewed_at DESC, id DESC",
        )
        .bind(file_id)
        .fetch_all(db.pool())
        .await?;
        Ok(entries)
    }

    /// Count of granted entries for a file
    pub async fn granted_count(db: &Database, file_id: &str) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM access_logs WHERE file_id = ? AND outcome = 'granted'",
        )
        .bind(file_id)
        .fetch_one(db.pool())
        .await?;
        Ok(count.0)
    }
}
