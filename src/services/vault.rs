use argon2::{
    password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
    Argon2, PasswordHash, PasswordVerifier,
};
use chrono::{DateTime, Duration, Utc};
use std::path::Path;
use uuid::Uuid;

use crate::config::VaultConfig;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{
    ensure_owner, AccessOutcome, FileInfoResponse, Identity, RequestMeta, StoreFileRequest,
    UpdatePolicyRequest, VaultFile,
};
use crate::services::access_log::AccessLogService;
use crate::services::crypto::{ScratchGuard, ScratchStream, StreamCipher};
use crate::services::token::TokenIssuer;

const TOKEN_INSERT_ATTEMPTS: usize = 10;

/// Token-gated vault over encrypted blobs: upload, policy-checked access,
/// password pre-check, owner deletion, and audit listing.
pub struct VaultService;

impl VaultService {
    /// Encrypt a spooled plaintext upload and create its File record.
    ///
    /// The plaintext is removed only after the ciphertext is durably written.
    /// On a token collision the insert is retried with a fresh token; on any
    /// insert failure the orphan ciphertext is removed.
    pub async fn store(
        db: &Database,
        cipher: &StreamCipher,
        blob_dir: &Path,
        defaults: &VaultConfig,
        owner_id: &str,
        req: StoreFileRequest,
        plaintext_path: &Path,
    ) -> Result<VaultFile> {
        if req.original_name.is_empty() {
            return Err(AppError::BadRequest("File name is required".to_string()));
        }

        let max_views = req.max_views.unwrap_or(defaults.default_max_views);
        let age_limit_days = req.age_limit_days.unwrap_or(defaults.default_age_limit_days);
        if max_views < 0 || age_limit_days < 0 {
            return Err(AppError::BadRequest(
                "max_views and age_limit_days must be >= 0".to_string(),
            ));
        }
        // Values the age arithmetic cannot represent are rejected up front
        if Duration::try_days(age_limit_days).is_none() {
            return Err(AppError::BadRequest(
                "age_limit_days is out of range".to_string(),
            ));
        }

        let password_hash = match req.password {
            Some(ref password) if !password.is_empty() => Some(Self::hash_password(password)?),
            _ => None,
        };

        let metadata = tokio::fs::metadata(plaintext_path).await?;
        let size = metadata.len() as i64;

        let blob_path = blob_dir.join(format!("enc-{}", Uuid::new_v4()));
        cipher.encrypt_file(plaintext_path, &blob_path).await?;

        // Ciphertext is fsynced; the original plaintext may now go.
        tokio::fs::remove_file(plaintext_path).await?;

        let file_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let blob_path_str = blob_path.to_string_lossy().to_string();

        let mut stored_token: Option<String> = None;
        for _ in 0..TOKEN_INSERT_ATTEMPTS {
            let candidate = TokenIssuer::issue();

            let result = sqlx::query(
                r#"
                INSERT INTO files (id, token, ciphertext_path, original_name, mime_type, size,
                                   password_hash, max_views, age_limit_days, views, owner_id,
                                   tombstoned, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, 0, ?)
                "#,
            )
            .bind(&file_id)
            .bind(&candidate)
            .bind(&blob_path_str)
            .bind(&req.original_name)
            .bind(&req.mime_type)
            .bind(size)
            .bind(&password_hash)
            .bind(max_views)
            .bind(age_limit_days)
            .bind(owner_id)
            .bind(&now)
            .execute(db.pool())
            .await;

            match result {
                Ok(_) => {
                    stored_token = Some(candidate);
                    break;
                }
                Err(e) => {
                    let is_token_conflict = match &e {
                        sqlx::Error::Database(db_err) => db_err
                            .message()
                            .contains("UNIQUE constraint failed: files.token"),
                        _ => false,
                    };
                    if is_token_conflict {
                        tracing::warn!("Token collision on insert, reissuing");
                        continue;
                    }
                    let _ = tokio::fs::remove_file(&blob_path).await;
                    return Err(e.into());
                }
            }
        }

        let token = match stored_token {
            Some(token) => token,
            None => {
                let _ = tokio::fs::remove_file(&blob_path).await;
                return Err(AppError::Internal(
                    "Failed to generate a unique access token".to_string(),
                ));
            }
        };

        let file = Self::get_visible_by_token(db, &token).await?;
        tracing::info!(file_id = %file.id, "Stored encrypted file");
        Ok(file)
    }

    /// Evaluate the access policy for a token and, when allowed, consume one
    /// view and open a decrypted stream.
    ///
    /// Order: lookup, age, view quota, password, then the conditional view
    /// increment that makes the grant atomic under concurrency. Denials are
    /// logged but never count against the quota.
    pub async fn open(
        db: &Database,
        cipher: &StreamCipher,
        scratch_dir: &Path,
        token: &str,
        password: Option<&str>,
        meta: &RequestMeta,
    ) -> Result<(VaultFile, ScratchStream)> {
        let file = Self::get_visible_by_token(db, token).await?;
        let now = Utc::now();

        if Self::is_age_expired(&file, now)? {
            Self::tombstone(db, &file.id).await?;
            AccessLogService::record(db, &file.id, meta, AccessOutcome::DeniedExpired).await?;
            return Err(AppError::Expired("File has expired".to_string()));
        }

        if file.views >= file.max_views {
            Self::tombstone(db, &file.id).await?;
            AccessLogService::record(db, &file.id, meta, AccessOutcome::DeniedQuotaExhausted)
                .await?;
            return Err(AppError::Expired("File has expired".to_string()));
        }

        if let Some(ref hash) = file.password_hash {
            let ok = match password {
                Some(candidate) => Self::verify_password(hash, candidate)?,
                None => false,
            };
            if !ok {
                AccessLogService::record(db, &file.id, meta, AccessOutcome::DeniedPassword)
                    .await?;
                return Err(AppError::Unauthorized("Incorrect password".to_string()));
            }
        }

        // Conditional increment: under concurrency only max_views requests can
        // win this update, so successful grants never exceed the quota.
        let consumed = sqlx::query(
            "UPDATE files SET views = views + 1 WHERE id = ? AND tombstoned = 0 AND views < max_views",
        )
        .bind(&file.id)
        .execute(db.pool())
        .await?;

        if consumed.rows_affected() == 0 {
            // A concurrent request took the last view, or the sweeper got here first
            sqlx::query("UPDATE files SET tombstoned = 1 WHERE id = ? AND views >= max_views")
                .bind(&file.id)
                .execute(db.pool())
                .await?;
            AccessLogService::record(db, &file.id, meta, AccessOutcome::DeniedQuotaExhausted)
                .await?;
            return Err(AppError::Expired("File has expired".to_string()));
        }

        let scratch_path = scratch_dir.join(format!("dec-{}", Uuid::new_v4()));
        let guard = ScratchGuard::new(scratch_path.clone());
        if let Err(e) = cipher
            .decrypt_file(Path::new(&file.ciphertext_path), &scratch_path)
            .await
        {
            // Refund the consumed view; a transient failure must not burn quota
            Self::refund_view(db, &file.id).await?;
            return Err(e);
        }

        // The grant is only real once its audit entry exists. If the insert
        // fails the view is handed back, same as a decrypt failure.
        if let Err(e) = AccessLogService::record(db, &file.id, meta, AccessOutcome::Granted).await {
            Self::refund_view(db, &file.id).await?;
            return Err(e);
        }

        let stream = ScratchStream::open(guard).await?;
        Ok((file, stream))
    }

    /// Password pre-check without consuming a view.
    ///
    /// Files without a password always verify. A mismatch is Unauthorized.
    pub async fn verify(db: &Database, token: &str, password: Option<&str>) -> Result<bool> {
        let file = Self::get_visible_by_token(db, token).await?;

        let hash = match file.password_hash {
            None => return Ok(true),
            Some(ref hash) => hash,
        };

        let ok = match password {
            Some(candidate) => Self::verify_password(hash, candidate)?,
            None => false,
        };
        if !ok {
            return Err(AppError::Unauthorized("Incorrect password".to_string()));
        }
        Ok(true)
    }

    /// Public metadata for anyone holding the token. Read-only: an expired
    /// file reports Expired here but is left for the evaluator or sweeper to
    /// tombstone.
    pub async fn info(db: &Database, token: &str) -> Result<FileInfoResponse> {
        let file = Self::get_visible_by_token(db, token).await?;

        if Self::is_age_expired(&file, Utc::now())? || file.views >= file.max_views {
            return Err(AppError::Expired("File has expired".to_string()));
        }

        Ok(file.into())
    }

    /// Files belonging to the caller, newest first. Tombstoned files are
    /// already gone from the owner's point of view.
    pub async fn list_owned(db: &Database, identity: &Identity) -> Result<Vec<FileInfoResponse>> {
        let files: Vec<VaultFile> = sqlx::query_as(
            "SELECT * FROM files WHERE owner_id = ? AND tombstoned = 0 ORDER BY created_at DESC",
        )
        .bind(&identity.user_id)
        .fetch_all(db.pool())
        .await?;
        Ok(files.into_iter().map(FileInfoResponse::from).collect())
    }

    /// Owner/admin adjustment of a live file's expiration policy. Consumed
    /// views are kept; only the limits change.
    pub async fn update_policy(
        db: &Database,
        identity: &Identity,
        token: &str,
        req: UpdatePolicyRequest,
    ) -> Result<FileInfoResponse> {
        let file = Self::get_visible_by_token(db, token).await?;
        ensure_owner(identity, &file.owner_id)?;

        let max_views = req.max_views.unwrap_or(file.max_views);
        let age_limit_days = req.age_limit_days.unwrap_or(file.age_limit_days);
        if max_views < 0 || age_limit_days < 0 {
            return Err(AppError::BadRequest(
                "max_views and age_limit_days must be >= 0".to_string(),
            ));
        }
        if Duration::try_days(age_limit_days).is_none() {
            return Err(AppError::BadRequest(
                "age_limit_days is out of range".to_string(),
            ));
        }

        sqlx::query(
            "UPDATE files SET max_views = ?, age_limit_days = ? WHERE id = ? AND tombstoned = 0",
        )
        .bind(max_views)
        .bind(age_limit_days)
        .bind(&file.id)
        .execute(db.pool())
        .await?;

        Self::get_visible_by_token(db, token)
            .await
            .map(FileInfoResponse::from)
    }

    /// Explicit owner/admin deletion: tombstone, then blob, then record.
    /// Access log entries are retained for audit.
    pub async fn delete(db: &Database, identity: &Identity, token: &str) -> Result<()> {
        let file = Self::get_visible_by_token(db, token).await?;
        ensure_owner(identity, &file.owner_id)?;

        Self::tombstone(db, &file.id).await?;

        if let Err(e) = tokio::fs::remove_file(&file.ciphertext_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
            tracing::warn!(file_id = %file.id, "Ciphertext blob already missing on delete");
        }

        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(&file.id)
            .execute(db.pool())
            .await?;

        tracing::info!(file_id = %file.id, "Deleted file");
        Ok(())
    }

    /// Owner-only access log listing
    pub async fn list_logs(
        db: &Database,
        identity: &Identity,
        token: &str,
    ) -> Result<Vec<crate::models::AccessLogEntry>> {
        let file = Self::get_visible_by_token(db, token).await?;
        ensure_owner(identity, &file.owner_id)?;
        AccessLogService::list_for_file(db, &file.id).await
    }

    /// Lookup by token, treating tombstoned files as already gone
    pub async fn get_visible_by_token(db: &Database, token: &str) -> Result<VaultFile> {
        let file: Option<VaultFile> = sqlx::query_as("SELECT * FROM files WHERE token = ?")
            .bind(token)
            .fetch_optional(db.pool())
            .await?;

        match file {
            Some(file) if !file.tombstoned => Ok(file),
            _ => Err(AppError::NotFound("File not found".to_string())),
        }
    }

    async fn refund_view(db: &Database, file_id: &str) -> Result<()> {
        sqlx::query("UPDATE files SET views = views - 1 WHERE id = ? AND views > 0")
            .bind(file_id)
            .execute(db.pool())
            .await?;
        Ok(())
    }

    pub(crate) async fn tombstone(db: &Database, file_id: &str) -> Result<()> {
        sqlx::query("UPDATE files SET tombstoned = 1 WHERE id = ?")
            .bind(file_id)
            .execute(db.pool())
            .await?;
        Ok(())
    }

    pub(crate) fn is_age_expired(file: &VaultFile, now: DateTime<Utc>) -> Result<bool> {
        let created = DateTime::parse_from_rfc3339(&file.created_at)
            .map_err(|e| AppError::Internal(format!("Invalid created_at timestamp: {}", e)))?;
        let limit = Duration::try_days(file.age_limit_days).ok_or_else(|| {
            AppError::Internal(format!("Age limit out of range: {}", file.age_limit_days))
        })?;
        Ok(now.signed_duration_since(created) >= limit)
    }

    fn hash_password(password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        Ok(argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AppError::Internal(format!("Password hashing failed: {}", e)))?
            .to_string())
    }

    fn verify_password(hash: &str, candidate: &str) -> Result<bool> {
        let parsed_hash = PasswordHash::new(hash)
            .map_err(|e| AppError::Internal(format!("Password hash error: {}", e)))?;
        Ok(Argon2::default()
            .verify_password(candidate.as_bytes(), &parsed_hash)
            .is_ok())
    }
}
