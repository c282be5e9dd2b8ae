use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Stored encrypted file record
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct VaultFile {
    pub id: String,
    /// 16 random bytes, hex-encoded. The sole credential for anonymous access.
    pub token: String,
    #[serde(skip_serializing)]
    pub ciphertext_path: String,
    /// Display name only, never used as a storage path.
    pub original_name: String,
    pub mime_type: Option<String>,
    /// Plaintext size in bytes.
    pub size: i64,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub max_views: i64,
    pub age_limit_days: i64,
    pub views: i64,
    pub owner_id: String,
    /// Marked before ciphertext removal; reads must treat the file as gone.
    pub tombstoned: bool,
    pub created_at: String,
}

/// Parameters for storing a new file
#[derive(Debug, Clone)]
pub struct StoreFileRequest {
    pub original_name: String,
    pub mime_type: Option<String>,
    pub password: Option<String>,
    pub max_views: Option<i64>,
    pub age_limit_days: Option<i64>,
}

/// Upload response: the share token is all the caller needs
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub token: String,
}

/// Public file info (safe to return to anyone holding the token)
#[derive(Debug, Serialize)]
pub struct FileInfoResponse {
    pub token: String,
    pub original_name: String,
    pub size: i64,
    pub mime_type: Option<String>,
    pub has_password: bool,
    pub views: i64,
    pub max_views: i64,
    pub age_limit_days: i64,
    pub created_at: String,
}

impl From<VaultFile> for FileInfoResponse {
    fn from(file: VaultFile) -> Self {
        Self {
            token: file.token,
            original_name: file.original_name,
            size: file.size,
            mime_type: file.mime_type,
            has_password: file.password_hash.is_some(),
            views: file.views,
            max_views: file.max_views,
            age_limit_days: file.age_limit_days,
            created_at: file.created_at,
        }
    }
}

/// Upload query parameters
#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub name: String,
    pub password: Option<String>,
    pub max_views: Option<i64>,
    pub age_limit_days: Option<i64>,
}

/// Owner adjustment of a live file's expiration policy
#[derive(Debug, Deserialize)]
pub struct UpdatePolicyRequest {
    pub max_views: Option<i64>,
    pub age_limit_days: Option<i64>,
}

/// Download query parameters
#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub password: Option<String>,
}

/// Verify password request
#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub password: Option<String>,
}

/// Verify password response
#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub verified: bool,
}
