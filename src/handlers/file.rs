use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
    Extension, Json,
};
use futures::StreamExt;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{ApiResponse, AppError, Result};
use crate::middleware::identity::IdentityProvider;
use crate::models::{
    AccessLogEntry, DownloadQuery, FileInfoResponse, Identity, RequestMeta, StoreFileRequest,
    UpdatePolicyRequest, UploadQuery, UploadResponse, VerifyRequest, VerifyResponse,
};
use crate::services::{AccessLogService, ScratchGuard, VaultService};
use crate::AppState;

/// Upload a file
/// POST /api/v1/files?name=...&password=...&max_views=...&age_limit_days=...
///
/// The raw request body is the file content; it is spooled to scratch and
/// handed to the vault for encryption. The spool guard removes the plaintext
/// on every exit path, including a dropped connection.
pub async fn upload_file(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<ApiResponse<UploadResponse>>> {
    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let spool_path = std::path::Path::new(&state.config.storage.scratch_dir)
        .join(format!("up-{}", Uuid::new_v4()));
    let spool = ScratchGuard::new(spool_path.clone());

    let mut file = tokio::fs::File::create(&spool_path).await?;
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|e| AppError::BadRequest(format!("Failed to read upload stream: {}", e)))?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    let stored = VaultService::store(
        &state.db,
        &state.cipher,
        std::path::Path::new(&state.config.storage.blob_dir),
        &state.config.vault,
        &identity.user_id,
        StoreFileRequest {
            original_name: query.name,
            mime_type,
            password: query.password,
            max_views: query.max_views,
            age_limit_days: query.age_limit_days,
        },
        &spool_path,
    )
    .await?;

    // The vault consumed the plaintext; the guard's removal is a no-op now
    drop(spool);

    Ok(Json(ApiResponse::success(UploadResponse {
        token: stored.token,
    })))
}

/// Download a file by token
/// GET /api/v1/files/:token?password=...
pub async fn download_file(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(query): Query<DownloadQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response> {
    let meta = request_meta(&state, &headers, addr).await;

    let (file, stream) = VaultService::open(
        &state.db,
        &state.cipher,
        std::path::Path::new(&state.config.storage.scratch_dir),
        &token,
        query.password.as_deref(),
        &meta,
    )
    .await?;

    let content_type = file
        .mime_type
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let fallback_name = file.original_name.replace(['"', '\\'], "_");
    let encoded_name = urlencoding::encode(&file.original_name);

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, file.size)
        .header(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"{}\"; filename*=UTF-8''{}",
                fallback_name, encoded_name
            ),
        )
        .body(Body::from_stream(stream))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))?;

    Ok(response)
}

/// Public file info for anyone holding the token
/// GET /api/v1/files/:token/info
pub async fn file_info(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<ApiResponse<FileInfoResponse>>> {
    let info = VaultService::info(&state.db, &token).await?;
    Ok(Json(ApiResponse::success(info)))
}

/// Password pre-check without consuming a view
/// POST /api/v1/files/:token/verify
pub async fn verify_file(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<ApiResponse<VerifyResponse>>> {
    let verified = VaultService::verify(&state.db, &token, req.password.as_deref()).await?;
    Ok(Json(ApiResponse::success(VerifyResponse { verified })))
}

/// List the caller's own files
/// GET /api/v1/files
pub async fn list_my_files(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<ApiResponse<Vec<FileInfoResponse>>>> {
    let files = VaultService::list_owned(&state.db, &identity).await?;
    Ok(Json(ApiResponse::success(files)))
}

/// Adjust a file's expiration policy (owner or admin)
/// PUT /api/v1/files/:token/policy
pub async fn update_policy(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(token): Path<String>,
    Json(req): Json<UpdatePolicyRequest>,
) -> Result<Json<ApiResponse<FileInfoResponse>>> {
    let info = VaultService::update_policy(&state.db, &identity, &token, req).await?;
    Ok(Json(ApiResponse::success(info)))
}

/// List access logs for a file (owner only)
/// GET /api/v1/files/:token/logs
pub async fn list_access_logs(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(token): Path<String>,
) -> Result<Json<ApiResponse<Vec<AccessLogEntry>>>> {
    let logs = VaultService::list_logs(&state.db, &identity, &token).await?;
    Ok(Json(ApiResponse::success(logs)))
}

/// Delete a file (owner or admin)
/// DELETE /api/v1/files/:token
///
/// Authenticated explicitly because it shares a path with the anonymous
/// download route.
pub async fn delete_file(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<()>>> {
    let identity = state.identity.authenticate(&headers)?;
    VaultService::delete(&state.db, &identity, &token).await?;
    Ok(Json(ApiResponse::<()>::success_message("File deleted")))
}

/// Assemble audit context for an access attempt
async fn request_meta(state: &AppState, headers: &HeaderMap, addr: SocketAddr) -> RequestMeta {
    let ip = headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| addr.ip().to_string());

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    // Downloads are anonymous; attribute them when the caller happens to be known
    let accessed_by = state
        .identity
        .authenticate(headers)
        .ok()
        .map(|identity| identity.user_id);

    let location = AccessLogService::lookup_location(&state.config.geoip, &ip).await;

    RequestMeta {
        ip,
        user_agent,
        accessed_by,
        location,
    }
}
