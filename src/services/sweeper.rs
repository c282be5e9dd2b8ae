use chrono::Utc;
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::db::Database;
use crate::error::Result;
use crate::models::VaultFile;
use crate::services::vault::VaultService;

/// Outcome of one sweep pass
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub reclaimed: u64,
    pub failed: u64,
}

/// Periodic reclamation of expired ciphertext and metadata.
///
/// Tombstone first (visible atomically to concurrent readers), then delete
/// the blob, then the record. Idempotent and crash-safe: a file left
/// tombstoned with a missing blob by an earlier interrupted pass is finished
/// off without error.
pub struct Sweeper {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl Sweeper {
    /// Start the periodic background task
    pub fn start(db: Database, interval: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval fires immediately; skip the startup tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match Self::run_once(&db).await {
                            Ok(stats) => {
                                tracing::info!(reclaimed = stats.reclaimed, failed = stats.failed, "Sweep completed");
                            }
                            Err(e) => {
                                tracing::error!("Sweep failed: {:?}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Sweeper stopping");
                        break;
                    }
                }
            }
        });

        Self { handle, shutdown }
    }

    /// Stop the background task and wait for it to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }

    /// One sweep pass. Failure to reclaim one file never halts the sweep.
    pub async fn run_once(db: &Database) -> Result<SweepStats> {
        let files: Vec<VaultFile> = sqlx::query_as("SELECT * FROM files")
            .fetch_all(db.pool())
            .await?;

        let now = Utc::now();
        let mut stats = SweepStats::default();

        for file in files {
            let expired = if file.tombstoned {
                // Left over from an interrupted reclaim, or expired by the evaluator
                true
            } else {
                match VaultService::is_age_expired(&file, now) {
                    Ok(expired) => expired,
                    Err(e) => {
                        tracing::error!(file_id = %file.id, "Skipping file with bad timestamp: {:?}", e);
                        stats.failed += 1;
                        continue;
                    }
                }
            };

            if !expired {
                continue;
            }

            match Self::reclaim(db, &file).await {
                Ok(()) => stats.reclaimed += 1,
                Err(e) => {
                    tracing::error!(file_id = %file.id, "Failed to reclaim file: {:?}", e);
                    stats.failed += 1;
                }
            }
        }

        Ok(stats)
    }

    /// Tombstone, delete blob, delete record, in that order
    async fn reclaim(db: &Database, file: &VaultFile) -> Result<()> {
        if !file.tombstoned {
            VaultService::tombstone(db, &file.id).await?;
        }

        match tokio::fs::remove_file(Path::new(&file.ciphertext_path)).await {
            Ok(()) => {
                tracing::debug!(file_id = %file.id, "Deleted ciphertext blob");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(file_id = %file.id, "Ciphertext blob already missing, completing metadata deletion");
            }
            Err(e) => return Err(e.into()),
        }

        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(&file.id)
            .execute(db.pool())
            .await?;

        tracing::info!(file_id = %file.id, "Reclaimed expired file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VaultConfig;
    use crate::error::AppError;
    use crate::models::{RequestMeta, StoreFileRequest};
    use crate::services::crypto::StreamCipher;
    use chrono::Duration as ChronoDuration;
    use futures::StreamExt;
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};

    struct TestVault {
        _dir: TempDir,
        db: Database,
        cipher: StreamCipher,
        blob_dir: PathBuf,
        scratch_dir: PathBuf,
    }

    async fn setup() -> TestVault {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("sweep.db").to_str().unwrap())
            .await
            .unwrap();
        db.run_migrations().await.unwrap();

        let blob_dir = dir.path().join("blobs");
        let scratch_dir = dir.path().join("scratch");
        std::fs::create_dir_all(&blob_dir).unwrap();
        std::fs::create_dir_all(&scratch_dir).unwrap();

        TestVault {
            db,
            cipher: StreamCipher::new([5u8; 32]),
            blob_dir,
            scratch_dir,
            _dir: dir,
        }
    }

    async fn store(vault: &TestVault, data: &[u8], max_views: Option<i64>) -> crate::models::VaultFile {
        let spool = vault
            .blob_dir
            .parent()
            .unwrap()
            .join(format!("upload-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&spool, data).await.unwrap();
        VaultService::store(
            &vault.db,
            &vault.cipher,
            &vault.blob_dir,
            &VaultConfig::default(),
            "owner-1",
            StoreFileRequest {
                original_name: "swept.bin".to_string(),
                mime_type: None,
                password: None,
                max_views,
                age_limit_days: None,
            },
            &spool,
        )
        .await
        .unwrap()
    }

    async fn age_out(db: &Database, file_id: &str) {
        sqlx::query("UPDATE files SET created_at = ? WHERE id = ?")
            .bind((Utc::now() - ChronoDuration::days(30)).to_rfc3339())
            .bind(file_id)
            .execute(db.pool())
            .await
            .unwrap();
    }

    async fn file_count(db: &Database) -> i64 {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files")
            .fetch_one(db.pool())
            .await
            .unwrap();
        count.0
    }

    #[tokio::test]
    async fn reclaims_age_expired_files_and_spares_fresh_ones() {
        let vault = setup().await;
        let expired = store(&vault, b"old bytes", None).await;
        let fresh = store(&vault, b"new bytes", None).await;
        age_out(&vault.db, &expired.id).await;

        let stats = Sweeper::run_once(&vault.db).await.unwrap();
        assert_eq!(stats, SweepStats { reclaimed: 1, failed: 0 });

        assert!(!Path::new(&expired.ciphertext_path).exists());
        assert!(Path::new(&fresh.ciphertext_path).exists());
        assert_eq!(file_count(&vault.db).await, 1);
    }

    #[tokio::test]
    async fn sweeping_twice_is_idempotent() {
        let vault = setup().await;
        let file = store(&vault, b"reclaim me", None).await;
        age_out(&vault.db, &file.id).await;

        let first = Sweeper::run_once(&vault.db).await.unwrap();
        assert_eq!(first.reclaimed, 1);

        let second = Sweeper::run_once(&vault.db).await.unwrap();
        assert_eq!(second, SweepStats::default());
    }

    #[tokio::test]
    async fn completes_metadata_deletion_when_blob_is_already_gone() {
        let vault = setup().await;
        let file = store(&vault, b"half reclaimed", None).await;

        // Simulate a crash between blob deletion and metadata deletion
        VaultService::tombstone(&vault.db, &file.id).await.unwrap();
        tokio::fs::remove_file(&file.ciphertext_path).await.unwrap();

        let stats = Sweeper::run_once(&vault.db).await.unwrap();
        assert_eq!(stats, SweepStats { reclaimed: 1, failed: 0 });
        assert_eq!(file_count(&vault.db).await, 0);
    }

    #[tokio::test]
    async fn reclaims_files_tombstoned_by_the_evaluator() {
        let vault = setup().await;
        let file = store(&vault, b"quota gone", Some(0)).await;

        // max_views = 0: first open tombstones it
        let err = VaultService::open(
            &vault.db,
            &vault.cipher,
            &vault.scratch_dir,
            &file.token,
            None,
            &RequestMeta::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Expired(_)));

        let stats = Sweeper::run_once(&vault.db).await.unwrap();
        assert_eq!(stats.reclaimed, 1);
        assert!(!Path::new(&file.ciphertext_path).exists());
    }

    #[tokio::test]
    async fn upload_view_out_sweep_scenario() {
        let vault = setup().await;
        let data: Vec<u8> = (0..100).map(|i| (i * 3) as u8).collect();
        let file = store(&vault, &data, Some(2)).await;

        for _ in 0..2 {
            let (_, mut stream) = VaultService::open(
                &vault.db,
                &vault.cipher,
                &vault.scratch_dir,
                &file.token,
                None,
                &RequestMeta::default(),
            )
            .await
            .unwrap();
            let mut out = Vec::new();
            while let Some(chunk) = stream.next().await {
                out.extend_from_slice(&chunk.unwrap());
            }
            assert_eq!(out, data);
        }

        // Third download: quota exhausted, file tombstoned
        let err = VaultService::open(
            &vault.db,
            &vault.cipher,
            &vault.scratch_dir,
            &file.token,
            None,
            &RequestMeta::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Expired(_)));

        // Sweep removes both ciphertext and record
        let stats = Sweeper::run_once(&vault.db).await.unwrap();
        assert_eq!(stats.reclaimed, 1);
        assert!(!Path::new(&file.ciphertext_path).exists());
        assert_eq!(file_count(&vault.db).await, 0);

        // And a later access reports NotFound, not Expired
        let err = VaultService::open(
            &vault.db,
            &vault.cipher,
            &vault.scratch_dir,
            &file.token,
            None,
            &RequestMeta::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn isolates_files_with_out_of_range_age_limits() {
        let vault = setup().await;
        let bad = store(&vault, b"unsweepable", None).await;
        let expired = store(&vault, b"old bytes", None).await;
        age_out(&vault.db, &expired.id).await;
        sqlx::query("UPDATE files SET age_limit_days = ? WHERE id = ?")
            .bind(i64::MAX)
            .bind(&bad.id)
            .execute(vault.db.pool())
            .await
            .unwrap();

        // The bad record is counted as failed; the rest of the sweep proceeds
        let stats = Sweeper::run_once(&vault.db).await.unwrap();
        assert_eq!(stats, SweepStats { reclaimed: 1, failed: 1 });
        assert!(Path::new(&bad.ciphertext_path).exists());
        assert!(!Path::new(&expired.ciphertext_path).exists());
    }

    #[tokio::test]
    async fn background_task_starts_and_stops() {
        let vault = setup().await;
        let sweeper = Sweeper::start(vault.db.clone(), Duration::from_secs(3600));
        sweeper.stop().await;
    }
}
