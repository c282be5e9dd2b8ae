use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use bytes::Bytes;
use cbc::{Decryptor, Encryptor};
use futures::Stream;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;

use crate::error::{AppError, Result};

type Aes256CbcEnc = Encryptor<Aes256>;
type Aes256CbcDec = Decryptor<Aes256>;

const BLOCK_SIZE: usize = 16;
const CHUNK_SIZE: usize = 64 * 1024;

/// Streaming AES-256-CBC pipeline keyed by the process-wide master secret.
///
/// Blob format: `[16-byte random IV] || [CBC ciphertext, PKCS#7 padded]`.
/// Both directions run in constant memory regardless of file size.
pub struct StreamCipher {
    key: [u8; 32],
}

impl StreamCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Decode the 64-hex-char master secret into the AES-256 key
    pub fn from_hex_secret(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret)
            .map_err(|_| AppError::Cipher("master secret is not valid hex".to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AppError::Cipher("master secret must decode to 32 bytes".to_string()))?;
        Ok(Self::new(key))
    }

    /// Encrypt `src` into `dst`, prefixing a fresh random IV.
    ///
    /// The output is flushed and fsynced before returning, so callers may
    /// delete the plaintext on Ok. On any failure the partial output is
    /// removed and `src` is left untouched.
    pub async fn encrypt_file(&self, src: &Path, dst: &Path) -> Result<()> {
        match self.encrypt_inner(src, dst).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = fs::remove_file(dst).await;
                Err(e)
            }
        }
    }

    async fn encrypt_inner(&self, src: &Path, dst: &Path) -> Result<()> {
        let mut reader = fs::File::open(src).await?;
        let mut writer = fs::File::create(dst).await?;

        let mut iv = [0u8; BLOCK_SIZE];
        OsRng.fill_bytes(&mut iv);
        let mut enc = Aes256CbcEnc::new(&self.key.into(), &iv.into());

        writer.write_all(&iv).await?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut carry: Vec<u8> = Vec::with_capacity(BLOCK_SIZE);
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            carry.extend_from_slice(&buf[..n]);

            let full = carry.len() - carry.len() % BLOCK_SIZE;
            if full > 0 {
                let mut run: Vec<u8> = carry.drain(..full).collect();
                for block in run.chunks_exact_mut(BLOCK_SIZE) {
                    enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
                writer.write_all(&run).await?;
            }
        }

        // PKCS#7: always append padding, a full block when input is block-aligned
        let pad = (BLOCK_SIZE - carry.len() % BLOCK_SIZE) as u8;
        carry.resize(carry.len() + pad as usize, pad);
        for block in carry.chunks_exact_mut(BLOCK_SIZE) {
            enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        writer.write_all(&carry).await?;

        writer.flush().await?;
        writer.sync_all().await?;
        Ok(())
    }

    /// Decrypt `src` into `dst`, reading the leading IV.
    ///
    /// Truncated or corrupt ciphertext fails with a cipher error rather than
    /// producing garbage; the partial output is removed on failure.
    pub async fn decrypt_file(&self, src: &Path, dst: &Path) -> Result<()> {
        match self.decrypt_inner(src, dst).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = fs::remove_file(dst).await;
                Err(e)
            }
        }
    }

    async fn decrypt_inner(&self, src: &Path, dst: &Path) -> Result<()> {
        let mut reader = fs::File::open(src).await?;

        let mut iv = [0u8; BLOCK_SIZE];
        reader.read_exact(&mut iv).await.map_err(|_| {
            AppError::Cipher("ciphertext truncated: missing initialization vector".to_string())
        })?;
        let mut dec = Aes256CbcDec::new(&self.key.into(), &iv.into());

        let mut writer = fs::File::create(dst).await?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut carry: Vec<u8> = Vec::with_capacity(CHUNK_SIZE + BLOCK_SIZE);
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            carry.extend_from_slice(&buf[..n]);

            // Hold back the trailing block until EOF so padding can be stripped
            if carry.len() > BLOCK_SIZE {
                let full = (carry.len() - 1) / BLOCK_SIZE * BLOCK_SIZE;
                let mut run: Vec<u8> = carry.drain(..full).collect();
                for block in run.chunks_exact_mut(BLOCK_SIZE) {
                    dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
                writer.write_all(&run).await?;
            }
        }

        if carry.len() != BLOCK_SIZE {
            return Err(AppError::Cipher(
                "ciphertext truncated: not a whole number of cipher blocks".to_string(),
            ));
        }
        dec.decrypt_block_mut(GenericArray::from_mut_slice(&mut carry));

        let pad = carry[BLOCK_SIZE - 1] as usize;
        if pad == 0 || pad > BLOCK_SIZE || carry[BLOCK_SIZE - pad..].iter().any(|&b| b != pad as u8)
        {
            return Err(AppError::Cipher("ciphertext corrupt: invalid padding".to_string()));
        }
        writer.write_all(&carry[..BLOCK_SIZE - pad]).await?;

        writer.flush().await?;
        Ok(())
    }
}

/// Deletes a scratch file when dropped, whatever the exit path.
#[derive(Debug)]
pub struct ScratchGuard {
    path: PathBuf,
}

impl ScratchGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove scratch file {:?}: {}", self.path, e);
            }
        }
    }
}

/// Byte stream over a decrypted scratch file.
///
/// The guard removes the scratch copy when the stream is dropped, including
/// mid-download client disconnects.
#[derive(Debug)]
pub struct ScratchStream {
    inner: ReaderStream<fs::File>,
    _guard: ScratchGuard,
}

impl ScratchStream {
    pub async fn open(guard: ScratchGuard) -> Result<Self> {
        let file = fs::File::open(guard.path()).await?;
        Ok(Self {
            inner: ReaderStream::new(file),
            _guard: guard,
        })
    }
}

impl Stream for ScratchStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tempfile::tempdir;

    fn cipher() -> StreamCipher {
        StreamCipher::new([7u8; 32])
    }

    async fn round_trip(len: usize) {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("plain");
        let enc = dir.path().join("enc");
        let dec = dir.path().join("dec");

        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        fs::write(&plain, &data).await.unwrap();

        let c = cipher();
        c.encrypt_file(&plain, &enc).await.unwrap();
        c.decrypt_file(&enc, &dec).await.unwrap();

        assert_eq!(fs::read(&dec).await.unwrap(), data);

        // IV prefix plus padded ciphertext
        let ct = fs::read(&enc).await.unwrap();
        assert_eq!(ct.len(), BLOCK_SIZE + (len / BLOCK_SIZE + 1) * BLOCK_SIZE);
    }

    #[tokio::test]
    async fn round_trips_across_block_boundaries() {
        for len in [0, 1, 15, 16, 17, 100, 200_000] {
            round_trip(len).await;
        }
    }

    #[tokio::test]
    async fn fresh_iv_per_encryption() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("plain");
        fs::write(&plain, b"same plaintext every time").await.unwrap();

        let c = cipher();
        let enc1 = dir.path().join("enc1");
        let enc2 = dir.path().join("enc2");
        c.encrypt_file(&plain, &enc1).await.unwrap();
        c.encrypt_file(&plain, &enc2).await.unwrap();

        assert_ne!(fs::read(&enc1).await.unwrap(), fs::read(&enc2).await.unwrap());
    }

    #[tokio::test]
    async fn missing_iv_is_a_truncation_error() {
        let dir = tempdir().unwrap();
        let enc = dir.path().join("enc");
        let dec = dir.path().join("dec");
        fs::write(&enc, [0u8; 8]).await.unwrap();

        let err = cipher().decrypt_file(&enc, &dec).await.unwrap_err();
        assert!(matches!(err, AppError::Cipher(ref m) if m.contains("truncated")));
        assert!(!dec.exists());
    }

    #[tokio::test]
    async fn partial_block_is_a_truncation_error() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("plain");
        let enc = dir.path().join("enc");
        let dec = dir.path().join("dec");
        fs::write(&plain, [42u8; 100]).await.unwrap();

        let c = cipher();
        c.encrypt_file(&plain, &enc).await.unwrap();

        let mut ct = fs::read(&enc).await.unwrap();
        ct.truncate(ct.len() - 5);
        fs::write(&enc, &ct).await.unwrap();

        let err = c.decrypt_file(&enc, &dec).await.unwrap_err();
        assert!(matches!(err, AppError::Cipher(ref m) if m.contains("truncated")));
        assert!(!dec.exists());
    }

    #[tokio::test]
    async fn invalid_padding_is_a_corruption_error() {
        let dir = tempdir().unwrap();
        let enc = dir.path().join("enc");
        let dec = dir.path().join("dec");

        // Hand-build a blob whose final plaintext block carries pad byte 0x00
        let key = [7u8; 32];
        let iv = [9u8; BLOCK_SIZE];
        let mut block = [0u8; BLOCK_SIZE];
        Aes256CbcEnc::new(&key.into(), &iv.into())
            .encrypt_block_mut(GenericArray::from_mut_slice(&mut block));

        let mut blob = iv.to_vec();
        blob.extend_from_slice(&block);
        fs::write(&enc, &blob).await.unwrap();

        let err = cipher().decrypt_file(&enc, &dec).await.unwrap_err();
        assert!(matches!(err, AppError::Cipher(ref m) if m.contains("padding")));
        assert!(!dec.exists());
    }

    #[tokio::test]
    async fn failed_encrypt_keeps_plaintext_and_no_partial_output() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let enc = dir.path().join("enc");

        assert!(cipher().encrypt_file(&missing, &enc).await.is_err());
        assert!(!enc.exists());
    }

    #[tokio::test]
    async fn scratch_stream_yields_bytes_then_cleans_up() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        fs::write(&scratch, b"streamed contents").await.unwrap();

        let mut stream = ScratchStream::open(ScratchGuard::new(scratch.clone()))
            .await
            .unwrap();
        assert!(format!("{:?}", stream).contains("ScratchStream"));
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(out, b"streamed contents");

        drop(stream);
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn scratch_guard_cleans_up_on_early_drop() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        fs::write(&scratch, b"abandoned mid-download").await.unwrap();

        let stream = ScratchStream::open(ScratchGuard::new(scratch.clone()))
            .await
            .unwrap();
        drop(stream);
        assert!(!scratch.exists());
    }
}
