//! SHA-256 content verification.

use crate::{Result, UpdateError};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Read buffer used while hashing
const HASH_BUFFER_SIZE: usize = 8 * 1024;

/// Computes file digests and compares them to manifest values.
#[derive(Debug, Clone, Copy, Default)]
pub struct Verifier;

impl Verifier {
    /// Lowercase hex SHA-256 of the file at `path`, read incrementally.
    ///
    /// Cancellation is checked between buffer reads.
    pub fn sha256_file(path: &Path, cancel: &CancellationToken) -> Result<String> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; HASH_BUFFER_SIZE];

        loop {
            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            let count = reader.read(&mut buffer)?;
            if count == 0 {
                break;
            }
            hasher.update(&buffer[..count]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    /// Lowercase hex SHA-256 of an in-memory buffer
    pub fn sha256_bytes(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Does the file at `path` hash to `expected_hex`?
    ///
    /// The comparison is case-insensitive. A blank expected value is a caller
    /// error, never an automatic match.
    pub async fn verify(
        path: &Path,
        expected_hex: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(Self::digest_matches(path, expected_hex, cancel).await?.0)
    }

    /// Like [`Verifier::verify`], also returning the actual digest.
    pub async fn digest_matches(
        path: &Path,
        expected_hex: &str,
        cancel: &CancellationToken,
    ) -> Result<(bool, String)> {
        let expected = expected_hex.trim();
        if expected.is_empty() {
            return Err(UpdateError::Manifest(format!(
                "No expected hash supplied for {}",
                path.display()
            )));
        }

        let actual = Self::sha256_async(path.to_path_buf(), cancel.clone()).await?;
        Ok((actual.eq_ignore_ascii_case(expected), actual))
    }

    /// True when `path` exists and already carries the expected content.
    ///
    /// Missing or unreadable files simply do not match.
    pub async fn is_up_to_date(path: &Path, expected_hex: &str, cancel: &CancellationToken) -> Result<bool> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(false);
        }
        match Self::verify(path, expected_hex, cancel).await {
            Ok(matches) => Ok(matches),
            Err(UpdateError::Io(e)) => {
                tracing::debug!("Cannot hash {}: {}", path.display(), e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn sha256_async(path: PathBuf, cancel: CancellationToken) -> Result<String> {
        tokio::task::spawn_blocking(move || Self::sha256_file(&path, &cancel))
            .await
            .map_err(|e| UpdateError::Io(std::io::Error::other(e)))?
    }
}
