use std::path::PathBuf;

use anyhow::Context;
use chrono::NaiveDateTime;
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::file::write_atomic;

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub deduplicated: bool,
}

/// Write-once archive of raw feed bodies, addressed by capture time, feed name and hash.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn relative_path(
        &self,
        captured_at: NaiveDateTime,
        feed: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let day = captured_at.format("%Y%m%d").to_string();
        let stamp = captured_at.format("%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(day)
            .join(feed)
            .join(format!("{stamp}_{content_hash}.{ext}"))
    }

    /// Stores `bytes` unless an identical payload was already archived at the same stamp.
    pub async fn archive(
        &self,
        captured_at: NaiveDateTime,
        feed: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.relative_path(captured_at, feed, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !deduplicated {
            if let Some(parent) = absolute_path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating archive directory {}", parent.display()))?;
            }
            write_atomic(&absolute_path, bytes)
                .await
                .with_context(|| format!("archiving {feed} payload"))?;
        }

        Ok(ArchivedPayload {
            content_hash,
            relative_path,
            absolute_path,
            deduplicated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ts;
    use tempfile::tempdir;

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            PayloadArchive::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn same_payload_same_second_is_deduplicated() {
        let dir = tempdir().expect("tempdir");
        let archive = PayloadArchive::new(dir.path());
        let at = ts("2024-12-17 13:58:00");

        let first = archive
            .archive(at, "odds", "json", br#"{"meetings":[]}"#)
            .await
            .expect("first archive");
        let second = archive
            .archive(at, "odds", "json", br#"{"meetings":[]}"#)
            .await
            .expect("second archive");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first
            .relative_path
            .starts_with(PathBuf::from("20241217").join("odds")));
        assert!(first.absolute_path.exists());
    }
}
