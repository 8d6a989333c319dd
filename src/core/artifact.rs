/// Backup artifact writing and cleanup
///
/// Artifacts are streamed to disk chunk by chunk. When the stream or the disk fails
/// the partially written artifact is removed before the error is returned.

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::path::Path;
use tokio::io::AsyncWriteExt;

use crate::core::error::BackupResult;
use crate::utils::format_bytes;

/// Write `stream` to `dest`, logging progress every `progress_every` chunks.
/// Returns the size of the written file.
pub async fn stream_to_file(
    mut stream: BoxStream<'static, BackupResult<Bytes>>,
    dest: &Path,
    label: &str,
    progress_every: usize,
) -> BackupResult<u64> {
    let result = async {
        let mut file = tokio::fs::File::create(dest).await?;
        let mut chunk_count = 0usize;
        let mut bytes_written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            chunk_count += 1;
            bytes_written += chunk.len() as u64;

            if progress_every > 0 && chunk_count % progress_every == 0 {
                tracing::info!(
                    "{}: processed {} chunks, {}",
                    label,
                    chunk_count,
                    format_bytes(bytes_written)
                );
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(tokio::fs::metadata(dest).await?.len())
    }
    .await;

    if result.is_err() {
        discard_partial(dest).await;
    }
    result
}

/// Best-effort removal of a file or directory left behind by a failed operation
pub async fn discard_partial(path: &Path) {
    let removed = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(_) => return,
    };

    match removed {
        Ok(()) => tracing::info!("Removed incomplete backup {}", path.display()),
        Err(e) => tracing::warn!("Failed to remove incomplete backup {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::BackupError;
    use futures::stream;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_stream_to_file_writes_all_chunks() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("data.tar");
        let chunks: Vec<BackupResult<Bytes>> = (0..250)
            .map(|i| Ok(Bytes::from(vec![i as u8; 4])))
            .collect();

        let size = stream_to_file(stream::iter(chunks).boxed(), &dest, "Volume data", 100)
            .await
            .unwrap();

        assert_eq!(size, 1000);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 1000);
    }

    #[tokio::test]
    async fn test_stream_failure_removes_partial_file() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("data.tar");
        let chunks: Vec<BackupResult<Bytes>> = vec![
            Ok(Bytes::from_static(b"first")),
            Err(BackupError::Runtime("connection reset".to_string())),
        ];

        let err = stream_to_file(stream::iter(chunks).boxed(), &dest, "Volume data", 100)
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::Runtime(_)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_discard_partial_handles_directories() {
        let dir = TempDir::new().unwrap();
        let dump = dir.path().join("shop_20240101_000000");
        std::fs::create_dir_all(dump.join("shop")).unwrap();
        std::fs::write(dump.join("shop").join("orders.bson"), b"x").unwrap();

        discard_partial(&dump).await;
        assert!(!dump.exists());

        // missing paths are ignored
        discard_partial(&dir.path().join("missing")).await;
    }
}
