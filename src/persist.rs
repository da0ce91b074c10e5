//! Atomic on-disk persistence: every core-owned file (fund-state.json, and
//! any future writer) is replaced via temp-file + rename, never an in-place
//! write, so a crash mid-write cannot leave a torn file behind.

use std::path::Path;

use serde::Serialize;

/// Serializes `value` as pretty JSON and atomically replaces `path` with it:
/// write to `path.tmp`, `fsync`, then `rename` over the destination. Rename
/// is atomic on the same filesystem, which is why the temp file is created
/// as a sibling of `path` rather than in a system temp directory.
pub async fn write_json_atomic<T: Serialize + Sync>(path: &Path, value: &T) -> std::io::Result<()> {
    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp_path = path.with_extension("tmp");

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    use tokio::io::AsyncWriteExt;
    file.write_all(&body).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let value = Sample { a: 7, b: "x".to_string() };
        write_json_atomic(&path, &value).await.unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let read_back: Sample = serde_json::from_str(&raw).unwrap();
        assert_eq!(read_back, value);
        assert!(!dir.path().join("state.tmp").exists());
    }

    #[tokio::test]
    async fn overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_json_atomic(&path, &Sample { a: 1, b: "x".to_string() }).await.unwrap();
        write_json_atomic(&path, &Sample { a: 2, b: "y".to_string() }).await.unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let read_back: Sample = serde_json::from_str(&raw).unwrap();
        assert_eq!(read_back, Sample { a: 2, b: "y".to_string() });
    }
}
