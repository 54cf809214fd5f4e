//! Small shared helpers.

use std::path::Path;

use tokio::io::AsyncReadExt as _;
use tokio::io::AsyncSeekExt as _;

/// Reads at most the trailing `max_bytes` of a file as lossy UTF-8.
///
/// Returns `None` when the file does not exist or cannot be read; callers
/// capture log tails opportunistically.
pub async fn read_tail(path: &Path, max_bytes: u64) -> Option<String> {
    let mut file = tokio::fs::File::open(path).await.ok()?;
    let len = file.metadata().await.ok()?.len();

    if len > max_bytes {
        file.seek(std::io::SeekFrom::Start(len - max_bytes))
            .await
            .ok()?;
    }

    let mut buffer = Vec::with_capacity(len.min(max_bytes) as usize);
    file.read_to_end(&mut buffer).await.ok()?;
    Some(String::from_utf8_lossy(&buffer).into_owned())
}

/// Formats a duration in seconds as `H:MM:SS`.
pub fn format_duration(seconds: u64) -> String {
    format!(
        "{}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn durations_format_as_clock_time() {
        assert_eq!(format_duration(0), "0:00:00");
        assert_eq!(format_duration(61), "0:01:01");
        assert_eq!(format_duration(3 * 3600 + 25 * 60 + 9), "3:25:09");
    }

    #[tokio::test]
    async fn tail_reads_only_trailing_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("task.stderr");
        tokio::fs::write(&path, "prologue\nthe actual error")
            .await
            .unwrap();

        let tail = read_tail(&path, 16).await.unwrap();
        assert_eq!(tail, "the actual error");

        assert!(read_tail(&dir.path().join("absent"), 16).await.is_none());
    }
}
