use std::fmt;
use std::io;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use crate::retry::{RetryPolicy, retry_with_backoff};

/// Result of waiting for a file to stop changing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Stability {
    Stable,
    /// Still changing when the poll budget ran out.
    Unsettled,
    Vanished,
}

#[derive(Debug)]
enum Poll {
    Moving,
    Vanished,
}

impl fmt::Display for Poll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Poll::Moving => f.write_str("size or mtime still changing"),
            Poll::Vanished => f.write_str("file vanished"),
        }
    }
}

type Observation = (u64, Option<SystemTime>);

/// Poll size and mtime until two consecutive observations agree.
pub(crate) async fn stabilize(path: &Path, policy: &RetryPolicy) -> Stability {
    let previous: Mutex<Option<Observation>> = Mutex::new(None);

    let outcome = retry_with_backoff(
        policy,
        || {
            let previous = &previous;
            async move {
                let current = observe(path).await?;
                let settled = {
                    let mut last =
                        previous.lock().unwrap_or_else(PoisonError::into_inner);
                    last.replace(current) == Some(current)
                };
                if settled {
                    Ok(())
                } else {
                    Err(Poll::Moving)
                }
            }
        },
        |poll| matches!(poll, Poll::Moving),
    )
    .await;

    match outcome {
        Ok(()) => Stability::Stable,
        Err(err) => match err.last {
            Poll::Moving => Stability::Unsettled,
            Poll::Vanished => Stability::Vanished,
        },
    }
}

async fn observe(path: &Path) -> Result<Observation, Poll> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok((meta.len(), meta.modified().ok())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(Poll::Vanished),
        Err(_) => Err(Poll::Moving),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tempfile::tempdir;

    #[tokio::test(start_paused = true)]
    async fn quiet_file_is_stable() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("a.pdf");
        std::fs::write(&path, b"body").unwrap();

        let policy = RetryPolicy::polling(
            Duration::from_millis(100),
            Duration::from_secs(1),
        );
        assert_eq!(stabilize(&path, &policy).await, Stability::Stable);
    }

    /// Appends one byte every `every` until `limit` writes, or forever.
    fn spawn_writer(
        path: &Path,
        every: Duration,
        limit: Option<usize>,
    ) -> tokio::task::JoinHandle<()> {
        let path = path.to_path_buf();
        tokio::spawn(async move {
            let mut written = 0;
            while limit.is_none_or(|limit| written < limit) {
                tokio::time::sleep(every).await;
                let mut file = std::fs::OpenOptions::new()
                    .append(true)
                    .open(&path)
                    .unwrap();
                std::io::Write::write_all(&mut file, b"x").unwrap();
                written += 1;
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn growing_file_is_stable_once_the_writer_stops() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("upload.pdf");
        std::fs::write(&path, b"%PDF").unwrap();
        let writer = spawn_writer(&path, Duration::from_millis(30), Some(5));

        let policy = RetryPolicy::polling(
            Duration::from_millis(100),
            Duration::from_secs(1),
        );
        let started = tokio::time::Instant::now();
        assert_eq!(stabilize(&path, &policy).await, Stability::Stable);
        assert!(started.elapsed() >= Duration::from_millis(150));
        writer.await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 + 5);
    }

    #[tokio::test(start_paused = true)]
    async fn endless_writer_runs_out_the_timeout() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("stream.pdf");
        std::fs::write(&path, b"%PDF").unwrap();
        let writer = spawn_writer(&path, Duration::from_millis(30), None);

        let policy = RetryPolicy::polling(
            Duration::from_millis(100),
            Duration::from_secs(1),
        );
        let started = tokio::time::Instant::now();
        assert_eq!(stabilize(&path, &policy).await, Stability::Unsettled);
        assert!(started.elapsed() >= Duration::from_secs(1));
        writer.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_file_has_vanished() {
        let tmp = tempdir().unwrap();
        let policy = RetryPolicy::polling(
            Duration::from_millis(100),
            Duration::from_secs(1),
        );
        assert_eq!(
            stabilize(&tmp.path().join("gone.pdf"), &policy).await,
            Stability::Vanished
        );
    }
}
