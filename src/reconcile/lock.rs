//! Per-video mutual exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async lock per video id, created on first use.
///
/// The guard is held across the EAF and JSON writes of a commit, so two
/// requests for the same video never interleave their local writes while
/// requests for different videos proceed independently.
#[derive(Debug, Default)]
pub struct VideoLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl VideoLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, video_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(video_id.to_owned()).or_default())
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_video_is_serialized() {
        let locks = Arc::new(VideoLocks::new());
        let guard = locks.acquire("9").await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire("9").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_videos_do_not_block() {
        let locks = VideoLocks::new();
        let _first = locks.acquire("1").await;
        tokio::time::timeout(Duration::from_secs(1), locks.acquire("2"))
            .await
            .unwrap();
    }
}
