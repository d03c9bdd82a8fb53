use crate::api::AppState;
use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

const SWEEP_EVERY: Duration = Duration::from_secs(300);

/// Unreferenced blobs younger than this may still be about to be sent.
pub const ORPHAN_GRACE_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Sweep {
    pub typing_purged: usize,
    pub blobs_removed: usize,
}

/// Drop expired typing indicators and blobs nothing points to any more.
pub fn sweep(state: &AppState) -> Result<Sweep> {
    let typing_purged = state.chat.purge_expired_typing()?;
    let referenced = state.chat.referenced_blobs()?;
    let cutoff = state.chat.now() - ORPHAN_GRACE_MS;
    let blobs_removed = state.blobs.collect_orphans(&referenced, cutoff)?;
    Ok(Sweep {
        typing_purged,
        blobs_removed,
    })
}

/// Periodically run [`sweep`].
pub fn spawn(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(SWEEP_EVERY);
        loop {
            tick.tick().await;
            match sweep(&state) {
                Ok(s) if s != Sweep::default() => {
                    info!(typing = s.typing_purged, blobs = s.blobs_removed, "housekeeping")
                }
                Ok(_) => {}
                Err(e) => warn!("housekeeping failed: {e:#}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use bytes::Bytes;
    use parley_core::{BlobStore, ManualClock};
    use std::sync::Arc;

    #[tokio::test]
    async fn sweep_keeps_referenced_and_fresh_blobs() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(10_000_000));
        let config = Config::for_data_dir("127.0.0.1:9", tmp.path().to_path_buf()).unwrap();
        let state = AppState::with_clock(config, clock.clone()).unwrap();
        state.chat.upsert_user("sub_a", "alice", None).unwrap();
        let alice = parley_core::Identity::new("sub_a");

        let mut uploaded = Vec::new();
        for _ in 0..2 {
            let url = state.chat.upload_url(&alice).unwrap();
            let token = url.path_segments().unwrap().last().unwrap().to_string();
            uploaded.push(
                state
                    .blobs
                    .store(&token, "image/png", Bytes::from_static(b"png"))
                    .await
                    .unwrap(),
            );
        }
        state
            .chat
            .create_server(&alice, "Home", Some(uploaded[0]))
            .unwrap();

        assert_eq!(sweep(&state).unwrap().blobs_removed, 0);
        clock.advance(ORPHAN_GRACE_MS + 1);
        assert_eq!(sweep(&state).unwrap().blobs_removed, 1);
        assert!(state.blobs.get_url(&uploaded[0]).is_some());
        assert!(state.blobs.get_url(&uploaded[1]).is_none());
    }
}
