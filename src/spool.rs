//! Spool directory poller.
//!
//! Watches for WAV segments finalized by the transcode pipeline. The
//! pipeline writes each segment in place, so a freshly listed file may still
//! be mid-flush; a size-stability gate keeps truncated WAVs from being
//! forwarded.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A segment below this size is never considered complete.
const STABLE_MIN_BYTES: u64 = 4096;
/// Interval between size samples while waiting for stability.
const STABLE_PROBE: Duration = Duration::from_millis(120);
/// Give up on stability after this long and retry on the next scan.
const STABLE_MAX_WAIT: Duration = Duration::from_millis(1200);

/// Handle to a running poller. Dropping it stops the poll loop.
#[derive(Debug)]
pub struct SegmentPoller {
    handle: JoinHandle<()>,
}

impl SegmentPoller {
    /// Cancel the poll loop. No further segment callbacks are initiated
    /// after this returns; callbacks already in flight run to completion.
    /// Idempotent.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for SegmentPoller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Start polling `spool_dir` every `poll_interval` for files named
/// `<prefix>*.wav`. Each completed segment is handed to `on_segment` exactly
/// once, in lexicographic name order, and unlinked after the callback
/// finishes. Scan errors are logged and swallowed.
pub fn start<F, Fut>(
    spool_dir: PathBuf,
    prefix: String,
    poll_interval: Duration,
    on_segment: F,
) -> SegmentPoller
where
    F: Fn(PathBuf) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        let on_segment = Arc::new(on_segment);
        let mut seen: HashSet<String> = HashSet::new();
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = scan(&spool_dir, &prefix, &mut seen, &on_segment).await {
                warn!("spool scan failed in {}: {err}", spool_dir.display());
            }
        }
    });
    SegmentPoller { handle }
}

async fn scan<F, Fut>(
    spool_dir: &Path,
    prefix: &str,
    seen: &mut HashSet<String>,
    on_segment: &Arc<F>,
) -> std::io::Result<()>
where
    F: Fn(PathBuf) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(spool_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(prefix) && name.ends_with(".wav") && !seen.contains(&name) {
            names.push(name);
        }
    }
    names.sort();

    for name in names {
        let path = spool_dir.join(&name);
        if !wait_for_stable_size(&path).await {
            // Still being written (or vanished); retry on the next scan.
            continue;
        }
        seen.insert(name);
        let callback = Arc::clone(on_segment);
        tokio::spawn(async move {
            (*callback)(path.clone()).await;
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!("failed to unlink segment {}: {err}", path.display());
            }
        });
    }
    Ok(())
}

/// Sample the file size until it is at least [`STABLE_MIN_BYTES`] and
/// unchanged between two consecutive samples.
async fn wait_for_stable_size(path: &Path) -> bool {
    let deadline = tokio::time::Instant::now() + STABLE_MAX_WAIT;
    let mut last_size: Option<u64> = None;
    loop {
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(_) => return false,
        };
        if size >= STABLE_MIN_BYTES && last_size == Some(size) {
            return true;
        }
        last_size = Some(size);
        if tokio::time::Instant::now() + STABLE_PROBE > deadline {
            return false;
        }
        tokio::time::sleep(STABLE_PROBE).await;
    }
}
