//! Viewport-aware prefetch scheduler for background thumbnail generation
//!
//! Visible items are requested first, then the scheduler expands outward from
//! the viewport in both directions. Starting a new job or cancelling aborts
//! the current one; generations nobody else is waiting on are dropped with it.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{ThumbnailCacheEngine, ThumbnailSource};
use crate::key::ThumbnailCacheKey;

#[derive(Debug, Clone)]
pub struct PrefetchRequest {
    pub key: ThumbnailCacheKey,
    pub source: ThumbnailSource,
}

/// Items in display order plus the range currently on screen.
#[derive(Debug, Clone)]
pub struct PrefetchJob {
    pub requests: Vec<PrefetchRequest>,
    pub viewport_start: usize,
    pub viewport_end: usize,
}

/// Progress information for a prefetch job
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrefetchProgress {
    pub total_files: usize,
    pub completed_files: usize,
    pub failed_files: usize,
    pub viewport_completed: usize,
    pub viewport_total: usize,
    pub is_cancelled: bool,
    pub is_finished: bool,
}

impl PrefetchProgress {
    pub fn completion_percentage(&self) -> f64 {
        if self.total_files == 0 {
            100.0
        } else {
            (self.completed_files as f64 / self.total_files as f64) * 100.0
        }
    }

    pub fn viewport_completion_percentage(&self) -> f64 {
        if self.viewport_total == 0 {
            100.0
        } else {
            (self.viewport_completed as f64 / self.viewport_total as f64) * 100.0
        }
    }
}

struct PrefetchJobHandle {
    progress: Arc<Mutex<PrefetchProgress>>,
    task: Option<JoinHandle<()>>,
}

/// Background prefetch scheduler for thumbnails
pub struct PrefetchScheduler {
    engine: ThumbnailCacheEngine,
    concurrency: usize,
    current_job: Mutex<Option<PrefetchJobHandle>>,
}

impl PrefetchScheduler {
    /// Requests are issued up to the engine's generation cap at a time.
    pub fn new(engine: ThumbnailCacheEngine) -> Self {
        let concurrency = engine.config().max_concurrent_generations.max(1);
        Self {
            engine,
            concurrency,
            current_job: Mutex::new(None),
        }
    }

    /// Start prefetching on the current tokio runtime, cancelling any job
    /// already running.
    pub fn start_prefetch(&self, job: PrefetchJob) {
        self.cancel_current_job();

        let viewport_end = job.viewport_end.min(job.requests.len());
        let progress = Arc::new(Mutex::new(PrefetchProgress {
            total_files: job.requests.len(),
            viewport_total: viewport_end.saturating_sub(job.viewport_start),
            ..Default::default()
        }));

        let task = tokio::spawn(execute_prefetch_job(
            self.engine.clone(),
            job,
            self.concurrency,
            Arc::clone(&progress),
        ));

        *self.current_job.lock() = Some(PrefetchJobHandle {
            progress,
            task: Some(task),
        });
    }

    /// Cancel the current prefetch job
    pub fn cancel_current_job(&self) {
        if let Some(mut handle) = self.current_job.lock().take() {
            if let Some(task) = handle.task.take() {
                task.abort();
            }
            let mut progress = handle.progress.lock();
            if !progress.is_finished {
                progress.is_cancelled = true;
            }
        }
    }

    /// Get progress of the current prefetch job
    pub fn get_progress(&self) -> Option<PrefetchProgress> {
        self.current_job
            .lock()
            .as_ref()
            .map(|handle| handle.progress.lock().clone())
    }

    /// Check if a prefetch job is currently running
    pub fn is_running(&self) -> bool {
        self.get_progress()
            .map(|p| !p.is_finished && !p.is_cancelled)
            .unwrap_or(false)
    }

    /// Wait for the current job to finish and return its final progress.
    pub async fn wait(&self) -> Option<PrefetchProgress> {
        let task = self
            .current_job
            .lock()
            .as_mut()
            .and_then(|handle| handle.task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Prefetch task failed: {}", e);
                }
            }
        }
        self.get_progress()
    }
}

impl Drop for PrefetchScheduler {
    fn drop(&mut self) {
        self.cancel_current_job();
    }
}

/// Viewport items first, then alternately one before and one after,
/// expanding outward.
pub fn priority_order(
    len: usize,
    viewport_start: usize,
    viewport_end: usize,
) -> Vec<(usize, bool)> {
    let viewport_start = viewport_start.min(len);
    let viewport_end = viewport_end.clamp(viewport_start, len);

    let mut order: Vec<(usize, bool)> =
        (viewport_start..viewport_end).map(|i| (i, true)).collect();
    let mut before = (0..viewport_start).rev();
    let mut after = viewport_end..len;
    loop {
        let mut added = false;
        if let Some(i) = before.next() {
            order.push((i, false));
            added = true;
        }
        if let Some(i) = after.next() {
            order.push((i, false));
            added = true;
        }
        if !added {
            break;
        }
    }
    order
}

async fn execute_prefetch_job(
    engine: ThumbnailCacheEngine,
    job: PrefetchJob,
    concurrency: usize,
    progress: Arc<Mutex<PrefetchProgress>>,
) {
    let order = priority_order(job.requests.len(), job.viewport_start, job.viewport_end);
    let requests = job.requests;

    let mut results = stream::iter(order)
        .map(|(index, in_viewport)| {
            let engine = engine.clone();
            let request = requests[index].clone();
            async move {
                let result = engine.get(request.key.clone(), request.source).await;
                (request.key, in_viewport, result)
            }
        })
        .buffer_unordered(concurrency);

    while let Some((key, in_viewport, result)) = results.next().await {
        let mut progress = progress.lock();
        match result {
            Ok(_) => {
                progress.completed_files += 1;
                if in_viewport {
                    progress.viewport_completed += 1;
                }
            }
            Err(e) => {
                debug!("Prefetch of {} failed: {}", key, e);
                progress.failed_files += 1;
            }
        }
    }

    progress.lock().is_finished = true;
}

/// Convenience function to create a prefetch job for a viewport
pub fn create_viewport_prefetch_job(
    requests: Vec<PrefetchRequest>,
    viewport_start: usize,
    viewport_size: usize,
) -> PrefetchJob {
    let viewport_end = (viewport_start + viewport_size).min(requests.len());

    PrefetchJob {
        requests,
        viewport_start,
        viewport_end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ThumbnailConfig;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use photo_catalog::hash_bytes;
    use std::io::Cursor;

    fn request(seed: u8) -> PrefetchRequest {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 30, Rgb([seed, 100, 200])));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        PrefetchRequest {
            key: ThumbnailCacheKey::ContentHash(hash_bytes(&bytes)),
            source: bytes.into(),
        }
    }

    fn engine(root: &std::path::Path) -> ThumbnailCacheEngine {
        ThumbnailCacheEngine::new(ThumbnailConfig {
            cache_root: root.to_path_buf(),
            ..ThumbnailConfig::default()
        })
    }

    #[test]
    fn test_prefetch_job_creation() {
        let requests: Vec<PrefetchRequest> = (0..5).map(request).collect();
        let job = create_viewport_prefetch_job(requests, 1, 2);

        assert_eq!(job.requests.len(), 5);
        assert_eq!(job.viewport_start, 1);
        assert_eq!(job.viewport_end, 3);
    }

    #[test]
    fn test_viewport_bounds() {
        let requests: Vec<PrefetchRequest> = (0..2).map(request).collect();
        // Viewport larger than the list is clamped
        let job = create_viewport_prefetch_job(requests, 0, 10);
        assert_eq!(job.viewport_end, 2);
    }

    #[test]
    fn test_priority_expands_outward() {
        assert_eq!(
            priority_order(6, 2, 4),
            vec![
                (2, true),
                (3, true),
                (1, false),
                (4, false),
                (0, false),
                (5, false)
            ]
        );
        assert_eq!(priority_order(3, 5, 9), vec![(2, false), (1, false), (0, false)]);
        assert!(priority_order(0, 0, 4).is_empty());
    }

    #[test]
    fn test_progress_calculations() {
        let progress = PrefetchProgress {
            total_files: 100,
            completed_files: 25,
            failed_files: 5,
            viewport_completed: 8,
            viewport_total: 10,
            is_cancelled: false,
            is_finished: false,
        };

        assert_eq!(progress.completion_percentage(), 25.0);
        assert_eq!(progress.viewport_completion_percentage(), 80.0);
    }

    #[tokio::test]
    async fn test_scheduler_creation() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = PrefetchScheduler::new(engine(tmp.path()));

        assert!(!scheduler.is_running());
        assert!(scheduler.get_progress().is_none());
        assert!(scheduler.wait().await.is_none());
    }

    #[tokio::test]
    async fn test_prefetch_fills_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path());
        let scheduler = PrefetchScheduler::new(engine.clone());

        let mut requests: Vec<PrefetchRequest> = (0..6).map(request).collect();
        requests.push(PrefetchRequest {
            key: ThumbnailCacheKey::PlatformLocalId("broken".into()),
            source: b"not an image".to_vec().into(),
        });
        let keys: Vec<ThumbnailCacheKey> = requests.iter().map(|r| r.key.clone()).collect();

        scheduler.start_prefetch(create_viewport_prefetch_job(requests, 2, 3));
        let progress = scheduler.wait().await.unwrap();

        assert!(progress.is_finished);
        assert_eq!(progress.completed_files, 6);
        assert_eq!(progress.failed_files, 1);
        assert_eq!(progress.viewport_completed, 3);
        for key in &keys[..6] {
            assert!(engine.has_thumbnail(key).await);
        }
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_cancel_functionality() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = PrefetchScheduler::new(engine(tmp.path()));

        let requests: Vec<PrefetchRequest> = (0..20).map(request).collect();
        scheduler.start_prefetch(create_viewport_prefetch_job(requests, 0, 4));
        scheduler.cancel_current_job();

        assert!(!scheduler.is_running());
        // The handle is released on cancel.
        assert!(scheduler.get_progress().is_none());
    }
}
