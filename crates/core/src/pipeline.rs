//! The render pipeline: download originals into the staging directory,
//! hand the staged sequence to the encoder, and keep the job record and
//! its progress subscribers in sync the whole way.
//!
//! Progress is split 50/50 between the two phases: downloading maps to
//! 0..50 (by assets attempted, failed fetches included) and encoding
//! maps to 50..100. One pipeline run holds one concurrency permit from
//! admission until exit.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::artifacts::ArtifactStore;
use crate::encoder::FrameEncoder;
use crate::immich::AssetSource;
use crate::jobs::{Job, JobRegistry, JobStatus};
use crate::options::RenderOptions;
use crate::progress::ProgressHub;

/// Shared handles every pipeline run needs.
#[derive(Clone)]
pub struct PipelineContext {
    pub registry: Arc<JobRegistry>,
    pub hub: Arc<ProgressHub>,
    pub store: Arc<ArtifactStore>,
    pub semaphore: Arc<Semaphore>,
}

impl PipelineContext {
    fn update_and_publish<F>(&self, job_id: &str, session_id: &str, f: F)
    where
        F: FnOnce(&mut Job),
    {
        if let Some(snapshot) = self.registry.update(job_id, f) {
            self.hub.publish(session_id, snapshot);
        }
    }
}

/// Drive one job from pending to a terminal status. Every exit path
/// removes the staging directory and publishes a final snapshot; the
/// job record itself stays in the registry until deleted or reaped.
pub async fn run_job<S, E>(
    ctx: PipelineContext,
    source: Arc<S>,
    encoder: Arc<E>,
    job: Job,
    asset_ids: Vec<String>,
    options: RenderOptions,
) where
    S: AssetSource,
    E: FrameEncoder,
{
    let job_id = job.id.clone();
    let session_id = job.session_id.clone();
    let cancel = job.cancel_token.clone();

    // Pending until a permit frees up. Deletion while waiting cancels
    // the token and we never start.
    let _permit = tokio::select! {
        permit = ctx.semaphore.clone().acquire_owned() => {
            match permit {
                Ok(permit) => permit,
                Err(_) => {
                    finish_error(&ctx, &job_id, &session_id, "server shutting down").await;
                    return;
                }
            }
        }
        () = cancel.cancelled() => {
            finish_cancelled(&ctx, &job_id, &session_id).await;
            return;
        }
    };

    info!(job_id = %job_id, assets = asset_ids.len(), "starting timelapse job");

    ctx.update_and_publish(&job_id, &session_id, |job| {
        job.status = JobStatus::Downloading;
    });

    if let Err(e) = ctx.store.create_staging_dir(&job_id).await {
        finish_error(&ctx, &job_id, &session_id, &e.to_string()).await;
        return;
    }

    let total = asset_ids.len() as u64;
    let mut staged: u64 = 0;
    let mut attempted: u64 = 0;
    let started = Instant::now();

    for asset_id in &asset_ids {
        if cancel.is_cancelled() {
            finish_cancelled(&ctx, &job_id, &session_id).await;
            return;
        }

        match source.fetch_original(asset_id).await {
            Ok(Some(bytes)) => {
                staged += 1;
                if let Err(e) = ctx.store.stage_frame(&job_id, staged, &bytes).await {
                    finish_error(&ctx, &job_id, &session_id, &e.to_string()).await;
                    return;
                }
            }
            Ok(None) => {
                warn!(job_id = %job_id, asset_id = %asset_id, "asset unavailable, skipping");
            }
            Err(e) => {
                warn!(job_id = %job_id, asset_id = %asset_id, error = %e, "asset fetch failed, skipping");
            }
        }

        attempted += 1;
        let progress = (attempted as f32 / total as f32) * 50.0;
        let remaining = total - attempted;
        let per_frame = started.elapsed().as_secs_f64() / attempted as f64;
        let eta = (per_frame * remaining as f64).round() as u64;

        ctx.update_and_publish(&job_id, &session_id, |job| {
            job.progress = progress;
            job.processed_frames = attempted;
            job.estimated_time_remaining = Some(eta);
        });
    }

    if staged == 0 {
        finish_error(&ctx, &job_id, &session_id, "no frames staged").await;
        return;
    }

    let plan = options.plan();
    let output_path = ctx.store.output_path(&job_id, options.format);

    ctx.update_and_publish(&job_id, &session_id, |job| {
        job.status = JobStatus::Processing;
        job.estimated_time_remaining = None;
    });

    let encode_ctx = ctx.clone();
    let encode_job_id = job_id.clone();
    let encode_session_id = session_id.clone();
    let on_progress = move |percent: f32| {
        let progress = 50.0 + percent / 2.0;
        encode_ctx.update_and_publish(&encode_job_id, &encode_session_id, |job| {
            job.progress = progress;
        });
    };

    let staging_dir = ctx.store.staging_dir(&job_id);
    let result = encoder
        .encode(
            &staging_dir,
            &output_path,
            &plan,
            staged,
            &cancel,
            &on_progress,
        )
        .await;

    ctx.store.remove_staging_dir(&job_id).await;

    match result {
        Ok(()) => {
            info!(job_id = %job_id, output = %output_path.display(), "timelapse job completed");
            ctx.update_and_publish(&job_id, &session_id, |job| {
                job.status = JobStatus::Completed;
                job.progress = 100.0;
                job.processed_frames = total;
                job.estimated_time_remaining = None;
                job.output_path = Some(output_path.clone());
            });
        }
        Err(e) => {
            // A half-written container is useless; drop it.
            ctx.store.remove_output(&output_path).await;
            if cancel.is_cancelled() {
                finish_cancelled(&ctx, &job_id, &session_id).await;
            } else {
                finish_error(&ctx, &job_id, &session_id, &e.to_string()).await;
            }
        }
    }
}

async fn finish_cancelled(ctx: &PipelineContext, job_id: &str, session_id: &str) {
    info!(job_id = %job_id, "timelapse job cancelled");
    ctx.store.remove_staging_dir(job_id).await;
    ctx.update_and_publish(job_id, session_id, |job| {
        job.status = JobStatus::Cancelled;
        job.estimated_time_remaining = None;
    });
}

async fn finish_error(ctx: &PipelineContext, job_id: &str, session_id: &str, message: &str) {
    warn!(job_id = %job_id, error = %message, "timelapse job failed");
    ctx.store.remove_staging_dir(job_id).await;
    ctx.update_and_publish(job_id, session_id, |job| {
        job.status = JobStatus::Error;
        job.error = Some(message.to_string());
        job.estimated_time_remaining = None;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::{HashMap, HashSet};
    use std::future::Future;
    use std::path::Path;
    use std::sync::Mutex;

    use anyhow::Result;
    use tokio_util::sync::CancellationToken;

    use crate::options::{
        AspectRatio, Bitrate, Codec, Format, Fps, Interpolation, Resolution,
    };

    struct MockSource {
        assets: HashMap<String, Vec<u8>>,
        failing: HashSet<String>,
    }

    impl MockSource {
        fn with_assets(ids: &[&str]) -> Self {
            Self {
                assets: ids
                    .iter()
                    .map(|id| (id.to_string(), format!("jpeg:{id}").into_bytes()))
                    .collect(),
                failing: HashSet::new(),
            }
        }

        fn failing_on(mut self, ids: &[&str]) -> Self {
            self.failing = ids.iter().map(|id| id.to_string()).collect();
            self
        }
    }

    impl AssetSource for MockSource {
        fn fetch_original(
            &self,
            asset_id: &str,
        ) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send {
            let result = if self.failing.contains(asset_id) {
                Ok(None)
            } else {
                Ok(self.assets.get(asset_id).cloned())
            };
            async move { result }
        }
    }

    /// Writes a marker output file and records how many frames were
    /// staged when the encode began.
    struct MockEncoder {
        staged_files_seen: Mutex<Option<u64>>,
    }

    impl MockEncoder {
        fn new() -> Self {
            Self {
                staged_files_seen: Mutex::new(None),
            }
        }
    }

    impl FrameEncoder for MockEncoder {
        fn encode(
            &self,
            frames_dir: &Path,
            output_path: &Path,
            _plan: &crate::options::RenderPlan,
            _staged_frames: u64,
            _cancel: &CancellationToken,
            on_progress: &(dyn Fn(f32) + Send + Sync),
        ) -> impl Future<Output = Result<()>> + Send {
            let file_count = std::fs::read_dir(frames_dir)
                .map(|entries| entries.count() as u64)
                .unwrap_or(0);
            *self.staged_files_seen.lock().unwrap() = Some(file_count);

            let output_path = output_path.to_path_buf();
            async move {
                on_progress(50.0);
                on_progress(100.0);
                std::fs::write(&output_path, b"encoded video")?;
                Ok(())
            }
        }
    }

    fn test_options() -> RenderOptions {
        RenderOptions {
            fps: Fps::new(24).unwrap(),
            resolution: Resolution::P720,
            format: Format::Mp4,
            bitrate: Bitrate::Low,
            codec: Codec::H264,
            aspect_ratio: AspectRatio::Wide,
            interpolation: Interpolation::None,
        }
    }

    fn test_context(temp: &tempfile::TempDir) -> PipelineContext {
        let output_dir = temp.path().join("out");
        let frames_dir = temp.path().join("frames");
        std::fs::create_dir_all(&output_dir).unwrap();
        std::fs::create_dir_all(&frames_dir).unwrap();

        PipelineContext {
            registry: Arc::new(JobRegistry::new()),
            hub: Arc::new(ProgressHub::new()),
            store: Arc::new(ArtifactStore::new(output_dir, frames_dir)),
            semaphore: Arc::new(Semaphore::new(2)),
        }
    }

    #[tokio::test]
    async fn job_with_all_assets_completes() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = test_context(&temp);
        let ids: Vec<String> = (0..10).map(|i| format!("asset-{i}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        let source = Arc::new(MockSource::with_assets(&id_refs));
        let encoder = Arc::new(MockEncoder::new());
        let job = ctx.registry.create("session-1", ids.len() as u64);
        let job_id = job.id.clone();

        run_job(
            ctx.clone(),
            source,
            Arc::clone(&encoder),
            job,
            ids,
            test_options(),
        )
        .await;

        let snap = ctx.registry.snapshot(&job_id).unwrap();
        assert_eq!(snap.status, JobStatus::Completed);
        assert_eq!(snap.progress, 100.0);
        assert_eq!(snap.processed_frames, 10);
        assert!(snap.error.is_none());

        assert_eq!(encoder.staged_files_seen.lock().unwrap().unwrap(), 10);
        assert!(ctx.store.output_path(&job_id, Format::Mp4).exists());
        assert!(!ctx.store.staging_dir(&job_id).exists());
    }

    #[tokio::test]
    async fn failed_fetches_are_skipped_and_sequence_stays_contiguous() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = test_context(&temp);
        let ids: Vec<String> = (0..10).map(|i| format!("asset-{i}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        let source = Arc::new(
            MockSource::with_assets(&id_refs).failing_on(&["asset-2", "asset-5", "asset-8"]),
        );
        let encoder = Arc::new(MockEncoder::new());
        let job = ctx.registry.create("session-1", ids.len() as u64);
        let job_id = job.id.clone();

        run_job(
            ctx.clone(),
            source,
            Arc::clone(&encoder),
            job,
            ids,
            test_options(),
        )
        .await;

        let snap = ctx.registry.snapshot(&job_id).unwrap();
        assert_eq!(snap.status, JobStatus::Completed);
        // All assets were attempted even though three were skipped.
        assert_eq!(snap.processed_frames, 10);
        // Gaps in the source never appear as gaps in the frame files.
        assert_eq!(encoder.staged_files_seen.lock().unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn zero_staged_frames_is_an_error_not_an_encode() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = test_context(&temp);
        let ids = vec!["a".to_string(), "b".to_string()];

        let source = Arc::new(MockSource::with_assets(&[]).failing_on(&["a", "b"]));
        let encoder = Arc::new(MockEncoder::new());
        let job = ctx.registry.create("session-1", 2);
        let job_id = job.id.clone();

        run_job(
            ctx.clone(),
            source,
            Arc::clone(&encoder),
            job,
            ids,
            test_options(),
        )
        .await;

        let snap = ctx.registry.snapshot(&job_id).unwrap();
        assert_eq!(snap.status, JobStatus::Error);
        assert!(snap.error.as_deref().unwrap().contains("no frames staged"));
        assert!(encoder.staged_files_seen.lock().unwrap().is_none());
        assert!(!ctx.store.staging_dir(&job_id).exists());
    }

    #[tokio::test]
    async fn cancellation_before_admission_ends_cancelled() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = test_context(&temp);

        // Exhaust the admission permits so the job stays pending.
        let semaphore = Arc::clone(&ctx.semaphore);
        let _held: Vec<_> = (0..2)
            .map(|_| semaphore.clone().try_acquire_owned().unwrap())
            .collect();

        let source = Arc::new(MockSource::with_assets(&["a"]));
        let encoder = Arc::new(MockEncoder::new());
        let job = ctx.registry.create("session-1", 1);
        let job_id = job.id.clone();
        job.cancel_token.cancel();

        run_job(
            ctx.clone(),
            source,
            encoder,
            job,
            vec!["a".to_string()],
            test_options(),
        )
        .await;

        let snap = ctx.registry.snapshot(&job_id).unwrap();
        assert_eq!(snap.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn published_progress_is_monotonic_until_terminal() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = test_context(&temp);
        let ids: Vec<String> = (0..5).map(|i| format!("asset-{i}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        let mut rx = ctx.hub.subscribe("session-1");

        let source = Arc::new(MockSource::with_assets(&id_refs));
        let encoder = Arc::new(MockEncoder::new());
        let job = ctx.registry.create("session-1", 5);

        run_job(ctx.clone(), source, encoder, job, ids, test_options()).await;

        let mut last = 0.0_f32;
        loop {
            let snap = rx.try_recv().expect("terminal snapshot never arrived");
            assert!(
                snap.progress >= last,
                "progress went backwards: {} -> {}",
                last,
                snap.progress
            );
            last = snap.progress;
            if snap.status.is_terminal() {
                assert_eq!(snap.status, JobStatus::Completed);
                break;
            }
        }
    }
}
