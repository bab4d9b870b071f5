//! FFmpeg encode of staged frames into the final video file.
//!
//! Launches an FFmpeg subprocess over the image sequence in the job's
//! staging directory, follows `-progress pipe:1` key=value output on
//! stdout to report percent complete, drains stderr into the
//! `ffmpeg_stderr` log target, and kills the child if the job's
//! cancellation token fires mid-encode.

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::options::RenderPlan;

/// Encoder seam for the render pipeline. The production implementation
/// shells out to ffmpeg; tests substitute one that writes the output
/// file directly.
pub trait FrameEncoder: Send + Sync {
    fn encode(
        &self,
        frames_dir: &Path,
        output_path: &Path,
        plan: &RenderPlan,
        staged_frames: u64,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(f32) + Send + Sync),
    ) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    binary: PathBuf,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
        }
    }
}

impl FfmpegEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn build_args(frames_dir: &Path, output_path: &Path, plan: &RenderPlan) -> Vec<String> {
        let input_pattern = frames_dir.join("frame_%06d.jpg");

        let mut args: Vec<String> = vec![
            "-framerate".into(),
            plan.input_fps.to_string(),
            "-start_number".into(),
            "1".into(),
            "-i".into(),
            input_pattern.to_string_lossy().into_owned(),
            "-vf".into(),
            plan.video_filters().join(","),
            "-c:v".into(),
            plan.codec.into(),
            "-b:v".into(),
            plan.bitrate.into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
        ];

        if plan.format == crate::options::Format::Mp4 {
            args.extend([
                "-preset".into(),
                "fast".into(),
                "-movflags".into(),
                "+faststart".into(),
            ]);
        }

        args.extend([
            "-progress".into(),
            "pipe:1".into(),
            "-nostats".into(),
            "-y".into(),
            output_path.to_string_lossy().into_owned(),
        ]);

        args
    }
}

impl FrameEncoder for FfmpegEncoder {
    fn encode(
        &self,
        frames_dir: &Path,
        output_path: &Path,
        plan: &RenderPlan,
        staged_frames: u64,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(f32) + Send + Sync),
    ) -> impl Future<Output = Result<()>> + Send {
        let args = Self::build_args(frames_dir, output_path, plan);
        let binary = self.binary.clone();
        let expected_frames = plan.expected_output_frames(staged_frames).max(1);

        async move {
            debug!(
                cmd = %format!("{} {}", binary.display(), args.join(" ")),
                "launching FFmpeg encoder"
            );

            let mut child = Command::new(&binary)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .context("failed to launch ffmpeg, is it installed?")?;

            let stdout = child
                .stdout
                .take()
                .context("failed to open ffmpeg stdout")?;
            let stderr = child
                .stderr
                .take()
                .context("failed to open ffmpeg stderr")?;

            // Keep a short tail of stderr for the error message if the
            // encode fails.
            let stderr_tail = Arc::new(Mutex::new(VecDeque::<String>::new()));
            let tail = Arc::clone(&stderr_tail);
            let stderr_task = tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.is_empty() {
                        continue;
                    }
                    debug!(target: "ffmpeg_stderr", "{}", line);
                    let mut tail = tail.lock().expect("stderr tail lock poisoned");
                    if tail.len() >= 20 {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });

            let mut stdout_lines = BufReader::new(stdout).lines();
            let mut last_percent = 0.0_f32;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        child.start_kill().context("failed to kill ffmpeg")?;
                        let _ = child.wait().await;
                        stderr_task.abort();
                        bail!("encoding cancelled");
                    }
                    line = stdout_lines.next_line() => {
                        match line.context("failed to read ffmpeg progress")? {
                            Some(line) => {
                                if let Some(percent) =
                                    parse_progress_line(&line, expected_frames)
                                {
                                    if percent > last_percent {
                                        last_percent = percent;
                                        on_progress(percent);
                                    }
                                }
                            }
                            None => break,
                        }
                    }
                }
            }

            let status = child.wait().await.context("failed to wait for ffmpeg")?;
            let _ = stderr_task.await;

            if !status.success() {
                let tail = stderr_tail
                    .lock()
                    .expect("stderr tail lock poisoned")
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("\n");
                bail!("ffmpeg exited with status {status}:\n{tail}");
            }

            on_progress(100.0);
            debug!(output = %output_path.display(), "FFmpeg encoder finished");
            Ok(())
        }
    }
}

/// Parse one line of `-progress pipe:1` output. `frame=N` yields a
/// percentage against the expected frame count; `progress=end` yields
/// 100. Every other key is ignored.
fn parse_progress_line(line: &str, expected_frames: u64) -> Option<f32> {
    let (key, value) = line.split_once('=')?;
    match key.trim() {
        "frame" => {
            let frame: u64 = value.trim().parse().ok()?;
            let percent = (frame as f32 / expected_frames as f32) * 100.0;
            Some(percent.min(100.0))
        }
        "progress" if value.trim() == "end" => Some(100.0),
        _ => None,
    }
}
