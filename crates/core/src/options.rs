//! Render options and the plan derived from them.
//!
//! Option enums use the same wire names the web client sends
//! (`"1080p"`, `"16:9"`, ...). Codec/container pairing is validated at
//! job-creation time so a bad combination is a 400, not a mid-job
//! encoder failure.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Output frame rate, restricted to the presets the client offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Fps(u32);

const SUPPORTED_FPS: [u32; 5] = [10, 15, 24, 30, 60];

impl Fps {
    pub fn new(value: u32) -> Result<Self> {
        if SUPPORTED_FPS.contains(&value) {
            Ok(Self(value))
        } else {
            bail!("unsupported fps {value} (expected one of {SUPPORTED_FPS:?})")
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for Fps {
    type Error = anyhow::Error;

    fn try_from(value: u32) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Fps> for u32 {
    fn from(fps: Fps) -> u32 {
        fps.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "4K")]
    Uhd4k,
}

impl Resolution {
    /// Base preset dimensions before aspect-ratio adjustment.
    pub fn base_dimensions(self) -> (u32, u32) {
        match self {
            Resolution::P720 => (1280, 720),
            Resolution::P1080 => (1920, 1080),
            Resolution::Uhd4k => (3840, 2160),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Mp4,
    Webm,
}

impl Format {
    pub fn extension(self) -> &'static str {
        match self {
            Format::Mp4 => "mp4",
            Format::Webm => "webm",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Format::Mp4 => "video/mp4",
            Format::Webm => "video/webm",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bitrate {
    Low,
    Medium,
    High,
}

impl Bitrate {
    /// Target bitrate string for ffmpeg's `-b:v`, per container.
    pub fn target(self, format: Format) -> &'static str {
        match (self, format) {
            (Bitrate::Low, Format::Mp4) => "1500k",
            (Bitrate::Low, Format::Webm) => "1200k",
            (Bitrate::Medium, Format::Mp4) => "4000k",
            (Bitrate::Medium, Format::Webm) => "3000k",
            (Bitrate::High, Format::Mp4) => "8000k",
            (Bitrate::High, Format::Webm) => "6000k",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    H265,
    Vp8,
    Vp9,
}

impl Codec {
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            Codec::H264 => "libx264",
            Codec::H265 => "libx265",
            Codec::Vp8 => "libvpx",
            Codec::Vp9 => "libvpx-vp9",
        }
    }

    pub fn compatible_with(self, format: Format) -> bool {
        match format {
            Format::Mp4 => matches!(self, Codec::H264 | Codec::H265),
            Format::Webm => matches!(self, Codec::Vp8 | Codec::Vp9),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "16:9")]
    Wide,
    #[serde(rename = "9:16")]
    Tall,
    #[serde(rename = "4:3")]
    Classic,
    #[serde(rename = "1:1")]
    Square,
}

impl AspectRatio {
    pub fn ratio(self) -> (u32, u32) {
        match self {
            AspectRatio::Wide => (16, 9),
            AspectRatio::Tall => (9, 16),
            AspectRatio::Classic => (4, 3),
            AspectRatio::Square => (1, 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    None,
    Linear,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderOptions {
    pub fps: Fps,
    pub resolution: Resolution,
    pub format: Format,
    pub bitrate: Bitrate,
    pub codec: Codec,
    pub aspect_ratio: AspectRatio,
    pub interpolation: Interpolation,
}

impl RenderOptions {
    /// Reject codec/container mismatches before a job is created.
    pub fn validate(&self) -> Result<()> {
        if !self.codec.compatible_with(self.format) {
            bail!(
                "codec {} is not valid for {} output",
                self.codec.ffmpeg_name(),
                self.format.extension()
            );
        }
        Ok(())
    }

    pub fn plan(&self) -> RenderPlan {
        let (width, height) = canvas_dimensions(self.resolution, self.aspect_ratio);
        let fps = self.fps.get();

        // Linear interpolation is a frame-rate-doubling hint handed to
        // ffmpeg's fps filter, not motion-compensated interpolation.
        let encoder_fps = match self.interpolation {
            Interpolation::None => None,
            Interpolation::Linear => Some(fps * 2),
        };

        RenderPlan {
            width,
            height,
            input_fps: fps,
            output_fps: fps,
            encoder_fps,
            codec: self.codec.ffmpeg_name(),
            bitrate: self.bitrate.target(self.format),
            format: self.format,
        }
    }
}

/// Parameters handed to the encoder for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPlan {
    pub width: u32,
    pub height: u32,
    pub input_fps: u32,
    pub output_fps: u32,
    /// When set, an `fps=` filter resamples to this rate (interpolation).
    pub encoder_fps: Option<u32>,
    pub codec: &'static str,
    pub bitrate: &'static str,
    pub format: Format,
}

impl RenderPlan {
    /// Video filter chain: scale to fit inside the canvas preserving the
    /// frame's own aspect, then pad to exactly fill it. Frames are never
    /// cropped or stretched.
    pub fn video_filters(&self) -> Vec<String> {
        let mut filters = vec![
            format!(
                "scale={}:{}:force_original_aspect_ratio=decrease",
                self.width, self.height
            ),
            format!(
                "pad={}:{}:(ow-iw)/2:(oh-ih)/2:black",
                self.width, self.height
            ),
        ];
        if let Some(fps) = self.encoder_fps {
            filters.push(format!("fps=fps={fps}"));
        }
        filters
    }

    /// Frames the encoder is expected to emit for a given staged count,
    /// used to turn ffmpeg's frame counter into a percentage.
    pub fn expected_output_frames(&self, staged_frames: u64) -> u64 {
        match self.encoder_fps {
            Some(fps) if self.input_fps > 0 => staged_frames * u64::from(fps / self.input_fps),
            _ => staged_frames,
        }
    }
}

/// Compute the canvas for a base preset and a target aspect ratio.
///
/// If the target aspect is wider than the base, width grows to
/// `round(base_height * ratio)`; if narrower, height grows; either way
/// the grown dimension is rounded up to an even number (chroma
/// subsampling requires even dimensions). The constrained dimension
/// always meets or exceeds the preset.
pub fn canvas_dimensions(resolution: Resolution, aspect: AspectRatio) -> (u32, u32) {
    let (base_width, base_height) = resolution.base_dimensions();
    let (ratio_w, ratio_h) = aspect.ratio();

    let target = f64::from(ratio_w) / f64::from(ratio_h);
    let base = f64::from(base_width) / f64::from(base_height);

    if target > base {
        let width = (f64::from(base_height) * target).round() as u32;
        (round_up_to_even(width), base_height)
    } else if target < base {
        let height = (f64::from(base_width) / target).round() as u32;
        (base_width, round_up_to_even(height))
    } else {
        (base_width, base_height)
    }
}

fn round_up_to_even(value: u32) -> u32 {
    if value % 2 == 0 {
        value
    } else {
        value + 1
    }
}
