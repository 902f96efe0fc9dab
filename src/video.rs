// Video probing and frame access
//
// Duration/fps/geometry come from ffprobe (JSON output); frames come from an
// ffmpeg child process writing raw gray8 video to a pipe. A short read on the
// pipe is end-of-stream, not an error: the scan loop treats it as the end of
// the video.

use std::io::Read;
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::Duration;

use serde::Deserialize;

use crate::decode::Frame;
use crate::error::{PackCamError, Result};
use crate::constants::FFPROBE_TIMEOUT_SECS;
use crate::tools;

#[derive(Debug, Clone)]
pub struct VideoInfo {
    pub duration_secs: f64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Deserialize)]
struct FFprobeOutput {
    streams: Option<Vec<FFprobeStream>>,
    format: Option<FFprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FFprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FFprobeFormat {
    duration: Option<String>,
}

/// Run ffprobe on a file and extract the stream geometry and duration.
pub fn probe(path: &Path) -> Result<VideoInfo> {
    let mut cmd = Command::new(tools::ffprobe_path());
    cmd.args([
        "-v", "quiet",
        "-print_format", "json",
        "-show_format",
        "-show_streams",
    ])
    .arg(path);

    let output = tools::run_with_timeout(cmd, Duration::from_secs(FFPROBE_TIMEOUT_SECS))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PackCamError::FFprobe(format!("ffprobe failed: {}", stderr)));
    }

    let probe_output: FFprobeOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| PackCamError::FFprobe(format!("failed to parse ffprobe output: {}", e)))?;

    let mut info = VideoInfo { duration_secs: 0.0, fps: 0.0, width: 0, height: 0 };

    if let Some(ref streams) = probe_output.streams {
        for stream in streams {
            if stream.codec_type.as_deref() == Some("video") {
                info.width = stream.width.unwrap_or(0);
                info.height = stream.height.unwrap_or(0);
                info.fps = parse_frame_rate(stream.r_frame_rate.as_deref()).unwrap_or(0.0);
                if info.duration_secs == 0.0 {
                    info.duration_secs =
                        parse_duration_secs(stream.duration.as_deref()).unwrap_or(0.0);
                }
                break;
            }
        }
    }

    if let Some(ref format) = probe_output.format {
        if info.duration_secs == 0.0 {
            info.duration_secs = parse_duration_secs(format.duration.as_deref()).unwrap_or(0.0);
        }
    }

    if info.width == 0 || info.height == 0 || info.fps <= 0.0 {
        return Err(PackCamError::FFprobe(format!(
            "no usable video stream in {}",
            path.display()
        )));
    }

    Ok(info)
}

/// Report just the duration in seconds. Used by the cut engine for clamping.
pub fn probe_duration(path: &Path) -> Result<f64> {
    Ok(probe(path)?.duration_secs)
}

/// Parse frame rate string like "30000/1001" to f64
fn parse_frame_rate(rate_str: Option<&str>) -> Option<f64> {
    let rate_str = rate_str?;
    if let Some((num, den)) = rate_str.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den > 0.0 {
            return Some(num / den);
        }
    }
    rate_str.parse().ok()
}

/// Parse duration string to seconds
fn parse_duration_secs(duration_str: Option<&str>) -> Option<f64> {
    duration_str?.parse().ok()
}

/// Sequential access to a video's frames.
pub trait FrameSource {
    /// The next frame, or None at end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Probes and opens videos. A trait so the scan and recovery paths can run
/// against synthetic frames in tests.
pub trait VideoOpener: Send + Sync {
    fn probe(&self, path: &Path) -> Result<VideoInfo>;
    fn open(
        &self,
        path: &Path,
        info: &VideoInfo,
        start_sec: Option<f64>,
    ) -> Result<Box<dyn FrameSource>>;
}

/// The production opener: ffprobe for metadata, ffmpeg pipe for frames.
pub struct FfmpegVideoOpener;

impl VideoOpener for FfmpegVideoOpener {
    fn probe(&self, path: &Path) -> Result<VideoInfo> {
        probe(path)
    }

    fn open(
        &self,
        path: &Path,
        info: &VideoInfo,
        start_sec: Option<f64>,
    ) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(FfmpegFrameSource::open(path, info, start_sec)?))
    }
}

/// Frames piped out of an ffmpeg child as raw gray8.
pub struct FfmpegFrameSource {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
}

impl FfmpegFrameSource {
    /// Open the file for sequential reading, optionally seeked to
    /// `start_sec` (input-side seek, so decoding starts at the nearest
    /// keyframe before it).
    pub fn open(path: &Path, info: &VideoInfo, start_sec: Option<f64>) -> Result<Self> {
        let mut cmd = Command::new(tools::ffmpeg_path());
        cmd.arg("-nostdin").args(["-loglevel", "error"]);

        if let Some(start) = start_sec {
            cmd.args(["-ss", &format!("{:.3}", start.max(0.0))]);
        }

        cmd.arg("-i")
            .arg(path)
            .args(["-f", "rawvideo", "-pix_fmt", "gray", "-"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| PackCamError::FFmpeg(format!("failed to start ffmpeg: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PackCamError::FFmpeg("ffmpeg stdout unavailable".to_string()))?;

        Ok(Self { child, stdout, width: info.width, height: info.height })
    }
}

impl FrameSource for FfmpegFrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let frame_len = (self.width * self.height) as usize;
        let mut data = vec![0u8; frame_len];
        let mut filled = 0;

        while filled < frame_len {
            match self.stdout.read(&mut data[filled..]) {
                Ok(0) => return Ok(None), // end of stream (or truncated tail)
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return Ok(None), // read failure ends the scan cleanly
            }
        }

        Ok(Some(Frame { width: self.width, height: self.height, data }))
    }
}

impl Drop for FfmpegFrameSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
